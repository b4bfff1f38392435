//! bmp-updater command line interface.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, App, AppSettings, Arg, ArgMatches,
    SubCommand,
};
use log::{debug, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use bmp_updater::channel::{list_devices, SerialChannel};
use bmp_updater::error::LinkError;
use bmp_updater::session::{extract_message, DeviceSession, UpdateOutcome};
use bmp_updater::settings::{SessionSettings, SettingsManager};
use bmp_updater::traits::SystemPortLister;

fn cli() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("PORT")
                .help("serial port to use instead of USB filter matching")
                .short("p")
                .long("port")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("SETTINGS_DIR")
                .help("directory holding session_settings.json")
                .long("settings")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Sets the logging level of verbosity, repeat for more"),
        )
        .subcommand(SubCommand::with_name("devices").about("list connected devices"))
        .subcommand(
            SubCommand::with_name("update")
                .about("flash firmware through the DFU bootloader")
                .arg(
                    Arg::with_name("FIRMWARE")
                        .help("firmware image (firmware.bin)")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("INIT_PACKET")
                        .help("init packet (firmware.dat)")
                        .required(true)
                        .index(2),
                ),
        )
        .subcommand(
            SubCommand::with_name("command")
                .about("send a console command and print the reply")
                .arg(Arg::with_name("TEXT").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("config")
                .about("write a config blob over XMODEM")
                .arg(Arg::with_name("BLOB").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("eeprom")
                .about("write an EEPROM blob over XMODEM")
                .arg(Arg::with_name("BLOB").required(true).index(1)),
        )
}

fn print_progress(percent: u8) {
    print!("\r{:3}%", percent);
    let _ = io::stdout().flush();
}

fn fail(message: String) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}

fn link_failure(e: LinkError) -> ! {
    fail(format!("[{}] {}", e.error_code(), e))
}

fn read_file(path: &str) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|e| fail(format!("cannot read {}: {}", path, e)))
}

fn load_settings(matches: &ArgMatches) -> SessionSettings {
    match matches.value_of("SETTINGS_DIR") {
        Some(dir) => SettingsManager::new(Path::new(dir))
            .load()
            .unwrap_or_else(|e| fail(e)),
        None => SessionSettings::default(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let matches = cli().get_matches();

    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("logger unavailable: {}", e);
    }

    let settings = load_settings(&matches);
    if settings.has_non_default_settings() {
        debug!("Using settings: {:?}", settings);
    }

    if matches.subcommand_matches("devices").is_some() {
        let devices = list_devices(&SystemPortLister, &settings.port_filters);
        if devices.is_empty() {
            println!("No devices found");
        }
        for device in devices {
            println!(
                "{}\t{:04X}:{:04X}\t{}",
                device.port,
                device.vid,
                device.pid,
                device.display_label()
            );
        }
        return;
    }

    let channel = match matches.value_of("PORT") {
        Some(port) => SerialChannel::with_port(port),
        None => SerialChannel::new(),
    };
    let command_timeout_ms = settings.command_timeout_ms;
    let mut session = DeviceSession::new(channel, settings);
    let lock = session.lock();

    let outcome = match matches.subcommand() {
        ("update", Some(args)) => {
            let firmware = read_file(args.value_of("FIRMWARE").unwrap_or_default());
            let init_packet = read_file(args.value_of("INIT_PACKET").unwrap_or_default());
            lock.try_run(session.update_firmware(&firmware, &init_packet, print_progress))
                .await
                .map(|result| {
                    result.map(|outcome| match outcome {
                        UpdateOutcome::Completed => println!("\nFirmware updated"),
                        UpdateOutcome::ActivationRequested => println!(
                            "Device is rebooting into the bootloader; run again once it reconnects"
                        ),
                    })
                })
        }
        ("command", Some(args)) => {
            let text = args.value_of("TEXT").unwrap_or_default();
            lock.try_run(session.send_command(text, command_timeout_ms, extract_message))
                .await
                .map(|result| result.map(|reply| println!("{}", reply)))
        }
        ("config", Some(args)) => {
            let blob = read_file(args.value_of("BLOB").unwrap_or_default());
            lock.try_run(session.write_config(&blob, print_progress))
                .await
                .map(|result| result.map(|()| println!("\nConfig written")))
        }
        ("eeprom", Some(args)) => {
            let blob = read_file(args.value_of("BLOB").unwrap_or_default());
            lock.try_run(session.write_eeprom(&blob, print_progress))
                .await
                .map(|result| result.map(|()| println!("\nEEPROM written")))
        }
        _ => return,
    };

    match outcome {
        None => fail("device is busy with another operation".to_string()),
        Some(Err(e)) => link_failure(e),
        Some(Ok(())) => {}
    }

    if let Err(e) = session.close().await {
        debug!("close after command: {}", e);
    }
}
