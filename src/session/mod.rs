//! Device session orchestration.
//!
//! A [`DeviceSession`] owns the channel to one device and sequences the
//! high-level operations on it:
//! - bootloader activation and detection
//! - firmware update over DFU
//! - application console commands and text-mode file upload
//! - config / EEPROM block transfer over XMODEM
//!
//! Every failure path leaves the channel closed.

mod lock;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{noop_callback, Channel, ReceiveCallback};
use crate::dfu::config::{APPLICATION_BANNER, BOOTLOADER_FILTER, DFU_WAKE_SEQUENCE, SLIP_END};
use crate::dfu::DfuProtocol;
use crate::error::{LinkError, LinkResult};
use crate::settings::SessionSettings;
use crate::xmodem::XmodemTransfer;

pub use lock::{LockTicket, SessionLock};

/// Time for the bootloader to drain a flushed frame before DFU starts.
const SLIP_FLUSH_SETTLE: Duration = Duration::from_millis(100);

/// Time to collect the console's verdict after a file upload.
const UPLOAD_VERDICT_WAIT: Duration = Duration::from_millis(100);

/// Bytes per write during a text-mode file upload.
const UPLOAD_CHUNK_SIZE: usize = 64;

/// Result of [`DeviceSession::activate_bootloader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The application was asked to reboot into the bootloader. The device
    /// re-enumerates; call again after reconnecting.
    ActivationRequested,
    /// The bootloader is running and answered the protocol probe.
    AlreadyInBootloader,
}

/// Result of [`DeviceSession::update_firmware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Init packet and image were transferred and executed.
    Completed,
    /// The device was running the application and is rebooting into the
    /// bootloader. Retry once it has reconnected.
    ActivationRequested,
}

/// Substring between the first `{` and the last `}`, inclusive.
pub fn extract_json(recv: &str) -> String {
    match (recv.find('{'), recv.rfind('}')) {
        (Some(start), Some(end)) if start <= end => recv[start..=end].to_string(),
        _ => String::new(),
    }
}

/// Console output with prompt lines blanked, trimmed.
pub fn extract_message(recv: &str) -> String {
    recv.split('\n')
        .map(|line| {
            if line.contains(APPLICATION_BANNER) {
                ""
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Receive callback that appends everything to a shared buffer.
fn accumulator() -> (Arc<Mutex<Vec<u8>>>, ReceiveCallback) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let callback: ReceiveCallback = Box::new(move |bytes: &[u8]| {
        if let Ok(mut recv) = sink.lock() {
            recv.extend_from_slice(bytes);
        }
    });
    (buffer, callback)
}

fn take_text(buffer: &Mutex<Vec<u8>>) -> String {
    let bytes = buffer
        .lock()
        .map(|mut recv| std::mem::take(&mut *recv))
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Context object for one physical device link.
pub struct DeviceSession<C: Channel> {
    channel: C,
    settings: SessionSettings,
    lock: Arc<SessionLock>,
}

impl<C: Channel> DeviceSession<C> {
    pub fn new(channel: C, settings: SessionSettings) -> Self {
        Self {
            channel,
            settings,
            lock: Arc::new(SessionLock::new()),
        }
    }

    /// Shared handle to this session's exclusivity lock.
    ///
    /// Wrap operations with [`SessionLock::try_run`] so two of them never
    /// interleave writes on the link.
    pub fn lock(&self) -> Arc<SessionLock> {
        Arc::clone(&self.lock)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Close the channel, dropping any installed receive callback.
    pub async fn close(&mut self) -> LinkResult<()> {
        self.channel.set_receive_callback(noop_callback());
        self.channel.close().await
    }

    async fn close_quietly(&mut self) {
        if let Err(e) = self.close().await {
            log::warn!("Failed to close channel: {}", e);
        }
    }

    async fn open_application(&mut self) -> LinkResult<()> {
        if self.channel.is_connected() {
            return Ok(());
        }
        let filters = self.settings.port_filters.clone();
        self.channel
            .open(noop_callback(), self.settings.app_baud_rate, &filters)
            .await
    }

    // ========================================================================
    // Bootloader
    // ========================================================================

    /// Make sure the device is in the bootloader.
    ///
    /// Opens the channel at the probe rate, then checks for the application
    /// console banner. A running application is sent the wake sequence and
    /// the channel is closed; otherwise the DFU protocol is probed and the
    /// channel is left open for the transfer.
    pub async fn activate_bootloader(&mut self) -> LinkResult<Activation> {
        if !self.channel.is_connected() {
            let mut filters = self.settings.port_filters.clone();
            if !filters.is_empty() {
                filters.push(BOOTLOADER_FILTER);
            }

            if let Err(e) = self
                .channel
                .open(noop_callback(), self.settings.bootloader_baud_rate, &filters)
                .await
            {
                log::error!("Failed to open channel: {}", e);
                self.close_quietly().await;
                return Err(e);
            }
        }

        let running = match self.is_application_running().await {
            Ok(running) => running,
            Err(e) => {
                self.close_quietly().await;
                return Err(e);
            }
        };

        if running {
            log::info!("Application running, sending DFU wake sequence");
            let sent = self.channel.write(DFU_WAKE_SEQUENCE).await;
            self.close_quietly().await;
            sent?;
            return Ok(Activation::ActivationRequested);
        }

        match self.probe_bootloader().await {
            Ok(()) => {
                log::info!("DFU bootloader found");
                Ok(Activation::AlreadyInBootloader)
            }
            Err(e) => {
                log::error!("DFU bootloader not detected: {}", e);
                self.close_quietly().await;
                Err(e)
            }
        }
    }

    async fn probe_bootloader(&mut self) -> LinkResult<()> {
        // The banner probe left newlines in the bootloader's frame buffer.
        self.channel.write(&[SLIP_END]).await?;
        tokio::time::sleep(SLIP_FLUSH_SETTLE).await;

        let timeout = self.settings.response_timeout();
        DfuProtocol::with_timeout(&mut self.channel, timeout)
            .verify_protocol()
            .await
    }

    /// Flash `firmware` with its `init_packet`.
    ///
    /// Returns [`UpdateOutcome::ActivationRequested`] without transferring
    /// anything when the device first has to reboot into the bootloader.
    pub async fn update_firmware<F>(
        &mut self,
        firmware: &[u8],
        init_packet: &[u8],
        on_progress: F,
    ) -> LinkResult<UpdateOutcome>
    where
        F: FnMut(u8),
    {
        if self.activate_bootloader().await? == Activation::ActivationRequested {
            return Ok(UpdateOutcome::ActivationRequested);
        }

        let timeout = self.settings.response_timeout();
        let result = {
            let mut dfu = DfuProtocol::with_timeout(&mut self.channel, timeout);
            match dfu.send_init_packet(init_packet).await {
                Ok(()) => dfu.send_firmware(firmware, on_progress).await,
                Err(e) => {
                    log::error!("Failed to send init packet: {}", e);
                    Err(e)
                }
            }
        };

        let closed = self.close().await;
        result?;
        closed?;

        log::info!("Firmware update complete ({} bytes)", firmware.len());
        Ok(UpdateOutcome::Completed)
    }

    // ========================================================================
    // Application console
    // ========================================================================

    /// Send a console command and collect the reply.
    ///
    /// Writes `\n<text>\n`, gathers output for `timeout_ms`, then applies
    /// `extractor` to it. The channel stays open.
    pub async fn send_command<E>(
        &mut self,
        text: &str,
        timeout_ms: u64,
        extractor: E,
    ) -> LinkResult<String>
    where
        E: FnOnce(&str) -> String,
    {
        if let Err(e) = self.open_application().await {
            self.close_quietly().await;
            return Err(e);
        }

        let (buffer, callback) = accumulator();
        self.channel.set_receive_callback(callback);

        let written = self.channel.write(format!("\n{}\n", text).as_bytes()).await;
        if written.is_ok() {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        }
        self.channel.set_receive_callback(noop_callback());

        if let Err(e) = written {
            self.close_quietly().await;
            return Err(e);
        }

        let recv = take_text(&buffer);
        log::debug!("Console reply to {:?}: {:?}", text, recv);
        Ok(extractor(&recv))
    }

    /// [`DeviceSession::send_command`] with the configured timeout and
    /// [`extract_json`].
    pub async fn send_json_command(&mut self, text: &str) -> LinkResult<String> {
        let timeout_ms = self.settings.command_timeout_ms;
        self.send_command(text, timeout_ms, extract_json).await
    }

    /// Whether the application console answers with its prompt.
    pub async fn is_application_running(&mut self) -> LinkResult<bool> {
        let timeout_ms = self.settings.command_timeout_ms;
        let recv = self.send_command("", timeout_ms, str::to_string).await?;
        Ok(recv.contains(APPLICATION_BANNER))
    }

    pub async fn get_version(&mut self) -> LinkResult<String> {
        let timeout_ms = self.settings.command_timeout_ms;
        self.send_command("version", timeout_ms, extract_message)
            .await
    }

    /// Start BLE advertising, optionally towards bonding slot `id`.
    pub async fn start_advertise(&mut self, id: Option<u8>) -> LinkResult<()> {
        let command = match id {
            Some(id) => format!("adv {}", id),
            None => "adv".to_string(),
        };
        log::info!("{}", command);
        self.send_json_command(&command).await?;
        Ok(())
    }

    pub async fn delete_bonding(&mut self, id: u8) -> LinkResult<()> {
        log::info!("del {}", id);
        self.send_json_command(&format!("del {}", id)).await?;
        Ok(())
    }

    /// Bonding table as JSON. An unparseable reply closes the channel and
    /// yields `None`.
    pub async fn get_bonding_list(&mut self) -> LinkResult<Option<serde_json::Value>> {
        let bonds = self.send_json_command("show").await?;
        match serde_json::from_str(&bonds) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::error!("Invalid bonding list {:?}: {}", bonds, e);
                self.close_quietly().await;
                Ok(None)
            }
        }
    }

    /// Upload a text file through the console's `file` / `update` commands.
    ///
    /// Succeeds only if the console reports `Write succeed` and no failure.
    /// The channel is closed afterwards.
    pub async fn upload_file<F>(
        &mut self,
        key: &str,
        file_id: u32,
        content: &[u8],
        mut on_progress: F,
    ) -> LinkResult<()>
    where
        F: FnMut(u8),
    {
        if let Err(e) = self.open_application().await {
            self.close_quietly().await;
            return Err(e);
        }

        let (buffer, callback) = accumulator();
        self.channel.set_receive_callback(callback);
        let written = self
            .write_upload(key, file_id, content, &mut on_progress)
            .await;
        let reply = take_text(&buffer);
        self.close_quietly().await;
        written?;

        if reply.contains("Write succeed") && !reply.contains("Failed") {
            log::info!("Uploaded {} ({} bytes)", key, content.len());
            Ok(())
        } else {
            Err(LinkError::UploadRejected {
                reply: extract_message(&reply),
            })
        }
    }

    async fn write_upload<F>(
        &mut self,
        key: &str,
        file_id: u32,
        content: &[u8],
        on_progress: &mut F,
    ) -> LinkResult<()>
    where
        F: FnMut(u8),
    {
        self.channel
            .write(format!("\x03file {}\n", key).as_bytes())
            .await?;

        let delay = self.settings.upload_chunk_delay();
        let mut sent = 0usize;
        for chunk in content.chunks(UPLOAD_CHUNK_SIZE) {
            self.channel.write(chunk).await?;
            tokio::time::sleep(delay).await;
            sent += chunk.len();
            on_progress((sent * 100 / content.len()) as u8);
        }

        self.channel.write(b"\0").await?;
        self.channel
            .write(format!("\nupdate {}\n", file_id).as_bytes())
            .await?;
        tokio::time::sleep(UPLOAD_VERDICT_WAIT).await;
        Ok(())
    }

    // ========================================================================
    // Block transfer
    // ========================================================================

    /// Put the device into XMODEM receive mode with `start_command` and
    /// send `blob`.
    ///
    /// Progress is reported whenever it changes. The channel is closed when
    /// the transfer ends, successfully or not.
    pub async fn transfer_blob<F>(
        &mut self,
        start_command: &str,
        blob: &[u8],
        on_progress: F,
    ) -> LinkResult<()>
    where
        F: FnMut(u8),
    {
        if let Err(e) = self.open_application().await {
            self.close_quietly().await;
            return Err(e);
        }

        log::info!(
            "Starting block transfer: {} ({} bytes)",
            start_command,
            blob.len()
        );
        let start = format!("\n{}\n", start_command);
        let idle_timeout = self.settings.xmodem_idle_timeout();
        let result = XmodemTransfer::new(blob.to_vec())
            .run(&mut self.channel, start.as_bytes(), idle_timeout, on_progress)
            .await;

        if let Err(e) = result {
            log::error!("Block transfer failed: {}", e);
            self.close_quietly().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn write_config<F>(&mut self, blob: &[u8], on_progress: F) -> LinkResult<()>
    where
        F: FnMut(u8),
    {
        self.transfer_blob("xmodem config", blob, on_progress).await
    }

    pub async fn write_eeprom<F>(&mut self, blob: &[u8], on_progress: F) -> LinkResult<()>
    where
        F: FnMut(u8),
    {
        self.transfer_blob("xmodem eeprom", blob, on_progress).await
    }
}
