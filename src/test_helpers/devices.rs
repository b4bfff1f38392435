//! In-memory devices implementing [`Channel`].
//!
//! Each device answers writes synchronously through the installed receive
//! callback, the same way a reader thread would deliver bytes.

use crc::{Crc, CRC_16_XMODEM};

use crate::channel::{noop_callback, Channel, PortFilter, ReceiveCallback};
use crate::dfu::config::{ObjectType, Opcode, ResultCode, DFU_WAKE_SEQUENCE, MAX_SLIP_FRAME};
use crate::dfu::packet::crc32;
use crate::dfu::slip::{self, SlipDecoder};
use crate::error::{LinkError, LinkResult};
use crate::xmodem::{ACK, BLOCK_SIZE, EOT, NAK, SOH, START};

// ============================================================================
// DFU bootloader
// ============================================================================

/// Bootloader holding one command object and one data image.
///
/// Data bytes up to `committed` have been executed; CREATE on the data
/// object discards anything after that, like a flash page being re-erased.
pub struct SimulatedBootloader {
    pub max_size: u32,
    pub command_max_size: u32,
    pub mtu: u16,
    pub prn: Option<u16>,

    pub connected: bool,
    pub silent: bool,
    pub fail_on: Option<(Opcode, ResultCode, Option<u8>)>,
    pub echo_opcode_override: Option<u8>,
    pub corrupt_checksums: usize,
    pub misreport_offset: usize,
    pub short_checksum_payload: bool,
    pub drop_writes: usize,

    pub command: Vec<u8>,
    pub command_written: Vec<u8>,
    pub data: Vec<u8>,
    pub committed: usize,
    pub data_written: Vec<u8>,

    pub requests: Vec<Opcode>,
    pub created: Vec<(ObjectType, u32)>,
    pub executes: usize,
    pub write_sizes: Vec<usize>,
    pub opened_with: Vec<(u32, Vec<PortFilter>)>,
    pub closes: usize,

    selected: ObjectType,
    decoder: SlipDecoder,
    callback: ReceiveCallback,
}

impl SimulatedBootloader {
    /// A connected bootloader advertising `max_size` byte data objects.
    pub fn new(max_size: u32) -> Self {
        Self {
            max_size,
            command_max_size: 512,
            mtu: MAX_SLIP_FRAME as u16,
            prn: None,
            connected: true,
            silent: false,
            fail_on: None,
            echo_opcode_override: None,
            corrupt_checksums: 0,
            misreport_offset: 0,
            short_checksum_payload: false,
            drop_writes: 0,
            command: Vec::new(),
            command_written: Vec::new(),
            data: Vec::new(),
            committed: 0,
            data_written: Vec::new(),
            requests: Vec::new(),
            created: Vec::new(),
            executes: 0,
            write_sizes: Vec::new(),
            opened_with: Vec::new(),
            closes: 0,
            selected: ObjectType::Command,
            decoder: SlipDecoder::new(),
            callback: noop_callback(),
        }
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }

        let Some(opcode) = Opcode::from_byte(frame[0]) else {
            self.reply(frame[0], ResultCode::NotSupported, Vec::new());
            return;
        };
        self.requests.push(opcode);
        let args = &frame[1..];

        match opcode {
            Opcode::ProtocolVersion => self.reply(frame[0], ResultCode::Success, vec![1]),
            Opcode::SetPrn => {
                self.prn = Some(u16::from_le_bytes([args[0], args[1]]));
                self.reply(frame[0], ResultCode::Success, Vec::new());
            }
            Opcode::Mtu => {
                let mtu = self.mtu.to_le_bytes().to_vec();
                self.reply(frame[0], ResultCode::Success, mtu);
            }
            Opcode::Select => {
                self.selected = object_type(args[0]);
                let max_size = match self.selected {
                    ObjectType::Command => self.command_max_size,
                    ObjectType::Data => self.max_size,
                };
                let object = self.selected_object();
                let mut payload = max_size.to_le_bytes().to_vec();
                payload.extend_from_slice(&(object.len() as u32).to_le_bytes());
                payload.extend_from_slice(&crc32(object).to_le_bytes());
                self.reply(frame[0], ResultCode::Success, payload);
            }
            Opcode::Create => {
                self.selected = object_type(args[0]);
                let size = u32::from_le_bytes([args[1], args[2], args[3], args[4]]);
                self.created.push((self.selected, size));
                match self.selected {
                    ObjectType::Command => self.command.clear(),
                    ObjectType::Data => self.data.truncate(self.committed),
                }
                self.reply(frame[0], ResultCode::Success, Vec::new());
            }
            Opcode::Write => {
                self.write_sizes.push(args.len());
                if self.drop_writes > 0 {
                    self.drop_writes -= 1;
                    return;
                }
                match self.selected {
                    ObjectType::Command => {
                        self.command.extend_from_slice(args);
                        self.command_written.extend_from_slice(args);
                    }
                    ObjectType::Data => {
                        self.data.extend_from_slice(args);
                        self.data_written.extend_from_slice(args);
                    }
                }
            }
            Opcode::CalcChecksum => {
                let object = self.selected_object();
                let mut offset = object.len() as u32;
                let mut crc = crc32(object);
                if self.corrupt_checksums > 0 {
                    self.corrupt_checksums -= 1;
                    crc ^= 0xFFFF_FFFF;
                }
                // CRC stays correct, only the reported length is off
                if self.misreport_offset > 0 {
                    self.misreport_offset -= 1;
                    offset += 1;
                }
                let mut payload = offset.to_le_bytes().to_vec();
                if !self.short_checksum_payload {
                    payload.extend_from_slice(&crc.to_le_bytes());
                }
                self.reply(frame[0], ResultCode::Success, payload);
            }
            Opcode::Execute => {
                self.executes += 1;
                if self.selected == ObjectType::Data {
                    self.committed = self.data.len();
                }
                self.reply(frame[0], ResultCode::Success, Vec::new());
            }
            Opcode::Ping => self.reply(frame[0], ResultCode::Success, vec![args[0]]),
            Opcode::Abort => self.reply(frame[0], ResultCode::Success, Vec::new()),
            _ => self.reply(frame[0], ResultCode::NotSupported, Vec::new()),
        }
    }

    fn selected_object(&self) -> &[u8] {
        match self.selected {
            ObjectType::Command => &self.command,
            ObjectType::Data => &self.data,
        }
    }

    fn reply(&mut self, opcode: u8, result: ResultCode, payload: Vec<u8>) {
        if self.silent {
            return;
        }

        let (result, payload) = match self.fail_on {
            Some((op, code, extended)) if op as u8 == opcode => {
                (code, extended.into_iter().collect())
            }
            _ => (result, payload),
        };

        let mut frame = vec![
            Opcode::Response as u8,
            self.echo_opcode_override.unwrap_or(opcode),
            result as u8,
        ];
        frame.extend_from_slice(&payload);
        let encoded = slip::encode(&frame).unwrap();
        (self.callback)(&encoded);
    }
}

fn object_type(byte: u8) -> ObjectType {
    if byte == ObjectType::Command as u8 {
        ObjectType::Command
    } else {
        ObjectType::Data
    }
}

impl Channel for SimulatedBootloader {
    async fn open(
        &mut self,
        on_receive: ReceiveCallback,
        baud_rate: u32,
        filters: &[PortFilter],
    ) -> LinkResult<()> {
        self.opened_with.push((baud_rate, filters.to_vec()));
        self.callback = on_receive;
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.closes += 1;
        self.connected = false;
        self.callback = noop_callback();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> LinkResult<()> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        for frame in self.decoder.decode(data) {
            self.handle_frame(frame);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_receive_callback(&mut self, on_receive: ReceiveCallback) {
        self.callback = on_receive;
    }
}

// ============================================================================
// Application console
// ============================================================================

/// Application firmware with a line-oriented console.
///
/// Every newline is answered with an echo, the scripted reply for that
/// command and a fresh `bmp@> ` prompt.
pub struct ScriptedConsole {
    pub connected: bool,
    pub replies: Vec<(String, String)>,
    pub upload_reply: String,

    pub commands: Vec<String>,
    pub uploads: Vec<(String, Vec<u8>)>,
    pub writes: Vec<Vec<u8>>,
    pub wake_requested: bool,
    pub opened_with: Vec<(u32, Vec<PortFilter>)>,
    pub closes: usize,

    line: Vec<u8>,
    upload: Option<(String, Vec<u8>)>,
    callback: ReceiveCallback,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self {
            connected: false,
            replies: Vec::new(),
            upload_reply: "Write succeed".to_string(),
            commands: Vec::new(),
            uploads: Vec::new(),
            writes: Vec::new(),
            wake_requested: false,
            opened_with: Vec::new(),
            closes: 0,
            line: Vec::new(),
            upload: None,
            callback: noop_callback(),
        }
    }

    pub fn reply(mut self, command: &str, output: &str) -> Self {
        self.replies.push((command.to_string(), output.to_string()));
        self
    }

    fn handle_byte(&mut self, byte: u8) {
        if let Some((_, content)) = self.upload.as_mut() {
            if byte == 0 {
                if let Some(done) = self.upload.take() {
                    self.uploads.push(done);
                }
            } else {
                content.push(byte);
            }
            return;
        }

        match byte {
            0x03 => self.line.clear(),
            b'\n' => {
                let line = String::from_utf8_lossy(&std::mem::take(&mut self.line)).into_owned();
                self.handle_line(line.trim_end_matches('\r'));
            }
            _ => self.line.push(byte),
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            self.send("bmp@> ");
            return;
        }
        self.commands.push(line.to_string());

        if let Some(key) = line.strip_prefix("file ") {
            self.upload = Some((key.to_string(), Vec::new()));
            return;
        }

        let output = if line.starts_with("update ") {
            self.upload_reply.clone()
        } else {
            self.replies
                .iter()
                .find(|(command, _)| command == line)
                .map(|(_, output)| output.clone())
                .unwrap_or_else(|| "Unknown command".to_string())
        };
        self.send(&format!("{}\r\n{}\r\nbmp@> ", line, output));
    }

    fn send(&mut self, text: &str) {
        (self.callback)(text.as_bytes());
    }
}

impl Channel for ScriptedConsole {
    async fn open(
        &mut self,
        on_receive: ReceiveCallback,
        baud_rate: u32,
        filters: &[PortFilter],
    ) -> LinkResult<()> {
        self.opened_with.push((baud_rate, filters.to_vec()));
        self.callback = on_receive;
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.closes += 1;
        self.connected = false;
        self.callback = noop_callback();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> LinkResult<()> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.writes.push(data.to_vec());
        if data == DFU_WAKE_SEQUENCE {
            self.wake_requested = true;
            return Ok(());
        }
        for &byte in data {
            self.handle_byte(byte);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_receive_callback(&mut self, on_receive: ReceiveCallback) {
        self.callback = on_receive;
    }
}

// ============================================================================
// XMODEM receiver
// ============================================================================

static RECEIVER_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Device in XMODEM receive mode after an `xmodem ...` command.
pub struct XmodemReceiver {
    pub connected: bool,
    pub silent: bool,
    /// Sequence number whose first delivery is answered with NAK.
    pub nak_first_attempt_of: Option<u8>,

    pub commands: Vec<String>,
    pub received: Vec<u8>,
    pub packets_seen: usize,
    pub eot_seen: bool,
    pub opened_with: Vec<(u32, Vec<PortFilter>)>,
    pub closes: usize,

    expected_seq: u8,
    naked: bool,
    callback: ReceiveCallback,
}

impl XmodemReceiver {
    pub fn new() -> Self {
        Self {
            connected: false,
            silent: false,
            nak_first_attempt_of: None,
            commands: Vec::new(),
            received: Vec::new(),
            packets_seen: 0,
            eot_seen: false,
            opened_with: Vec::new(),
            closes: 0,
            expected_seq: 1,
            naked: false,
            callback: noop_callback(),
        }
    }

    fn handle_packet(&mut self, packet: &[u8]) -> u8 {
        self.packets_seen += 1;
        let seq = packet[1];
        let block = &packet[3..3 + BLOCK_SIZE];
        let crc = u16::from_be_bytes([packet[3 + BLOCK_SIZE], packet[4 + BLOCK_SIZE]]);

        if packet[2] != !seq || seq != self.expected_seq || RECEIVER_CRC16.checksum(block) != crc
        {
            return NAK;
        }
        if self.nak_first_attempt_of == Some(seq) && !self.naked {
            self.naked = true;
            return NAK;
        }

        self.received.extend_from_slice(block);
        self.expected_seq = self.expected_seq.wrapping_add(1);
        ACK
    }

    fn send(&mut self, byte: u8) {
        if !self.silent {
            (self.callback)(&[byte]);
        }
    }
}

impl Channel for XmodemReceiver {
    async fn open(
        &mut self,
        on_receive: ReceiveCallback,
        baud_rate: u32,
        filters: &[PortFilter],
    ) -> LinkResult<()> {
        self.opened_with.push((baud_rate, filters.to_vec()));
        self.callback = on_receive;
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.closes += 1;
        self.connected = false;
        self.callback = noop_callback();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> LinkResult<()> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }

        if data.len() == BLOCK_SIZE + 5 && data[0] == SOH {
            let answer = self.handle_packet(data);
            self.send(answer);
        } else if data == [EOT] {
            self.eot_seen = true;
            self.send(ACK);
        } else {
            let text = String::from_utf8_lossy(data);
            for line in text.lines().filter(|l| !l.is_empty()) {
                self.commands.push(line.to_string());
                if line.starts_with("xmodem") {
                    self.send(START);
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_receive_callback(&mut self, on_receive: ReceiveCallback) {
        self.callback = on_receive;
    }
}
