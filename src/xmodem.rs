//! XMODEM-CRC block transfer.
//!
//! The device requests the transfer by sending `'C'`. Each block is
//! `[SOH, seq, !seq, 128 data bytes, crc_hi, crc_lo]` and is acknowledged
//! before the next is sent. After the last block the sender emits EOT and
//! closes the channel once that is acknowledged.

use std::time::Duration;

use crc::{Crc, CRC_16_XMODEM};
use tokio::sync::mpsc;

use crate::channel::{noop_callback, Channel};
use crate::error::{LinkError, LinkResult};

/// Start of header.
pub const SOH: u8 = 0x01;
/// End of transmission.
pub const EOT: u8 = 0x04;
/// Positive acknowledgment.
pub const ACK: u8 = 0x06;
/// Negative acknowledgment.
pub const NAK: u8 = 0x15;
/// Padding past the end of the payload.
pub const FILL: u8 = 0x1A;
/// Receiver's request to start in CRC mode.
pub const START: u8 = b'C';
/// Data bytes per block.
pub const BLOCK_SIZE: usize = 128;

static XMODEM_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemState {
    /// Waiting for the receiver's start byte.
    Init,
    /// Blocks are in flight.
    Active,
    /// EOT sent, waiting for its acknowledgment.
    Complete,
}

/// What the driver must do in response to inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmodemAction {
    /// Write these bytes to the channel.
    Send(Vec<u8>),
    /// EOT was acknowledged; close the channel.
    Close,
}

/// Sender-side XMODEM state machine.
///
/// Purely reactive: feed it inbound bytes with [`XmodemTransfer::on_receive`]
/// and carry out the returned actions.
#[derive(Debug, Clone)]
pub struct XmodemTransfer {
    state: XmodemState,
    current_packet: u32,
    payload: Vec<u8>,
}

impl XmodemTransfer {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            state: XmodemState::Init,
            current_packet: 0,
            payload,
        }
    }

    pub fn state(&self) -> XmodemState {
        self.state
    }

    /// Zero-based index of the block currently in flight.
    pub fn current_packet(&self) -> u32 {
        self.current_packet
    }

    /// Percentage of the payload acknowledged so far.
    pub fn progress(&self) -> u8 {
        if self.payload.is_empty() {
            return 100;
        }
        let sent = self.current_packet as u64 * BLOCK_SIZE as u64;
        (sent * 100 / self.payload.len() as u64).min(100) as u8
    }

    /// Build the packet for the current block.
    pub fn make_packet(&self) -> Vec<u8> {
        let seq = (self.current_packet.wrapping_add(1) & 0xFF) as u8;
        let start = (self.current_packet as usize * BLOCK_SIZE).min(self.payload.len());
        let end = (start + BLOCK_SIZE).min(self.payload.len());

        let mut block = [FILL; BLOCK_SIZE];
        block[..end - start].copy_from_slice(&self.payload[start..end]);

        let mut packet = Vec::with_capacity(BLOCK_SIZE + 5);
        packet.push(SOH);
        packet.push(seq);
        packet.push(!seq);
        packet.extend_from_slice(&block);
        packet.extend_from_slice(&XMODEM_CRC16.checksum(&block).to_be_bytes());
        packet
    }

    /// Process inbound bytes in order, returning the actions they trigger.
    pub fn on_receive(&mut self, bytes: &[u8]) -> Vec<XmodemAction> {
        let mut actions = Vec::new();

        for &byte in bytes {
            match (self.state, byte) {
                (XmodemState::Init, START) => {
                    log::debug!("Receiver ready, sending first block");
                    self.state = XmodemState::Active;
                    actions.push(XmodemAction::Send(self.make_packet()));
                }
                (XmodemState::Active, ACK) => {
                    self.current_packet += 1;
                    if self.current_packet as usize * BLOCK_SIZE > self.payload.len() {
                        self.state = XmodemState::Complete;
                        actions.push(XmodemAction::Send(vec![EOT]));
                    } else {
                        actions.push(XmodemAction::Send(self.make_packet()));
                    }
                }
                (XmodemState::Active, NAK) => {
                    log::warn!("NAK for block {}, resending", self.current_packet + 1);
                    actions.push(XmodemAction::Send(self.make_packet()));
                }
                (XmodemState::Complete, ACK) => {
                    actions.push(XmodemAction::Close);
                }
                (XmodemState::Complete, NAK) => {
                    actions.push(XmodemAction::Send(vec![EOT]));
                }
                _ => {}
            }
        }

        actions
    }

    /// Run the transfer over an open channel.
    ///
    /// `start` is written after the receive callback is installed; it is
    /// whatever puts the remote into receive mode. The transfer fails with
    /// `TransferStalled` if the remote stays silent for `idle_timeout`.
    pub async fn run<C, F>(
        mut self,
        channel: &mut C,
        start: &[u8],
        idle_timeout: Duration,
        mut on_progress: F,
    ) -> LinkResult<()>
    where
        C: Channel,
        F: FnMut(u8),
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        channel.set_receive_callback(Box::new(move |bytes: &[u8]| {
            let _ = tx.send(bytes.to_vec());
        }));

        let result = self
            .drive(channel, &mut rx, start, idle_timeout, &mut on_progress)
            .await;

        channel.set_receive_callback(noop_callback());
        result
    }

    async fn drive<C, F>(
        &mut self,
        channel: &mut C,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        start: &[u8],
        idle_timeout: Duration,
        on_progress: &mut F,
    ) -> LinkResult<()>
    where
        C: Channel,
        F: FnMut(u8),
    {
        channel.write(start).await?;

        let mut reported = None;
        loop {
            let bytes = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(LinkError::NotConnected),
                Err(_) => {
                    return Err(LinkError::TransferStalled {
                        timeout_ms: idle_timeout.as_millis() as u64,
                    })
                }
            };

            for action in self.on_receive(&bytes) {
                match action {
                    XmodemAction::Send(packet) => channel.write(&packet).await?,
                    XmodemAction::Close => {
                        log::info!("Block transfer complete ({} bytes)", self.payload.len());
                        on_progress(100);
                        return channel.close().await;
                    }
                }
            }

            let progress = self.progress();
            if self.state != XmodemState::Init && reported != Some(progress) {
                reported = Some(progress);
                on_progress(progress);
            }
        }
    }
}
