//! Secure serial DFU protocol implementation.
//!
//! Orchestrates the object-based transfer:
//! 1. SELECT - read the remote cursor for the object type
//! 2. Resume decision - reuse an acknowledged prefix if its CRC matches
//! 3. CREATE / WRITE - stream the object in 1024-byte writes
//! 4. CRC - verify offset and checksum for the whole object
//! 5. EXECUTE - commit the object, then move to the next one

use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::config::{
    ObjectType, Opcode, MAX_RAW_DATA, MAX_SLIP_FRAME, PRN_DISABLED, RESPONSE_TIMEOUT_MS,
};
use super::packet::{
    build_request, crc32, create_payload, prn_payload, running_crc, ObjectState, Response,
    RunningCrc,
};
use super::slip::{self, SlipDecoder};
use crate::channel::Channel;
use crate::error::{LinkError, LinkResult};

/// DFU protocol handler bound to an open channel.
///
/// Creating the handler installs its own receive callback; decoded
/// response frames are queued and picked up by [`DfuProtocol::await_response`].
pub struct DfuProtocol<'a, C: Channel> {
    channel: &'a mut C,
    responses: UnboundedReceiver<Vec<u8>>,
    sending_opcode: Option<Opcode>,
    response_timeout: Duration,
}

impl<'a, C: Channel> DfuProtocol<'a, C> {
    /// Create a protocol handler with the default 500ms response timeout.
    pub fn new(channel: &'a mut C) -> Self {
        Self::with_timeout(channel, Duration::from_millis(RESPONSE_TIMEOUT_MS))
    }

    /// Create a protocol handler with a custom response timeout.
    pub fn with_timeout(channel: &'a mut C, response_timeout: Duration) -> Self {
        let (tx, responses) = mpsc::unbounded_channel();
        let mut decoder = SlipDecoder::new();

        channel.set_receive_callback(Box::new(move |bytes: &[u8]| {
            for frame in decoder.decode(bytes) {
                if frame.is_empty() {
                    continue;
                }
                log::debug!("Received frame ({} bytes)", frame.len());
                let _ = tx.send(frame);
            }
        }));

        Self {
            channel,
            responses,
            sending_opcode: None,
            response_timeout,
        }
    }

    /// SLIP-encode `[opcode, payload...]` and write it to the channel.
    pub async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> LinkResult<()> {
        if !self.channel.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let packet = slip::encode(&build_request(opcode, payload))?;

        // Single outstanding request: anything still queued is stale.
        while let Ok(stale) = self.responses.try_recv() {
            log::warn!("Discarding stale response ({} bytes)", stale.len());
        }

        self.sending_opcode = Some(opcode);
        log::debug!("Sending {:?} ({} bytes)", opcode, packet.len());
        self.channel.write(&packet).await
    }

    /// Wait for the response to the last request.
    ///
    /// Returns the response payload on success.
    pub async fn await_response(&mut self) -> LinkResult<Vec<u8>> {
        let sent = self.sending_opcode.unwrap_or(Opcode::Response);

        let frame = match tokio::time::timeout(self.response_timeout, self.responses.recv()).await
        {
            Err(_) => return Err(LinkError::Timeout { opcode: sent }),
            Ok(None) => return Err(LinkError::NotConnected),
            Ok(Some(frame)) => frame,
        };

        let response = Response::parse(&frame)?;

        if response.marker != Opcode::Response as u8 {
            log::warn!(
                "Invalid response: not a response packet (0x{:02X})",
                response.marker
            );
        }
        if response.opcode != sent as u8 {
            log::warn!(
                "Invalid response: expected opcode {:?}, received 0x{:02X}",
                sent,
                response.opcode
            );
        }

        match response.into_result(sent) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                log::error!("{}", e);
                Err(e)
            }
        }
    }

    async fn request(&mut self, opcode: Opcode, payload: &[u8]) -> LinkResult<Vec<u8>> {
        self.send(opcode, payload).await?;
        self.await_response().await
    }

    /// Read the bootloader's protocol version.
    pub async fn get_protocol_version(&mut self) -> LinkResult<u8> {
        let payload = self.request(Opcode::ProtocolVersion, &[]).await?;
        payload
            .first()
            .copied()
            .ok_or(LinkError::MalformedResponse { len: 0 })
    }

    /// Set the packet receipt notification interval.
    pub async fn set_prn(&mut self, prn: u16) -> LinkResult<()> {
        self.request(Opcode::SetPrn, &prn_payload(prn)).await?;
        Ok(())
    }

    /// Read the maximum SLIP frame size the bootloader accepts.
    pub async fn get_mtu(&mut self) -> LinkResult<u16> {
        let payload = self.request(Opcode::Mtu, &[]).await?;
        if payload.len() < 2 {
            return Err(LinkError::MalformedResponse { len: payload.len() });
        }
        Ok(u16::from_le_bytes([payload[0], payload[1]]))
    }

    /// Create an object of `size` bytes.
    pub async fn create_object(&mut self, object: ObjectType, size: u32) -> LinkResult<()> {
        self.request(Opcode::Create, &create_payload(object, size))
            .await?;
        Ok(())
    }

    /// Select an object and read its remote cursor.
    pub async fn select_object(&mut self, object: ObjectType) -> LinkResult<ObjectState> {
        let payload = self.request(Opcode::Select, &[object as u8]).await?;
        let state = ObjectState::parse_select(&payload)?;
        log::debug!("Select {:?}: {:?}", object, state);
        Ok(state)
    }

    /// Ask for offset and CRC of the selected object.
    ///
    /// `None` means the bootloader answered without a usable checksum.
    pub async fn request_checksum(&mut self) -> LinkResult<Option<ObjectState>> {
        let payload = self.request(Opcode::CalcChecksum, &[]).await?;
        Ok(ObjectState::parse_checksum(&payload))
    }

    /// Execute the selected object.
    pub async fn execute(&mut self) -> LinkResult<()> {
        self.request(Opcode::Execute, &[]).await?;
        Ok(())
    }

    /// Write raw object data. No response is awaited.
    pub async fn write(&mut self, data: &[u8]) -> LinkResult<()> {
        self.send(Opcode::Write, data).await
    }

    /// Ping; the bootloader echoes `id`.
    pub async fn ping(&mut self, id: u8) -> LinkResult<u8> {
        let payload = self.request(Opcode::Ping, &[id]).await?;
        payload
            .first()
            .copied()
            .ok_or(LinkError::MalformedResponse { len: 0 })
    }

    /// Abort the transfer in progress.
    pub async fn abort(&mut self) -> LinkResult<()> {
        self.request(Opcode::Abort, &[]).await?;
        Ok(())
    }

    /// Check that the remote speaks this protocol.
    ///
    /// Disables packet receipt notifications and compares the reported MTU
    /// against [`MAX_SLIP_FRAME`].
    pub async fn check_integrity(&mut self) -> LinkResult<bool> {
        match self.verify_protocol().await {
            Ok(()) => Ok(true),
            Err(LinkError::ProtocolMismatch { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Like [`DfuProtocol::check_integrity`], but a wrong MTU is an error
    /// carrying the reported value.
    pub async fn verify_protocol(&mut self) -> LinkResult<()> {
        self.set_prn(PRN_DISABLED).await?;
        let mtu = self.get_mtu().await?;

        if mtu as usize != MAX_SLIP_FRAME {
            log::error!("Wrong MTU: {} Expected: {}", mtu, MAX_SLIP_FRAME);
            return Err(LinkError::ProtocolMismatch {
                mtu,
                expected: MAX_SLIP_FRAME as u16,
            });
        }

        Ok(())
    }

    /// Stream `data` in 1024-byte writes, then verify the remote cursor.
    ///
    /// `crc` carries the running checksum of everything before `offset` and
    /// is advanced over `data`. Returns the new offset.
    pub async fn stream_data(
        &mut self,
        data: &[u8],
        crc: &mut RunningCrc,
        offset: u32,
    ) -> LinkResult<u32> {
        let mut offset = offset;

        for chunk in data.chunks(MAX_RAW_DATA) {
            self.write(chunk).await?;
            crc.update(chunk);
            offset += chunk.len() as u32;
        }

        let expected = crc.clone().finalize();
        let remote = self
            .request_checksum()
            .await?
            .ok_or(LinkError::MissingChecksum)?;

        if remote.crc != expected {
            log::error!(
                "CRC Error: Expect: 0x{:08X}, Received: 0x{:08X}",
                expected,
                remote.crc
            );
            return Err(LinkError::CrcMismatch {
                expected,
                actual: remote.crc,
            });
        }

        if remote.offset != offset {
            return Err(LinkError::OffsetMismatch {
                expected: offset,
                actual: remote.offset,
            });
        }

        Ok(offset)
    }

    /// Send the init packet (firmware.dat), resuming when possible.
    pub async fn send_init_packet(&mut self, packet: &[u8]) -> LinkResult<()> {
        let state = self.select_object(ObjectType::Command).await?;

        if (state.max_size as usize) < packet.len() {
            return Err(LinkError::ObjectTooLarge {
                size: packet.len(),
                max_size: state.max_size as usize,
            });
        }

        if self.try_resume_init_packet(packet, &state).await? {
            return Ok(());
        }

        log::info!("Sending init packet from the start ({} bytes)", packet.len());
        self.create_object(ObjectType::Command, packet.len() as u32)
            .await?;
        let mut crc = running_crc(&[]);
        self.stream_data(packet, &mut crc, 0).await?;
        self.execute().await
    }

    async fn try_resume_init_packet(
        &mut self,
        packet: &[u8],
        state: &ObjectState,
    ) -> LinkResult<bool> {
        let offset = state.offset as usize;
        if offset == 0 || offset > packet.len() {
            log::debug!("Nothing to resume for init packet");
            return Ok(false);
        }

        let crc = running_crc(&packet[..offset]);
        if crc.clone().finalize() != state.crc {
            log::warn!("Init packet prefix CRC differs, starting over");
            return Ok(false);
        }

        if packet.len() > offset {
            log::info!("Resuming init packet at offset {}", offset);
            let mut crc = crc;
            self.stream_data(&packet[offset..], &mut crc, state.offset)
                .await?;
        }

        self.execute().await?;
        Ok(true)
    }

    /// Send the firmware image (firmware.bin) one data object at a time.
    ///
    /// `on_progress` receives an integer percentage after every object and
    /// once more at completion.
    pub async fn send_firmware<F>(&mut self, image: &[u8], mut on_progress: F) -> LinkResult<()>
    where
        F: FnMut(u8),
    {
        let state = self.select_object(ObjectType::Data).await?;
        if state.max_size == 0 {
            return Err(LinkError::ObjectTooLarge {
                size: image.len(),
                max_size: 0,
            });
        }

        let page = state.max_size as usize;
        let len = image.len();
        let mut offset = state.offset as usize;
        let mut crc = running_crc(&[]);

        if offset != 0 {
            let prefix_matches = offset <= len && crc32(&image[..offset]) == state.crc;

            if prefix_matches {
                crc.update(&image[..offset]);
                let filled = offset % page;
                if filled != 0 && offset != len {
                    log::info!("Resuming firmware image at offset {}", offset);
                    let end = (offset + page - filled).min(len);
                    offset = self
                        .stream_data(&image[offset..end], &mut crc, offset as u32)
                        .await? as usize;
                }
                self.execute().await?;
                on_progress(percent(offset, len));
            } else {
                let rewound = rewind_offset(offset, page, len);
                log::warn!(
                    "Firmware prefix CRC differs at offset {}, rewinding to {}",
                    offset,
                    rewound
                );
                offset = rewound;
                crc.update(&image[..offset]);
            }
        }

        log::info!("Writing {} bytes, starting from {}", len, offset);
        while offset < len {
            let end = (offset + page).min(len);
            log::debug!("Sending data object [{}:{}]/{}", offset, end, len);

            self.create_object(ObjectType::Data, (end - offset) as u32)
                .await?;
            offset = self
                .stream_data(&image[offset..end], &mut crc, offset as u32)
                .await? as usize;
            self.execute().await?;

            on_progress(percent(offset, len));
        }

        on_progress(100);
        Ok(())
    }
}

/// Integer percentage of `done` over `total`.
fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u64 * 100) / total as u64) as u8
}

/// Start of the page to re-send after a prefix CRC mismatch.
///
/// A partially written page rewinds to its start; a page-aligned offset
/// rewinds one full page. The result never lies beyond the start of the
/// image's last page.
pub fn rewind_offset(offset: usize, page: usize, image_len: usize) -> usize {
    let filled = offset % page;
    let rewound = if filled != 0 {
        offset - filled
    } else {
        offset.saturating_sub(page)
    };

    let last_page_start = if image_len % page == 0 {
        image_len.saturating_sub(page)
    } else {
        image_len - image_len % page
    };

    rewound.min(last_page_start)
}
