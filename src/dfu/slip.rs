//! SLIP (Serial Line Internet Protocol) encoding and decoding.
//!
//! Implements RFC 1055 framing as used by the serial DFU transport:
//! frames carry a trailing END delimiter only.
//! See: https://datatracker.ietf.org/doc/html/rfc1055

use super::config::{MAX_SLIP_FRAME, SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};
use crate::error::{LinkError, LinkResult};

/// Encode data using SLIP framing.
///
/// Escapes any special bytes and appends the END delimiter. Fails if the
/// encoded frame would not fit in [`MAX_SLIP_FRAME`] bytes.
pub fn encode(data: &[u8]) -> LinkResult<Vec<u8>> {
    let mut encoded = Vec::with_capacity(data.len() * 2 + 1);

    for &byte in data {
        match byte {
            SLIP_END => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                encoded.push(SLIP_ESC);
                encoded.push(SLIP_ESC_ESC);
            }
            _ => encoded.push(byte),
        }
    }

    encoded.push(SLIP_END);

    if encoded.len() > MAX_SLIP_FRAME {
        return Err(LinkError::FrameTooLarge {
            size: encoded.len(),
            max_size: MAX_SLIP_FRAME,
        });
    }

    Ok(encoded)
}

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    /// Accumulating frame bytes.
    #[default]
    Decoding,
    /// The previous byte was ESC.
    EscapeReceived,
    /// A corrupt escape was seen; dropping bytes until the next END.
    Discarding,
}

/// Streaming SLIP decoder for incremental parsing.
///
/// Bytes may arrive in any chunking; the decoder only ever looks at one
/// byte at a time.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
}

impl SlipDecoder {
    /// Create a new SLIP decoder.
    pub fn new() -> Self {
        Self {
            state: DecodeState::Decoding,
            buffer: Vec::with_capacity(MAX_SLIP_FRAME),
        }
    }

    /// Feed a byte to the decoder.
    ///
    /// Returns `Some(frame)` when an END byte closes a frame. Frames that
    /// contained a corrupt escape are dropped silently.
    pub fn decode_byte(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            DecodeState::Decoding => match byte {
                SLIP_END => return Some(std::mem::take(&mut self.buffer)),
                SLIP_ESC => self.state = DecodeState::EscapeReceived,
                _ => self.buffer.push(byte),
            },
            DecodeState::EscapeReceived => match byte {
                SLIP_ESC_END => {
                    self.buffer.push(SLIP_END);
                    self.state = DecodeState::Decoding;
                }
                SLIP_ESC_ESC => {
                    self.buffer.push(SLIP_ESC);
                    self.state = DecodeState::Decoding;
                }
                _ => {
                    log::warn!("Invalid SLIP escape 0x{:02X}, discarding frame", byte);
                    self.state = DecodeState::Discarding;
                }
            },
            DecodeState::Discarding => {
                if byte == SLIP_END {
                    self.reset();
                }
            }
        }

        None
    }

    /// Feed a chunk, collecting every frame it completes.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        data.iter().filter_map(|&b| self.decode_byte(b)).collect()
    }

    /// Current decoder state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Bytes accumulated for the frame in progress.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Reset the decoder state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecodeState::Decoding;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_simple_data() {
        let encoded = encode(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(encoded, vec![0x01, 0x02, 0x03, SLIP_END]);
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]).unwrap(), vec![SLIP_END]);
    }

    #[test]
    fn test_encode_with_both_special_bytes() {
        let encoded = encode(&[SLIP_END, 0x01, SLIP_ESC]).unwrap();

        assert_eq!(
            encoded,
            vec![SLIP_ESC, SLIP_ESC_END, 0x01, SLIP_ESC, SLIP_ESC_ESC, SLIP_END]
        );
    }

    #[test]
    fn test_encode_worst_case_fits() {
        let data = vec![SLIP_END; (MAX_SLIP_FRAME - 1) / 2];
        let encoded = encode(&data).unwrap();
        assert_eq!(encoded.len(), MAX_SLIP_FRAME);
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let data = vec![SLIP_ESC; MAX_SLIP_FRAME / 2 + 1];
        let result = encode(&data);

        assert!(matches!(
            result,
            Err(LinkError::FrameTooLarge { max_size, .. }) if max_size == MAX_SLIP_FRAME
        ));
    }

    #[test]
    fn test_decoder_simple() {
        let mut decoder = SlipDecoder::new();

        assert!(decoder.decode_byte(0x01).is_none());
        assert!(decoder.decode_byte(0x02).is_none());
        assert_eq!(decoder.decode_byte(SLIP_END), Some(vec![0x01, 0x02]));
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_with_escapes() {
        let mut decoder = SlipDecoder::new();
        let frames = decoder.decode(&[
            0x01,
            SLIP_ESC,
            SLIP_ESC_END,
            SLIP_ESC,
            SLIP_ESC_ESC,
            SLIP_END,
        ]);

        assert_eq!(frames, vec![vec![0x01, SLIP_END, SLIP_ESC]]);
    }

    #[test]
    fn test_decoder_escape_state_spans_calls() {
        let mut decoder = SlipDecoder::new();

        assert!(decoder.decode(&[0x05, SLIP_ESC]).is_empty());
        assert_eq!(decoder.state(), DecodeState::EscapeReceived);
        assert_eq!(decoder.decode(&[SLIP_ESC_END, SLIP_END]), vec![vec![0x05, SLIP_END]]);
    }

    #[test]
    fn test_decoder_discards_corrupt_frame() {
        let mut decoder = SlipDecoder::new();

        assert!(decoder.decode(&[0x01, SLIP_ESC, 0xFF, 0x02]).is_empty());
        assert_eq!(decoder.state(), DecodeState::Discarding);

        // END closes the corrupt frame without surfacing it
        assert!(decoder.decode_byte(SLIP_END).is_none());
        assert_eq!(decoder.state(), DecodeState::Decoding);

        assert_eq!(decoder.decode(&[0x03, SLIP_END]), vec![vec![0x03]]);
    }

    #[test]
    fn test_decoder_multiple_frames_in_one_chunk() {
        let mut decoder = SlipDecoder::new();
        let frames = decoder.decode(&[0x01, SLIP_END, 0x02, 0x03, SLIP_END, 0x04]);

        assert_eq!(frames, vec![vec![0x01], vec![0x02, 0x03]]);
        assert_eq!(decoder.pending(), &[0x04]);
    }

    #[test]
    fn test_decoder_reset() {
        let mut decoder = SlipDecoder::new();
        decoder.decode(&[0x01, SLIP_ESC]);

        decoder.reset();

        assert_eq!(decoder.state(), DecodeState::Decoding);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original: Vec<u8> = (0..=255).collect();
        let mut decoder = SlipDecoder::new();

        let frames = decoder.decode(&encode(&original).unwrap());
        assert_eq!(frames, vec![original]);
    }
}
