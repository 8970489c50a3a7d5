//! Incremental decoder for command frames.
//!
//! The [`FrameParser`] consumes bytes one at a time, or in chunks of arbitrary
//! size, and walks the four states of [`ParserState`]:
//!
//! ```text
//! SeekStart --'#'--> ReadLength --4 bytes--> ReadBody --LEN-4 bytes--> ReadChecksum
//!     ^                  |                                                  |
//!     +-- length < 8 ----+                                                  |
//!     +--------------------------- 4 bytes, frame complete -----------------+
//! ```
//!
//! Bytes before the start marker are discarded. Length, command and data bytes
//! are summed into the inbound checksum accumulator as they arrive. One parser
//! instance belongs to exactly one connection; it is never shared.
//!
//! # Example
//!
//! ```
//! use senxor_cmd_lib::parser::{Feed, FrameParser};
//!
//! let mut parser = FrameParser::new();
//! assert!(matches!(parser.feed(b"#000"), Feed::Continue));
//! match parser.feed(b"8WREGXXXX") {
//!     Feed::FrameComplete(frame, verification) => {
//!         assert!(verification.is_valid());
//!         assert_eq!(&frame.command_code, b"WREG");
//!         assert!(frame.data.is_empty());
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use crate::checksum::{self, Verification};
use crate::error::FrameError;
use crate::protocol::{
    self as proto, Command, CHECKSUM_BYPASS, CHECKSUM_FIELD_LEN, COMMAND_FIELD_LEN,
    LENGTH_FIELD_LEN, LENGTH_SENTINEL, MAX_DATA_LEN, MAX_INPUT_LEN, MIN_DECLARED_LENGTH,
    START_MARKER,
};
use log::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    /// Scanning for the start marker.
    #[default]
    SeekStart,
    /// Collecting the four length digits.
    ReadLength,
    /// Collecting command code and data.
    ReadBody,
    /// Collecting the four checksum characters.
    ReadChecksum,
}

/// The fields of one received frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    pub command_code: [u8; COMMAND_FIELD_LEN],
    pub data: Vec<u8>,
    pub declared_length: u32,
    pub checksum_field: [u8; CHECKSUM_FIELD_LEN],
}

impl DecodedFrame {
    pub fn command(&self) -> Result<Command, proto::Error> {
        Command::from_code(&self.command_code)
    }

    pub fn is_checksum_bypassed(&self) -> bool {
        &self.checksum_field == CHECKSUM_BYPASS
    }
}

/// Outcome of feeding input to the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// More input is needed.
    Continue,
    /// A frame was read up to its checksum field. Only frames whose
    /// verification is valid may be dispatched; a mismatching frame is handed
    /// out for diagnostics.
    FrameComplete(DecodedFrame, Verification),
    /// The frame was abandoned and the parser is seeking the next start marker.
    Reset(FrameError),
}

impl Feed {
    /// Turns the outcome into a dispatchable frame, if any.
    pub fn into_frame(self) -> Result<Option<DecodedFrame>, FrameError> {
        match self {
            Feed::Continue => Ok(None),
            Feed::FrameComplete(frame, verification) => match verification {
                Verification::Mismatch {
                    calculated,
                    received,
                } => Err(FrameError::ChecksumMismatch {
                    calculated,
                    received,
                }),
                _ => Ok(Some(frame)),
            },
            Feed::Reset(error) => Err(error),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameParser {
    state: ParserState,
    length_field: [u8; LENGTH_FIELD_LEN],
    position: usize,
    body_len: usize,
    accumulator: u32,
    frame: DecodedFrame,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Drops any partial frame and returns to [`ParserState::SeekStart`].
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feeds a chunk of received bytes.
    ///
    /// Chunks longer than [`MAX_INPUT_LEN`] are truncated and the excess is
    /// dropped. Processing stops at the first completed frame; the remainder
    /// of the chunk is discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        let chunk = if chunk.len() > MAX_INPUT_LEN {
            warn!(
                "Input size {} exceeds the limit, capping to {MAX_INPUT_LEN}",
                chunk.len()
            );
            &chunk[..MAX_INPUT_LEN]
        } else {
            chunk
        };

        let mut outcome = Feed::Continue;
        for (i, byte) in chunk.iter().enumerate() {
            match self.feed_byte(*byte) {
                Feed::Continue => {}
                complete @ Feed::FrameComplete(..) => {
                    let rest = chunk.len() - i - 1;
                    if rest > 0 {
                        trace!("Discarding {rest} bytes after a complete frame");
                    }
                    return complete;
                }
                reset @ Feed::Reset(_) => outcome = reset,
            }
        }
        outcome
    }

    /// Feeds a single byte.
    pub fn feed_byte(&mut self, byte: u8) -> Feed {
        match self.state {
            ParserState::SeekStart => {
                if byte == START_MARKER {
                    trace!("Start marker found");
                    self.state = ParserState::ReadLength;
                }
                Feed::Continue
            }
            ParserState::ReadLength => {
                self.length_field[self.position] = byte;
                self.position += 1;
                self.accumulator = checksum::accumulate(self.accumulator, &[byte]);
                if self.position < LENGTH_FIELD_LEN {
                    return Feed::Continue;
                }
                match proto::parse_hex(&self.length_field) {
                    Some(length) if length >= MIN_DECLARED_LENGTH && length != LENGTH_SENTINEL => {
                        trace!("Command length: {length}");
                        self.frame.declared_length = length;
                        self.body_len = (length - CHECKSUM_FIELD_LEN as u32)
                            .min((COMMAND_FIELD_LEN + MAX_DATA_LEN) as u32)
                            as usize;
                        self.position = 0;
                        self.state = ParserState::ReadBody;
                        Feed::Continue
                    }
                    rejected => {
                        warn!(
                            "Incorrect command length {:?}",
                            String::from_utf8_lossy(&self.length_field)
                        );
                        self.reset();
                        Feed::Reset(FrameError::LengthRejected(rejected))
                    }
                }
            }
            ParserState::ReadBody => {
                self.accumulator = checksum::accumulate(self.accumulator, &[byte]);
                if self.position < COMMAND_FIELD_LEN {
                    self.frame.command_code[self.position] = byte;
                } else {
                    self.frame.data.push(byte);
                }
                self.position += 1;
                if self.position == self.body_len {
                    self.position = 0;
                    self.state = ParserState::ReadChecksum;
                }
                Feed::Continue
            }
            ParserState::ReadChecksum => {
                self.frame.checksum_field[self.position] = byte;
                self.position += 1;
                if self.position < CHECKSUM_FIELD_LEN {
                    return Feed::Continue;
                }
                let verification = checksum::verify(&self.frame.checksum_field, self.accumulator);
                match verification {
                    Verification::Bypassed => {
                        debug!("No checksum is provided, ignoring data integrity check")
                    }
                    Verification::Matched => trace!("Data verified"),
                    Verification::Mismatch {
                        calculated,
                        received,
                    } => warn!(
                        "Checksum mismatched: calculated {calculated:#X}, received {received:?}"
                    ),
                }
                let frame = std::mem::take(&mut self.frame);
                self.reset();
                Feed::FrameComplete(frame, verification)
            }
        }
    }
}

/// How a request frame is stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestChecksum {
    /// The additive sum of length, command and data. Sums beyond `0xFFFF`
    /// cannot be carried by the four digit field and fall back to `XXXX`.
    Additive,
    /// The `XXXX` bypass literal.
    Bypass,
}

/// Builds a command frame `'#' LEN CMD DATA CRC`.
pub fn encode_request(
    command_code: &[u8; COMMAND_FIELD_LEN],
    data: &[u8],
    checksum: RequestChecksum,
) -> Vec<u8> {
    let length = (COMMAND_FIELD_LEN + data.len() + CHECKSUM_FIELD_LEN) as u16;
    let mut frame = Vec::with_capacity(1 + LENGTH_FIELD_LEN + length as usize);
    frame.push(START_MARKER);
    frame.extend_from_slice(&proto::hex_word(length));
    frame.extend_from_slice(command_code);
    frame.extend_from_slice(data);
    match checksum {
        RequestChecksum::Additive => {
            let sum = checksum::additive_sum(&frame[1..]);
            match u16::try_from(sum) {
                Ok(sum) => frame.extend_from_slice(&proto::hex_word(sum)),
                Err(_) => frame.extend_from_slice(CHECKSUM_BYPASS),
            }
        }
        RequestChecksum::Bypass => frame.extend_from_slice(CHECKSUM_BYPASS),
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn complete(feed: Feed) -> (DecodedFrame, Verification) {
        match feed {
            Feed::FrameComplete(frame, verification) => (frame, verification),
            other => panic!("expected a complete frame, got {other:?}"),
        }
    }

    #[test]
    fn bypass_frame_without_data() {
        let mut parser = FrameParser::new();
        let (frame, verification) = complete(parser.feed(b"#0008WREGXXXX"));
        assert_eq!(verification, Verification::Bypassed);
        assert_eq!(&frame.command_code, b"WREG");
        assert!(frame.data.is_empty());
        assert_eq!(frame.declared_length, 8);
        assert!(frame.is_checksum_bypassed());
        assert_eq!(frame.command(), Ok(Command::WriteRegister));
        assert_eq!(parser.state(), ParserState::SeekStart);
    }

    #[test]
    fn bypass_ignores_body_content() {
        for body in [&b"RREGC2"[..], b"ZZZZ\x00\xff\x01\x02", b"POLL19"] {
            let request = encode_request(
                body[..4].try_into().unwrap(),
                &body[4..],
                RequestChecksum::Bypass,
            );
            let (_, verification) = complete(FrameParser::new().feed(&request));
            assert_eq!(verification, Verification::Bypassed);
        }
    }

    #[test]
    fn additive_checksum_round_trip() {
        let long: Vec<u8> = (0..504).map(|i| b'0' + (i % 10) as u8).collect();
        for data in [&b""[..], b"C2", b"C0C1C2FF", long.as_slice()] {
            let request = encode_request(b"RRSE", data, RequestChecksum::Additive);
            let mut parser = FrameParser::new();
            let (frame, verification) = complete(parser.feed(&request));
            assert_eq!(verification, Verification::Matched);
            assert_eq!(&frame.command_code, b"RRSE");
            assert_eq!(frame.data, data);
        }
    }

    #[test]
    fn chunk_boundaries_anywhere() {
        let request = encode_request(b"WREG", b"C028", RequestChecksum::Additive);
        let expected = complete(FrameParser::new().feed(&request));
        for split in 1..request.len() {
            let mut parser = FrameParser::new();
            assert_eq!(parser.feed(&request[..split]), Feed::Continue);
            assert_eq!(complete(parser.feed(&request[split..])), expected);
        }

        let mut parser = FrameParser::new();
        let mut outcome = Feed::Continue;
        for byte in &request {
            outcome = parser.feed_byte(*byte);
        }
        assert_eq!(complete(outcome), expected);
    }

    #[test]
    fn split_inside_length_field() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(b"#000"), Feed::Continue);
        assert_eq!(parser.state(), ParserState::ReadLength);
        let (frame, _) = complete(parser.feed(b"8WREGXXXX"));
        assert_eq!(&frame.command_code, b"WREG");
    }

    #[test]
    fn declared_length_boundaries() {
        let mut parser = FrameParser::new();
        assert_eq!(
            parser.feed(b"#0007WREGXXXX"),
            Feed::Reset(FrameError::LengthRejected(Some(7)))
        );
        assert_eq!(parser.state(), ParserState::SeekStart);

        assert_matches!(
            parser.feed(b"#00G8WREGXXXX"),
            Feed::Reset(FrameError::LengthRejected(None))
        );

        let mut parser = FrameParser::new();
        for byte in b"#FFFF" {
            parser.feed_byte(*byte);
        }
        // Four digits never reach the sentinel, the parser reads a body.
        assert_eq!(parser.state(), ParserState::ReadBody);

        let (frame, _) = complete(FrameParser::new().feed(b"#0008POLLXXXX"));
        assert_eq!(frame.declared_length, 8);
    }

    #[test]
    fn resynchronizes_after_garbage_and_rejects() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(b"garbage\r\n"), Feed::Continue);
        assert_eq!(parser.state(), ParserState::SeekStart);
        let (frame, _) = complete(parser.feed(b"xx#0003#000ARREGC2XXXX"));
        assert_eq!(&frame.command_code, b"RREG");
        assert_eq!(frame.data, b"C2");
    }

    #[test]
    fn checksum_mismatch_keeps_fields() {
        let mut parser = FrameParser::new();
        let (frame, verification) = complete(parser.feed(b"#000ARREGC20000"));
        assert_eq!(
            verification,
            Verification::Mismatch {
                calculated: 0x276,
                received: Some(0)
            }
        );
        assert_eq!(frame.data, b"C2");
        assert_eq!(parser.state(), ParserState::SeekStart);
        assert_eq!(
            Feed::FrameComplete(frame, verification).into_frame(),
            Err(FrameError::ChecksumMismatch {
                calculated: 0x276,
                received: Some(0)
            })
        );

        let (_, verification) = complete(parser.feed(b"#000ARREGC20276"));
        assert_eq!(verification, Verification::Matched);
    }

    #[test]
    fn data_is_capped() {
        let mut parser = FrameParser::new();
        let mut head = b"#0400RRSE".to_vec();
        head.extend(std::iter::repeat(b'A').take(MAX_DATA_LEN));
        assert_eq!(parser.feed(&head), Feed::Continue);
        assert_eq!(parser.state(), ParserState::ReadChecksum);
        let (frame, verification) = complete(parser.feed(b"XXXX"));
        assert_eq!(verification, Verification::Bypassed);
        assert_eq!(frame.data.len(), MAX_DATA_LEN);
        assert_eq!(frame.declared_length, 0x400);
    }

    #[test]
    fn oversized_chunk_is_truncated() {
        let mut chunk = vec![b' '; MAX_INPUT_LEN];
        chunk.extend_from_slice(b"#0008WREGXXXX");
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(&chunk), Feed::Continue);
        assert_eq!(parser.state(), ParserState::SeekStart);
    }

    #[test]
    fn one_frame_per_chunk() {
        let mut parser = FrameParser::new();
        let (frame, _) = complete(parser.feed(b"#0008WREGXXXX#0008POLLXXXX"));
        assert_eq!(&frame.command_code, b"WREG");
        assert_eq!(parser.feed(b""), Feed::Continue);
        assert_eq!(parser.state(), ParserState::SeekStart);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut parser = FrameParser::new();
        parser.feed(b"#000ARRE");
        assert_eq!(parser.state(), ParserState::ReadBody);
        parser.reset();
        assert_eq!(parser.state(), ParserState::SeekStart);
        assert_eq!(parser.feed(b"GC2XXXX"), Feed::Continue);
    }

    #[test]
    fn encode_request_layout() {
        assert_eq!(
            encode_request(b"WREG", b"", RequestChecksum::Bypass),
            b"#0008WREGXXXX"
        );
        assert_eq!(
            encode_request(b"RREG", b"C2", RequestChecksum::Additive),
            b"#000ARREGC20276"
        );
    }

    #[test]
    fn oversized_sum_falls_back_to_bypass() {
        let data = vec![0xFF; 500];
        let request = encode_request(b"RRSE", &data, RequestChecksum::Additive);
        assert_eq!(request.len(), 1 + 4 + 4 + 500 + 4);
        assert!(request.ends_with(b"XXXX"));

        let mut parser = FrameParser::new();
        let (frame, verification) = complete(parser.feed(&request));
        assert_eq!(verification, Verification::Bypassed);
        assert_eq!(frame.data, data);
    }
}
