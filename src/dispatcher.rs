//! Executes decoded frames and builds their ACK replies.
//!
//! | Command | Data | Reply payload | Declared length |
//! |---|---|---|---|
//! | `WREG` | address, value | none | `0008` |
//! | `RREG` | address | value, 4 digits for analysis registers, else 2 | `000C` / `000A` |
//! | `RRSE` | addresses, terminator | address and value per address | `8 + Σ` |
//! | `POLL` | frequency in Hz | none | `0008` |
//!
//! Every reply is `"   #" LEN CMD PAYLOAD CRC`, the checksum being computed
//! over `LEN CMD PAYLOAD` by a [`FrameChecksum`]. The fixed layout replies of
//! `WREG`, `RREG` and `POLL` are followed by a NUL byte that is transmitted
//! and counted.

use crate::broker::{RegisterBroker, RegisterValue};
use crate::checksum::{Crc16Xmodem, FrameChecksum};
use crate::error::{Error, FrameError, Result};
use crate::parser::DecodedFrame;
use crate::protocol::{
    self as proto, Command, RegisterAddress, ACK_FILLER, CHECKSUM_FIELD_LEN, COMMAND_FIELD_LEN,
    LENGTH_FIELD_LEN, MIN_DECLARED_LENGTH, POLL_MAX_FREQ_HZ, START_MARKER,
};
use crate::registers::WriteOutcome;
use log::*;
use std::sync::Arc;

/// Capture control used by `POLL`.
pub trait PollControl: Send + Sync {
    fn set_poll_frequency_hz(&self, hz: u8);
    /// Whether frames are currently streamed to another transport.
    fn is_streaming_session_active(&self) -> bool;
}

/// One reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub declared_length: u16,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl AckFrame {
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        let declared_length = (COMMAND_FIELD_LEN + payload.len() + CHECKSUM_FIELD_LEN) as u16;
        Self {
            declared_length,
            command,
            payload,
        }
    }

    /// `RRSE` replies are sized exactly, all others carry a trailing NUL.
    pub fn has_trailing_nul(&self) -> bool {
        self.command != Command::ReadRegisterSequence
    }

    /// Appends the serialized frame to `out` and returns the number of bytes
    /// to transmit.
    pub fn encode(&self, checksum: &impl FrameChecksum, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        out.extend_from_slice(ACK_FILLER);
        out.push(START_MARKER);
        let covered = out.len();
        out.extend_from_slice(&proto::hex_word(self.declared_length));
        out.extend_from_slice(self.command.code());
        out.extend_from_slice(&self.payload);
        let crc = checksum.checksum(&out[covered..]);
        out.extend_from_slice(&proto::hex_word(crc));
        if self.has_trailing_nul() {
            out.push(0);
        }
        out.len() - start
    }

    /// Decodes the first reply frame in `bytes`.
    ///
    /// Anything before the start marker is skipped. Returns `Ok(None)` until
    /// the frame is complete, and otherwise the frame together with the
    /// number of bytes it occupied.
    pub fn decode(
        bytes: &[u8],
        checksum: &impl FrameChecksum,
    ) -> Result<Option<(AckFrame, usize)>> {
        let Some(start) = bytes.iter().position(|b| *b == START_MARKER) else {
            return Ok(None);
        };
        let frame = &bytes[start + 1..];
        if frame.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let length = proto::parse_hex(&frame[..LENGTH_FIELD_LEN]);
        let declared_length = match length {
            Some(length) if (MIN_DECLARED_LENGTH..=u16::MAX as u32).contains(&length) => {
                length as u16
            }
            _ => return Err(FrameError::LengthRejected(length).into()),
        };
        let total = LENGTH_FIELD_LEN + declared_length as usize;
        if frame.len() < total {
            return Ok(None);
        }
        let checksum_at = total - CHECKSUM_FIELD_LEN;
        let command =
            Command::from_code(&frame[LENGTH_FIELD_LEN..LENGTH_FIELD_LEN + COMMAND_FIELD_LEN])?;

        let calculated = checksum.checksum(&frame[..checksum_at]);
        let received = proto::parse_hex(&frame[checksum_at..total]).map(|crc| crc as u16);
        if received != Some(calculated) {
            return Err(Error::AckChecksumMismatch {
                calculated,
                received,
            });
        }
        let payload = frame[LENGTH_FIELD_LEN + COMMAND_FIELD_LEN..checksum_at].to_vec();
        let ack = AckFrame {
            declared_length,
            command,
            payload,
        };
        Ok(Some((ack, start + 1 + total)))
    }
}

pub struct Dispatcher<C = Crc16Xmodem> {
    broker: RegisterBroker,
    poll: Arc<dyn PollControl>,
    checksum: C,
}

impl<C: FrameChecksum> Dispatcher<C> {
    pub fn new(broker: RegisterBroker, poll: Arc<dyn PollControl>, checksum: C) -> Self {
        Self {
            broker,
            poll,
            checksum,
        }
    }

    pub fn broker(&self) -> &RegisterBroker {
        &self.broker
    }

    pub fn checksum(&self) -> &C {
        &self.checksum
    }

    /// Executes `frame` and returns the reply to send.
    pub fn dispatch(&self, frame: &DecodedFrame) -> std::result::Result<AckFrame, FrameError> {
        let command = frame.command().map_err(|_| {
            FrameError::UnknownCommand(String::from_utf8_lossy(&frame.command_code).into_owned())
        })?;
        debug!("Dispatching {command} with data {:?}", String::from_utf8_lossy(&frame.data));
        match command {
            Command::WriteRegister => Ok(self.write_register(frame)),
            Command::ReadRegister => self.read_register(frame),
            Command::ReadRegisterSequence => Ok(self.read_register_sequence(frame)),
            Command::Poll => self.poll(frame),
        }
    }

    /// Executes `frame` and appends the encoded reply to `ack`.
    ///
    /// Returns the number of reply bytes, 0 if the frame is not answered.
    pub fn commit(&self, frame: &DecodedFrame, ack: &mut Vec<u8>) -> usize {
        match self.dispatch(frame) {
            Ok(reply) => reply.encode(&self.checksum, ack),
            Err(error @ FrameError::UnknownCommand(_)) => {
                error!("{error}");
                0
            }
            Err(error) => {
                warn!("{error}");
                0
            }
        }
    }

    fn write_register(&self, frame: &DecodedFrame) -> AckFrame {
        let address = frame.data.get(0..2).and_then(proto::parse_hex_byte);
        let value = frame.data.get(2..4).and_then(proto::parse_hex_byte);
        match (address, value) {
            (Some(address), Some(value)) => {
                let address = RegisterAddress::new(address);
                match self.broker.write(address, value) {
                    WriteOutcome::Stored(stored) => debug!("WREG {address} = {stored:#04X}"),
                    WriteOutcome::Ignored => debug!("WREG {address} ignored"),
                }
            }
            _ => warn!(
                "{}",
                FrameError::InvalidCommandData {
                    command: Command::WriteRegister,
                    field: "address or value",
                }
            ),
        }
        AckFrame::new(Command::WriteRegister, Vec::new())
    }

    fn read_register(&self, frame: &DecodedFrame) -> std::result::Result<AckFrame, FrameError> {
        let address = frame
            .data
            .get(0..2)
            .and_then(proto::parse_hex_byte)
            .ok_or(FrameError::InvalidCommandData {
                command: Command::ReadRegister,
                field: "address",
            })?;
        let address = RegisterAddress::new(address);
        let value = self.broker.read(address);
        debug!("RREG {address} = {value}");
        let mut payload = Vec::with_capacity(value.encoded_len());
        value.encode(&mut payload);
        Ok(AckFrame::new(Command::ReadRegister, payload))
    }

    /// Reads the addresses listed in the data. The final pair is a terminator
    /// and is not read.
    fn read_register_sequence(&self, frame: &DecodedFrame) -> AckFrame {
        let count = (frame.declared_length as usize)
            .saturating_sub(MIN_DECLARED_LENGTH as usize + 2)
            .min(frame.data.len());
        let mut payload = Vec::new();
        for pair in frame.data[..count].chunks_exact(2) {
            let Some(address) = proto::parse_hex_byte(pair) else {
                warn!("RRSE skipping invalid address {:?}", String::from_utf8_lossy(pair));
                continue;
            };
            let value: RegisterValue = self.broker.read(RegisterAddress::new(address));
            trace!("RRSE {address:#04X} = {value}");
            payload.extend_from_slice(&proto::hex_byte(address));
            value.encode(&mut payload);
        }
        AckFrame::new(Command::ReadRegisterSequence, payload)
    }

    fn poll(&self, frame: &DecodedFrame) -> std::result::Result<AckFrame, FrameError> {
        if self.poll.is_streaming_session_active() {
            return Err(FrameError::StreamingConflict);
        }
        let hz = frame
            .data
            .get(0..2)
            .and_then(proto::parse_hex_byte)
            .ok_or(FrameError::InvalidCommandData {
                command: Command::Poll,
                field: "frequency",
            })?;
        self.poll.set_poll_frequency_hz(hz.min(POLL_MAX_FREQ_HZ));
        Ok(AckFrame::new(Command::Poll, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, FrameGeometry};
    use crate::broker::{FirmwareVersion, MemoryRegisters};
    use crate::capture::PollState;
    use crate::lock;
    use crate::parser::{encode_request, FrameParser, RequestChecksum};
    use crate::registers::{QuadrantValues, VirtualRegisterTable};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    fn dispatcher() -> (Dispatcher, Arc<PollState>) {
        let table = VirtualRegisterTable::load(FrameGeometry::default(), Box::new(MemoryStore::new()));
        let broker = RegisterBroker::new(
            Arc::new(Mutex::new(table)),
            Arc::new(Mutex::new(MemoryRegisters::with_values([(0x00, 0x2A)]))),
            Arc::new(FirmwareVersion { major: 1, minor: 2 }),
        );
        let poll = Arc::new(PollState::new());
        (Dispatcher::new(broker, poll.clone(), Crc16Xmodem), poll)
    }

    fn frame(request: &[u8]) -> DecodedFrame {
        FrameParser::new().feed(request).into_frame().unwrap().unwrap()
    }

    fn commit(dispatcher: &Dispatcher, request: &[u8]) -> Vec<u8> {
        let mut ack = Vec::new();
        let len = dispatcher.commit(&frame(request), &mut ack);
        assert_eq!(len, ack.len());
        ack
    }

    #[test]
    fn write_register() {
        let (dispatcher, _) = dispatcher();
        let ack = commit(&dispatcher, b"#000CWREGB103XXXX");
        assert_eq!(ack, b"   #0008WREGE0BC\0");
        assert_eq!(ack.len(), 17);
        assert_eq!(
            dispatcher.broker().read(RegisterAddress::new(0xB1)),
            RegisterValue::Narrow(3)
        );

        let ack = commit(&dispatcher, b"#000CWREGC014XXXX");
        assert_eq!(ack, b"   #0008WREGE0BC\0");
        assert_eq!(lock(dispatcher.broker().table()).xsplit(), 0x14);
    }

    #[test]
    fn write_without_data_is_acknowledged() {
        let (dispatcher, _) = dispatcher();
        let ack = commit(&dispatcher, b"#0008WREGXXXX");
        assert_eq!(ack, b"   #0008WREGE0BC\0");
        let ack = commit(&dispatcher, b"#000CWREGZZ01XXXX");
        assert_eq!(ack, b"   #0008WREGE0BC\0");
        assert_eq!(
            dispatcher.broker().read(RegisterAddress::new(0x00)),
            RegisterValue::Narrow(0x2A)
        );
    }

    #[test]
    fn read_analysis_register() {
        let (dispatcher, _) = dispatcher();
        lock(dispatcher.broker().table()).apply(&AnalysisResult {
            quadrants: [QuadrantValues { max: 1234, center: 0 }; 4],
            burner_temperatures: [0; 4],
        });
        let ack = commit(&dispatcher, b"#000ARREGC2XXXX");
        assert_eq!(ack, b"   #000CRREG04D20A3F\0");
        assert_eq!(ack.len(), 21);
    }

    #[test]
    fn read_narrow_registers() {
        let (dispatcher, _) = dispatcher();
        let ack = commit(&dispatcher, b"#000ARREG00XXXX");
        assert_eq!(ack, b"   #000ARREG2AA15B\0");
        assert_eq!(ack.len(), 19);

        let ack = dispatcher.dispatch(&frame(b"#000ARREGB3XXXX")).unwrap();
        assert_eq!(ack.payload, b"02");
        assert_eq!(ack.declared_length, 0x0A);

        assert_matches!(
            dispatcher.dispatch(&frame(b"#000ARREGQ1XXXX")),
            Err(FrameError::InvalidCommandData { field: "address", .. })
        );
        assert_eq!(dispatcher.commit(&frame(b"#0008RREGXXXX"), &mut Vec::new()), 0);
    }

    #[test]
    fn read_register_sequence() {
        let (dispatcher, _) = dispatcher();
        // Three addresses and the terminator pair.
        let request = encode_request(b"RRSE", b"C000B2FF", RequestChecksum::Additive);
        let ack = dispatcher.dispatch(&frame(&request)).unwrap();
        assert_eq!(ack.payload, b"C00028002AB201");
        assert_eq!(ack.declared_length, 8 + 6 + 4 + 4);

        let mut out = Vec::new();
        let len = ack.encode(dispatcher.checksum(), &mut out);
        assert_eq!(len, 16 + 14);
        assert_eq!(&out[..8], b"   #0016");
        assert_ne!(out.last(), Some(&0));
    }

    #[test]
    fn read_register_sequence_edge_cases() {
        let (dispatcher, _) = dispatcher();
        let ack = dispatcher.dispatch(&frame(b"#0008RRSEXXXX")).unwrap();
        assert!(ack.payload.is_empty());
        assert_eq!(ack.declared_length, 8);

        let request = encode_request(b"RRSE", b"C0", RequestChecksum::Bypass);
        assert!(dispatcher.dispatch(&frame(&request)).unwrap().payload.is_empty());

        let request = encode_request(b"RRSE", b"ZZ00FF", RequestChecksum::Bypass);
        assert_eq!(dispatcher.dispatch(&frame(&request)).unwrap().payload, b"002A");
    }

    #[test]
    fn poll() {
        let (dispatcher, poll) = dispatcher();
        let ack = commit(&dispatcher, b"#000APOLL19XXXX");
        assert_eq!(ack, b"   #0008POLLBB50\0");
        assert_eq!(poll.poll_frequency_hz(), 25);

        commit(&dispatcher, b"#000APOLLFFXXXX");
        assert_eq!(poll.poll_frequency_hz(), 25);
        commit(&dispatcher, b"#000APOLL01XXXX");
        assert_eq!(poll.poll_frequency_hz(), 1);

        assert_matches!(
            dispatcher.dispatch(&frame(b"#000APOLLx1XXXX")),
            Err(FrameError::InvalidCommandData { field: "frequency", .. })
        );
    }

    #[test]
    fn poll_rejected_while_streaming() {
        let (dispatcher, poll) = dispatcher();
        poll.set_streaming(true);
        assert_eq!(
            dispatcher.dispatch(&frame(b"#000APOLL19XXXX")),
            Err(FrameError::StreamingConflict)
        );
        assert_eq!(dispatcher.commit(&frame(b"#000APOLL19XXXX"), &mut Vec::new()), 0);
        assert_eq!(poll.poll_frequency_hz(), 0);
    }

    #[test]
    fn unknown_command() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(
            dispatcher.dispatch(&frame(b"#0008WSIDXXXX")),
            Err(FrameError::UnknownCommand("WSID".to_string()))
        );
    }

    #[test]
    fn decode_replies() {
        let (mut bytes, checksum) = (b"   #000CRREG04D20A3F\0".to_vec(), Crc16Xmodem);
        let (ack, used) = AckFrame::decode(&bytes, &checksum).unwrap().unwrap();
        assert_eq!(ack, AckFrame::new(Command::ReadRegister, b"04D2".to_vec()));
        assert_eq!(used, 20);

        assert_matches!(AckFrame::decode(&bytes[..12], &checksum), Ok(None));
        assert_matches!(AckFrame::decode(b"    ", &checksum), Ok(None));

        bytes[17] = b'0';
        assert_matches!(
            AckFrame::decode(&bytes, &checksum),
            Err(Error::AckChecksumMismatch { calculated: 0x0A3F, .. })
        );
        assert_matches!(
            AckFrame::decode(b"#0004WREG", &checksum),
            Err(Error::Frame(FrameError::LengthRejected(Some(4))))
        );
    }
}
