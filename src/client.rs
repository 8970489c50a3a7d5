//! Host side client of the command protocol.
//!
//! The client works over any blocking `Read + Write` transport, a
//! `TcpStream` to the command port or a serial port.
//!
//! ## Example
//!
//! ```no_run
//! use senxor_cmd_lib::client::Client;
//! use std::net::TcpStream;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = TcpStream::connect("192.168.4.1:3334")?;
//!     let mut client = Client::new(stream);
//!     let report = client.read_quadrants()?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

use crate::analysis::FrameGeometry;
use crate::checksum::{Crc16Xmodem, FrameChecksum};
use crate::dispatcher::AckFrame;
use crate::error::{Error, Result};
use crate::parser::{encode_request, RequestChecksum};
use crate::protocol::{
    self as proto, AnalysisRegister, Axis, Command, Quadrant, RegisterAddress, RegisterClass,
};
use crate::registers::{Burner, QuadrantValues, VirtualRegisterTable};
use crate::store::MemoryStore;
use log::*;
use std::fmt;
use std::io::{self, Read, Write};

/// Sent after the addresses of a `RRSE` request, never read.
pub const SEQUENCE_TERMINATOR: u8 = 0xFF;

/// All analysis registers as read in one `RRSE` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuadrantReport {
    pub xsplit: u8,
    pub ysplit: u8,
    pub quadrants: [QuadrantValues; 4],
    pub burners: [Burner; 4],
}

impl QuadrantReport {
    pub fn quadrant(&self, quadrant: Quadrant) -> QuadrantValues {
        self.quadrants[quadrant.index()]
    }

    pub fn burner(&self, quadrant: Quadrant) -> Burner {
        self.burners[quadrant.index()]
    }
}

impl fmt::Display for QuadrantReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Split: x={}, y={}", self.xsplit, self.ysplit)?;
        for quadrant in Quadrant::ALL {
            let values = self.quadrant(quadrant);
            let burner = self.burner(quadrant);
            write!(
                f,
                "\n{quadrant}: max={}, center={}, burner ({}, {})={}",
                values.max, values.center, burner.x, burner.y, burner.temperature
            )?;
        }
        Ok(())
    }
}

pub struct Client<T, C = Crc16Xmodem> {
    transport: T,
    checksum: C,
    request_checksum: RequestChecksum,
    buffer: Vec<u8>,
}

impl<T: Read + Write> Client<T> {
    /// Creates a client verifying replies with CRC-16/XMODEM.
    pub fn new(transport: T) -> Self {
        Self::with_checksum(transport, Crc16Xmodem)
    }
}

impl<T: Read + Write, C: FrameChecksum> Client<T, C> {
    pub fn with_checksum(transport: T, checksum: C) -> Self {
        Self {
            transport,
            checksum,
            request_checksum: RequestChecksum::Additive,
            buffer: Vec::new(),
        }
    }

    /// Selects how requests are stamped, the default is the additive sum.
    pub fn set_request_checksum(&mut self, request_checksum: RequestChecksum) {
        self.request_checksum = request_checksum;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends one command and waits for its reply.
    pub fn request(&mut self, command: Command, data: &[u8]) -> Result<AckFrame> {
        let frame = encode_request(command.code(), data, self.request_checksum);
        trace!("Sending {:?}", String::from_utf8_lossy(&frame));
        self.buffer.clear();
        self.transport.write_all(&frame)?;
        self.transport.flush()?;

        let mut chunk = [0u8; 256];
        loop {
            if let Some((ack, _)) = AckFrame::decode(&self.buffer, &self.checksum)? {
                trace!("Received {ack:?}");
                if ack.command != command {
                    return Err(Error::UnexpectedReply {
                        expected: command,
                        received: ack.command.to_string(),
                    });
                }
                return Ok(ack);
            }
            let received = self.transport.read(&mut chunk)?;
            if received == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            self.buffer.extend_from_slice(&chunk[..received]);
        }
    }

    /// Reads one register. Analysis registers are 16 bit wide.
    pub fn read_register(&mut self, address: u8) -> Result<u16> {
        let ack = self.request(Command::ReadRegister, &proto::hex_byte(address))?;
        let width = value_width(address);
        if ack.payload.len() != width {
            return Err(Error::MalformedReply {
                command: Command::ReadRegister,
            });
        }
        proto::parse_hex(&ack.payload).map(|value| value as u16).ok_or(Error::MalformedReply {
            command: Command::ReadRegister,
        })
    }

    pub fn write_register(&mut self, address: u8, value: u8) -> Result<()> {
        let mut data = proto::hex_byte(address).to_vec();
        data.extend_from_slice(&proto::hex_byte(value));
        self.request(Command::WriteRegister, &data)?;
        Ok(())
    }

    /// Reads several registers with one `RRSE` request.
    pub fn read_registers(&mut self, addresses: &[u8]) -> Result<Vec<(u8, u16)>> {
        let mut data: Vec<u8> = addresses.iter().flat_map(|a| proto::hex_byte(*a)).collect();
        data.extend_from_slice(&proto::hex_byte(SEQUENCE_TERMINATOR));
        let ack = self.request(Command::ReadRegisterSequence, &data)?;

        let malformed = || Error::MalformedReply {
            command: Command::ReadRegisterSequence,
        };
        let mut payload = ack.payload.as_slice();
        let mut values = Vec::with_capacity(addresses.len());
        for address in addresses {
            let width = value_width(*address);
            if payload.len() < 2 + width {
                return Err(malformed());
            }
            let (field, rest) = payload.split_at(2 + width);
            if proto::parse_hex_byte(&field[..2]) != Some(*address) {
                return Err(malformed());
            }
            let value = proto::parse_hex(&field[2..]).ok_or_else(malformed)?;
            values.push((*address, value as u16));
            payload = rest;
        }
        Ok(values)
    }

    /// Sets the analysis polling frequency, 0 stops polling.
    pub fn set_poll_frequency(&mut self, hz: u8) -> Result<()> {
        self.request(Command::Poll, &proto::hex_byte(hz))?;
        Ok(())
    }

    /// Reads the split, the quadrant values and the burners.
    pub fn read_quadrants(&mut self) -> Result<QuadrantReport> {
        let addresses: Vec<u8> =
            (RegisterAddress::ANALYSIS_FIRST..=RegisterAddress::ANALYSIS_LAST).collect();
        let mut report = QuadrantReport::default();
        for (address, value) in self.read_registers(&addresses)? {
            let Ok(register) = AnalysisRegister::try_from(RegisterAddress::new(address)) else {
                continue;
            };
            match register {
                AnalysisRegister::XSplit => report.xsplit = value as u8,
                AnalysisRegister::YSplit => report.ysplit = value as u8,
                AnalysisRegister::Max(q) => report.quadrants[q.index()].max = value,
                AnalysisRegister::Center(q) => report.quadrants[q.index()].center = value,
                AnalysisRegister::BurnerCoordinate(q, Axis::X) => {
                    report.burners[q.index()].x = value as u8
                }
                AnalysisRegister::BurnerCoordinate(q, Axis::Y) => {
                    report.burners[q.index()].y = value as u8
                }
                AnalysisRegister::BurnerTemperature(q) => {
                    report.burners[q.index()].temperature = value
                }
                AnalysisRegister::DeviceId(_) => {}
            }
        }
        Ok(report)
    }

    pub fn set_split(&mut self, xsplit: u8, ysplit: u8) -> Result<()> {
        self.write_register(*AnalysisRegister::XSplit.address(), xsplit)?;
        self.write_register(*AnalysisRegister::YSplit.address(), ysplit)
    }

    pub fn set_burner(&mut self, quadrant: Quadrant, x: u8, y: u8) -> Result<()> {
        let register = AnalysisRegister::BurnerCoordinate(quadrant, Axis::X);
        self.write_register(*register.address(), x)?;
        let register = AnalysisRegister::BurnerCoordinate(quadrant, Axis::Y);
        self.write_register(*register.address(), y)
    }

    /// Restores the default split and moves every burner to the centre of its
    /// quadrant.
    pub fn reset_analysis(&mut self, geometry: FrameGeometry) -> Result<()> {
        let defaults = VirtualRegisterTable::load(geometry, Box::new(MemoryStore::new()));
        self.set_split(defaults.xsplit(), defaults.ysplit())?;
        for quadrant in Quadrant::ALL {
            let burner = defaults.burner(quadrant);
            self.set_burner(quadrant, burner.x, burner.y)?;
        }
        Ok(())
    }
}

/// Hex digits of a register value in a reply.
fn value_width(address: u8) -> usize {
    match RegisterAddress::new(address).class() {
        RegisterClass::Analysis => 4,
        _ => 2,
    }
}
