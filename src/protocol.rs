//! Wire level definitions of the SenXor command protocol.
//!
//! A command frame has the byte exact layout
//!
//! ```text
//! '#' LEN(4 hex ASCII) CMD(4 ASCII) DATA(LEN-8 bytes) CRC(4 hex ASCII | "XXXX")
//! ```
//!
//! where `LEN` counts `CMD + DATA + CRC`. This module provides the constants of
//! that grammar together with strongly typed wrappers for the command codes and
//! the one byte register address space.

use std::fmt;

/// Marks the beginning of every frame.
pub const START_MARKER: u8 = b'#';
pub const LENGTH_FIELD_LEN: usize = 4;
pub const COMMAND_FIELD_LEN: usize = 4;
pub const CHECKSUM_FIELD_LEN: usize = 4;
/// Upper bound of the data field accepted by the parser.
pub const MAX_DATA_LEN: usize = 512;
/// Upper bound of a single input chunk, larger chunks are truncated.
pub const MAX_INPUT_LEN: usize =
    COMMAND_FIELD_LEN + LENGTH_FIELD_LEN + MAX_DATA_LEN + CHECKSUM_FIELD_LEN;

/// Smallest valid declared length: command and checksum without data.
pub const MIN_DECLARED_LENGTH: u32 = (COMMAND_FIELD_LEN + CHECKSUM_FIELD_LEN) as u32;
/// Parse failure value of the length field, never a valid length.
pub const LENGTH_SENTINEL: u32 = 0xFFFF_FFFF;
/// A checksum field with this content skips verification.
pub const CHECKSUM_BYPASS: &[u8; CHECKSUM_FIELD_LEN] = b"XXXX";
/// Every reply frame starts with these filler bytes before the start marker.
pub const ACK_FILLER: &[u8; 3] = b"   ";

pub const POLL_MAX_FREQ_HZ: u8 = 25;

/// Errors raised while converting raw protocol values into typed values.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unknown command code {0:?}")]
    UnknownCommand(String),
    #[error("Invalid hex field {0:?}")]
    InvalidHex(String),
    #[error("The register address {0:#04X} is not an analysis register")]
    NotAnalysisRegister(u8),
    #[error("Unknown quadrant {0:?}")]
    UnknownQuadrant(String),
}

/// Decodes one ASCII hex digit. Upper- and lowercase digits are accepted.
pub fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Parses a field of ASCII hex digits. Returns `None` for an empty field,
/// any non hex character, or a value that does not fit into 32 bits.
pub fn parse_hex(field: &[u8]) -> Option<u32> {
    if field.is_empty() || field.len() > 8 {
        return None;
    }
    field
        .iter()
        .try_fold(0u32, |acc, c| Some((acc << 4) | hex_digit(*c)? as u32))
}

/// Parses exactly two hex digits into a byte.
pub fn parse_hex_byte(field: &[u8]) -> Option<u8> {
    match field {
        [hi, lo] => Some((hex_digit(*hi)? << 4) | hex_digit(*lo)?),
        _ => None,
    }
}

/// Formats a byte as two uppercase hex digits.
pub fn hex_byte(value: u8) -> [u8; 2] {
    let text = format!("{value:02X}");
    let bytes = text.as_bytes();
    [bytes[0], bytes[1]]
}

/// Formats a 16 bit word as four uppercase, zero padded hex digits.
pub fn hex_word(value: u16) -> [u8; 4] {
    let text = format!("{value:04X}");
    let bytes = text.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// The command codes understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `WREG`: write one register.
    WriteRegister,
    /// `RREG`: read one register.
    ReadRegister,
    /// `RRSE`: read a sequence of registers.
    ReadRegisterSequence,
    /// `POLL`: set the analysis polling frequency.
    Poll,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::WriteRegister,
        Command::ReadRegister,
        Command::ReadRegisterSequence,
        Command::Poll,
    ];

    /// The four ASCII bytes carried in the command field.
    pub const fn code(&self) -> &'static [u8; COMMAND_FIELD_LEN] {
        match self {
            Command::WriteRegister => b"WREG",
            Command::ReadRegister => b"RREG",
            Command::ReadRegisterSequence => b"RRSE",
            Command::Poll => b"POLL",
        }
    }

    pub fn from_code(code: &[u8]) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|command| command.code().as_slice() == code)
            .ok_or_else(|| Error::UnknownCommand(String::from_utf8_lossy(code).into_owned()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Codes are plain ASCII.
        write!(f, "{}", String::from_utf8_lossy(self.code()))
    }
}

/// The backing store an address is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    /// Physical sensor register, forwarded verbatim.
    Hardware,
    /// Software computed register held in the virtual register table.
    Analysis,
    /// Firmware version byte.
    Version,
}

/// A one byte register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress(u8);

impl RegisterAddress {
    pub const ANALYSIS_FIRST: u8 = 0xC0;
    pub const ANALYSIS_LAST: u8 = 0xD5;
    pub const VERSION_FIRST: u8 = 0xB2;
    pub const VERSION_LAST: u8 = 0xB3;
    /// Capture control register of the sensor.
    pub const CAPTURE_CONTROL: u8 = 0xB1;

    pub const fn new(address: u8) -> Self {
        Self(address)
    }

    /// Classifies the address. The rules are applied in order: analysis
    /// range, version range, everything else is hardware. The device id
    /// registers `0xE0..=0xE5` are outside the analysis range and therefore
    /// classify as hardware.
    pub const fn class(&self) -> RegisterClass {
        match self.0 {
            Self::ANALYSIS_FIRST..=Self::ANALYSIS_LAST => RegisterClass::Analysis,
            Self::VERSION_FIRST..=Self::VERSION_LAST => RegisterClass::Version,
            _ => RegisterClass::Hardware,
        }
    }
}

impl std::ops::Deref for RegisterAddress {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u8> for RegisterAddress {
    fn from(address: u8) -> Self {
        Self(address)
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.0)
    }
}

/// One of the four analysis quadrants, split by `xsplit` and `ysplit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
    /// Top left.
    A,
    /// Top right.
    B,
    /// Bottom left.
    C,
    /// Bottom right.
    D,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [Quadrant::A, Quadrant::B, Quadrant::C, Quadrant::D];

    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Quadrant of pixel `(x, y)` for the given split.
    pub fn of_pixel(x: usize, y: usize, xsplit: usize, ysplit: usize) -> Self {
        match (x < xsplit, y < ysplit) {
            (true, true) => Quadrant::A,
            (false, true) => Quadrant::B,
            (true, false) => Quadrant::C,
            (false, false) => Quadrant::D,
        }
    }

    pub const fn is_left(&self) -> bool {
        matches!(self, Quadrant::A | Quadrant::C)
    }

    pub const fn is_top(&self) -> bool {
        matches!(self, Quadrant::A | Quadrant::B)
    }

    pub const fn name(&self) -> char {
        match self {
            Quadrant::A => 'a',
            Quadrant::B => 'b',
            Quadrant::C => 'c',
            Quadrant::D => 'd',
        }
    }
}

impl fmt::Display for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name().to_ascii_uppercase())
    }
}

impl std::str::FromStr for Quadrant {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(Quadrant::A),
            "b" => Ok(Quadrant::B),
            "c" => Ok(Quadrant::C),
            "d" => Ok(Quadrant::D),
            _ => Err(Error::UnknownQuadrant(s.to_string())),
        }
    }
}

/// Axis of a burner coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
}

/// The registers of the virtual register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisRegister {
    XSplit,
    YSplit,
    Max(Quadrant),
    Center(Quadrant),
    BurnerCoordinate(Quadrant, Axis),
    BurnerTemperature(Quadrant),
    /// One byte of the six byte device identity.
    DeviceId(u8),
}

impl AnalysisRegister {
    pub const DEVICE_ID_FIRST: u8 = 0xE0;
    pub const DEVICE_ID_LEN: u8 = 6;

    /// Whether the register accepts writes.
    pub const fn is_writable(&self) -> bool {
        matches!(
            self,
            AnalysisRegister::XSplit
                | AnalysisRegister::YSplit
                | AnalysisRegister::BurnerCoordinate(..)
        )
    }

    /// Whether the register holds an 8 bit value.
    pub const fn is_narrow(&self) -> bool {
        !matches!(
            self,
            AnalysisRegister::Max(_)
                | AnalysisRegister::Center(_)
                | AnalysisRegister::BurnerTemperature(_)
        )
    }

    pub fn address(&self) -> RegisterAddress {
        let raw = match *self {
            AnalysisRegister::XSplit => 0xC0,
            AnalysisRegister::YSplit => 0xC1,
            AnalysisRegister::Max(q) => 0xC2 + 2 * q.index() as u8,
            AnalysisRegister::Center(q) => 0xC3 + 2 * q.index() as u8,
            AnalysisRegister::BurnerCoordinate(q, Axis::X) => 0xCA + 3 * q.index() as u8,
            AnalysisRegister::BurnerCoordinate(q, Axis::Y) => 0xCB + 3 * q.index() as u8,
            AnalysisRegister::BurnerTemperature(q) => 0xCC + 3 * q.index() as u8,
            AnalysisRegister::DeviceId(n) => Self::DEVICE_ID_FIRST + n,
        };
        RegisterAddress(raw)
    }
}

impl TryFrom<RegisterAddress> for AnalysisRegister {
    type Error = Error;

    fn try_from(address: RegisterAddress) -> Result<Self, Self::Error> {
        let raw = *address;
        let register = match raw {
            0xC0 => AnalysisRegister::XSplit,
            0xC1 => AnalysisRegister::YSplit,
            0xC2..=0xC9 => {
                let quadrant = Quadrant::ALL[((raw - 0xC2) / 2) as usize];
                if (raw - 0xC2) % 2 == 0 {
                    AnalysisRegister::Max(quadrant)
                } else {
                    AnalysisRegister::Center(quadrant)
                }
            }
            0xCA..=0xD5 => {
                let quadrant = Quadrant::ALL[((raw - 0xCA) / 3) as usize];
                match (raw - 0xCA) % 3 {
                    0 => AnalysisRegister::BurnerCoordinate(quadrant, Axis::X),
                    1 => AnalysisRegister::BurnerCoordinate(quadrant, Axis::Y),
                    _ => AnalysisRegister::BurnerTemperature(quadrant),
                }
            }
            0xE0..=0xE5 => AnalysisRegister::DeviceId(raw - Self::DEVICE_ID_FIRST),
            _ => return Err(Error::NotAnalysisRegister(raw)),
        };
        Ok(register)
    }
}

impl fmt::Display for AnalysisRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisRegister::XSplit => write!(f, "Xsplit"),
            AnalysisRegister::YSplit => write!(f, "Ysplit"),
            AnalysisRegister::Max(q) => write!(f, "{q}max"),
            AnalysisRegister::Center(q) => write!(f, "{q}center"),
            AnalysisRegister::BurnerCoordinate(q, Axis::X) => write!(f, "{q}burnerx"),
            AnalysisRegister::BurnerCoordinate(q, Axis::Y) => write!(f, "{q}burnery"),
            AnalysisRegister::BurnerTemperature(q) => write!(f, "{q}burnert"),
            AnalysisRegister::DeviceId(n) => write!(f, "DevId{n}"),
        }
    }
}
