//! Routes register accesses to their backing store.
//!
//! Analysis addresses go to the [`VirtualRegisterTable`], the two version
//! addresses to a [`VersionInfo`] collaborator, and everything else verbatim
//! to the sensor through [`SensorRegisters`].

use crate::lock;
use crate::protocol::{self as proto, AnalysisRegister, RegisterAddress, RegisterClass};
use crate::registers::{VirtualRegisterTable, WriteOutcome};
use log::*;
use std::sync::{Arc, Mutex};

/// Register access of the physical sensor.
pub trait SensorRegisters: Send {
    fn read(&mut self, address: u8) -> u8;
    fn write(&mut self, address: u8, value: u8);
}

/// Source of the firmware version bytes.
pub trait VersionInfo: Send + Sync {
    fn read_version(&self, address: u8) -> u8;
}

/// A 256 byte register file standing in for the sensor.
#[derive(Debug, Clone)]
pub struct MemoryRegisters {
    registers: [u8; 256],
}

impl Default for MemoryRegisters {
    fn default() -> Self {
        Self {
            registers: [0; 256],
        }
    }
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: impl IntoIterator<Item = (u8, u8)>) -> Self {
        let mut registers = Self::default();
        for (address, value) in values {
            registers.registers[address as usize] = value;
        }
        registers
    }
}

impl SensorRegisters for MemoryRegisters {
    fn read(&mut self, address: u8) -> u8 {
        self.registers[address as usize]
    }

    fn write(&mut self, address: u8, value: u8) {
        self.registers[address as usize] = value;
    }
}

/// Firmware version reported at `0xB2` (major) and `0xB3` (minor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl VersionInfo for FirmwareVersion {
    fn read_version(&self, address: u8) -> u8 {
        if address == RegisterAddress::VERSION_FIRST {
            self.major
        } else {
            self.minor
        }
    }
}

/// A register value as carried in a reply: analysis registers are encoded
/// with four hex digits, all others with two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Narrow(u8),
    Wide(u16),
}

impl RegisterValue {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RegisterValue::Narrow(value) => out.extend_from_slice(&proto::hex_byte(*value)),
            RegisterValue::Wide(value) => out.extend_from_slice(&proto::hex_word(*value)),
        }
    }

    /// Number of hex digits the value occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            RegisterValue::Narrow(_) => 2,
            RegisterValue::Wide(_) => 4,
        }
    }

    pub fn value(&self) -> u16 {
        match self {
            RegisterValue::Narrow(value) => *value as u16,
            RegisterValue::Wide(value) => *value,
        }
    }
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterValue::Narrow(value) => write!(f, "{value:#04X}"),
            RegisterValue::Wide(value) => write!(f, "{value:#06X}"),
        }
    }
}

/// The register broker. Cloning is cheap and every clone shares the same
/// backing stores, so each transport gets its own handle.
#[derive(Clone)]
pub struct RegisterBroker {
    table: Arc<Mutex<VirtualRegisterTable>>,
    sensor: Arc<Mutex<dyn SensorRegisters>>,
    version: Arc<dyn VersionInfo>,
}

impl RegisterBroker {
    pub fn new(
        table: Arc<Mutex<VirtualRegisterTable>>,
        sensor: Arc<Mutex<dyn SensorRegisters>>,
        version: Arc<dyn VersionInfo>,
    ) -> Self {
        Self {
            table,
            sensor,
            version,
        }
    }

    pub fn table(&self) -> &Arc<Mutex<VirtualRegisterTable>> {
        &self.table
    }

    pub fn classify(&self, address: RegisterAddress) -> RegisterClass {
        address.class()
    }

    pub fn read(&self, address: RegisterAddress) -> RegisterValue {
        match address.class() {
            RegisterClass::Analysis => match AnalysisRegister::try_from(address) {
                Ok(register) => RegisterValue::Wide(lock(&self.table).read(register)),
                Err(error) => {
                    // The analysis range maps completely onto the table.
                    error!("{error}");
                    RegisterValue::Wide(0)
                }
            },
            RegisterClass::Version => RegisterValue::Narrow(self.version.read_version(*address)),
            RegisterClass::Hardware => RegisterValue::Narrow(lock(&self.sensor).read(*address)),
        }
    }

    pub fn write(&self, address: RegisterAddress, value: u8) -> WriteOutcome {
        match address.class() {
            RegisterClass::Analysis => match AnalysisRegister::try_from(address) {
                Ok(register) => lock(&self.table).write(register, value),
                Err(error) => {
                    error!("{error}");
                    WriteOutcome::Ignored
                }
            },
            RegisterClass::Version => {
                debug!("Ignoring write to version register {address}");
                WriteOutcome::Ignored
            }
            RegisterClass::Hardware => {
                lock(&self.sensor).write(*address, value);
                WriteOutcome::Stored(value)
            }
        }
    }
}

impl std::fmt::Debug for RegisterBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterBroker")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
