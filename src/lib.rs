//! Command protocol and virtual registers of the SenXor thermal imaging appliance.
//!
//! The appliance accepts a compact ASCII command protocol over a TCP socket
//! and a USB serial port:
//!
//! ```text
//! '#' LEN(4 hex) CMD(4 ASCII) DATA(LEN-8 bytes) CRC(4 hex | "XXXX")
//! ```
//!
//! Commands read and write one byte registers. Most addresses belong to the
//! sensor itself, `0xB2`/`0xB3` report the firmware version, and
//! `0xC0..=0xD5` are analysis registers computed from every captured frame:
//! the maximum and centre value of four image quadrants and the temperature at
//! four operator defined burner points.
//!
//! ## Building blocks
//!
//! - [`parser::FrameParser`]: incremental frame decoder, one per connection.
//! - [`broker::RegisterBroker`]: routes register accesses to the sensor, the
//!   version source or the [`registers::VirtualRegisterTable`].
//! - [`dispatcher::Dispatcher`]: executes decoded frames and encodes ACK frames.
//! - [`analysis::AnalysisEngine`]: fills the analysis registers from frames.
//! - [`capture::CaptureTask`]: schedules captures for streaming and `POLL`.
//! - [`session`]: glues a transport to the dispatcher.
//! - [`client::Client`]: host side access to a device.
//!
//! ## Quick Start
//!
//! ```
//! use senxor_cmd_lib::{
//!     analysis::FrameGeometry,
//!     broker::{FirmwareVersion, MemoryRegisters, RegisterBroker},
//!     capture::PollState,
//!     checksum::Crc16Xmodem,
//!     dispatcher::Dispatcher,
//!     registers::VirtualRegisterTable,
//!     session::Session,
//!     store::MemoryStore,
//! };
//! use std::sync::{Arc, Mutex};
//!
//! let table = VirtualRegisterTable::load(FrameGeometry::default(), Box::new(MemoryStore::new()));
//! let broker = RegisterBroker::new(
//!     Arc::new(Mutex::new(table)),
//!     Arc::new(Mutex::new(MemoryRegisters::new())),
//!     Arc::new(FirmwareVersion { major: 1, minor: 0 }),
//! );
//! let dispatcher = Dispatcher::new(broker, Arc::new(PollState::new()), Crc16Xmodem);
//!
//! let mut session = Session::new();
//! let reply = session.receive(b"#000ARREGC0XXXX", &dispatcher).unwrap();
//! assert!(reply.starts_with(b"   #000CRREG0028"));
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod analysis;
pub mod broker;
pub mod capture;
pub mod checksum;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod parser;
pub mod protocol;
pub mod registers;
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod serial;
pub mod session;
pub mod store;

pub use error::{Error, Result};

/// Locks `mutex`. The guarded values stay consistent across a panic of a
/// previous holder, so a poisoned lock is taken over.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
