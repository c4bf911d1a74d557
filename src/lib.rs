//! Driver for line-oriented ASCII command devices on a serial port.
//!
//! The device (typically a microcontroller board) answers text commands such
//! as `analog(0b000101)` with text lines. This crate keeps a link to it alive,
//! polls selected analog channels on a fixed period and records the values
//! into per-channel segmented time series.
//!
//! # Layout
//!
//! - [`transport`]: the [`Backend`]/[`Transport`] seams and the `serialport` backend
//! - [`protocol`]: line framing and command/reply exchanges with a settle delay
//! - [`command`] and [`grammar`]: command encoding, reply classification, the
//!   firmware's syntax rules
//! - [`link`]: port discovery and connection upkeep
//! - [`acquisition`] and [`channel`]: the recording state machine and its data
//! - [`scheduler`]: cooperative periodic timers
//! - [`session`]: the facade tying everything together, driven by `tick(now)`
//! - [`runner`]: an async loop that drives a session in real time
//! - [`sim`]: an in-memory device for tests and demos
//!
//! # Example
//!
//! ```no_run
//! use std::time::Instant;
//! use analog_serial::{DriverConfig, SerialBackend, Session};
//!
//! let config = DriverConfig::default();
//! let mut session = Session::new(SerialBackend::from_config(&config), config)?;
//! session.tick(Instant::now()); // discover and connect
//! session.start(Instant::now())?;
//! # Ok::<(), analog_serial::DriverError>(())
//! ```

pub mod acquisition;
pub mod channel;
pub mod command;
pub mod config;
pub mod errors;
pub mod grammar;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use acquisition::{AcquisitionController, AcquisitionState, TickStats};
pub use channel::{ChannelBuffer, Sample};
pub use command::{Command, Reply, ReplyKind, Status, StatusKind};
pub use config::DriverConfig;
pub use errors::*;
pub use link::{LinkEvent, LinkManager, SerialState};
pub use scheduler::{Scheduler, Tick};
pub use session::{Session, SessionEvent, Snapshot, UserReply};
pub use sim::{SimBackend, SimDevice};
pub use transport::{Backend, PortInfo, SerialBackend, Transport};
