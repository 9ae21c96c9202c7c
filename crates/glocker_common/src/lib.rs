//! Glocker Common - Shared types for the glocker daemon and its clients
//!
//! Holds everything that is pure data or pure logic: the policy config and
//! its validation, time windows, temporary exceptions, the policy evaluator,
//! the line protocol spoken over the control socket, and the socket client.

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod exception;
pub mod gate;
pub mod policy;
pub mod protocol;
pub mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigSource, Domain, ForbiddenProgram, SudoersConfig, YamlConfigSource};
pub use error::{GlockerError, Resource, Result};
pub use exception::{ExceptionSet, TemporaryException};
pub use policy::{evaluate, PolicyDecision};
pub use protocol::{Command, END_MARKER};
pub use schedule::{ClockTime, TimeWindow};
