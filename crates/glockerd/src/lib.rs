//! Glocker Daemon - Enforces domain, firewall and sudo restrictions
//!
//! The binary is a thin shell around [`daemon::Daemon`]. Everything that
//! touches the machine goes through [`system::System`], so the whole daemon
//! can be driven in tests with fakes and a manual clock.

pub mod audit;
pub mod commands;
pub mod context;
pub mod daemon;
pub mod firewall;
pub mod forbidden;
pub mod gateway;
pub mod hosts;
pub mod notifier;
pub mod panic;
pub mod reconciler;
pub mod signals;
pub mod state;
pub mod sudoers;
pub mod system;
pub mod tamper;
pub mod uninstall;
pub mod violations;

pub use context::DaemonContext;
pub use daemon::Daemon;
pub use reconciler::{run_cycle, CycleReport};
pub use state::StateStore;
pub use system::System;
pub use violations::ViolationEvent;
