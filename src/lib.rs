//! Control and monitoring for the DSSC detector.
//!
//! The crate implements three cooperating devices on top of a narrow
//! remote-device middleware abstraction:
//!
//! - [`control`]: the main control device, fusing the quadrant PPT and
//!   power-procedure states into one detector state, guarding the PPT
//!   locks, and orchestrating measurement sweeps.
//! - [`veto`]: the data validator, replaying the veto pattern in software
//!   and checking detector output train by train.
//! - [`configurator`]: the gain-configuration synchronizer.
//!
//! [`middleware::mock`] provides an in-process middleware so the whole
//! stack runs and is tested without hardware.

pub mod aggregator;
pub mod config;
pub mod configurator;
pub mod control;
pub mod error;
pub mod fusion;
pub mod middleware;
pub mod sweep;
pub mod veto;

pub use config::Settings;
pub use error::{AppResult, ControlError};
