//! # PEMF Protocol Bridge Library
//!
//! Decodes and re-drives the serial command protocol spoken by PEMF therapy
//! devices.
//!
//! Offline, capture logs go through [`trace`] and [`recovery`] to produce
//! corrected operation traces. At runtime, [`handshake`] identifies the
//! attached variant and [`executor`] replays stage templates from
//! [`registry`] against it, driven by the [`controller`] worker.
//!
//! [`sim`] provides a simulated device for tests and bench setups.

pub mod config;
pub mod controller;
pub mod executor;
pub mod handshake;
pub mod link;
pub mod recovery;
pub mod registry;
pub mod sim;
pub mod trace;

pub use config::BridgeConfig;
pub use controller::{BridgeError, PlaybackController, RunState, StatusSnapshot};
pub use executor::{Row, Treatment};
pub use registry::{DeviceType, DeviceVariant};
