//! Provisions a reMarkable tablet over SSH: installs the XOVI native
//! extension framework, the AppLoad launcher and optionally KOReader through
//! a staged, resumable installation pipeline.
//!
//! The crate is a library; a CLI or GUI front end constructs the components
//! explicitly and wires them together:
//!
//! - [`session::SshSession`]: authenticated connection to the device,
//!   command execution and file transfer
//! - [`artifacts::ArtifactStore`]: local downloads, extraction, scratch files
//! - [`backup::BackupManager`]: on-device snapshots and restore
//! - [`stage::StageMachine`]: persisted, resumable installation state
//! - [`installer::InstallOrchestrator`]: the staged installation driver

pub mod artifacts;
pub mod backup;
pub mod config;
pub mod installer;
pub mod logging;
pub mod models;
pub mod remote;
pub mod scripts;
pub mod session;
pub mod stage;
mod utils;

pub use installer::{DeviceTarget, InstallOrchestrator};
pub use session::{ConnectOptions, SshSession};
pub use stage::{InstallStage, InstallationType, StageMachine};
