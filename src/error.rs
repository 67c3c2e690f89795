//! Error types for the PAN server daemon.
//!
//! This module defines all error types that can occur during the operation
//! of the daemon, including Bluetooth, D-Bus, I/O and configuration errors.
//! Wire-level setup failures are not represented here; those travel as BNEP
//! response codes on the socket.

use thiserror::Error;

use crate::bnep::proto::SvcRole;

/// Main error type for the PAN server daemon.
#[derive(Error, Debug)]
pub enum PanError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("{0} server already enabled")]
   AlreadyEnabled(SvcRole),

   #[error("{0} server not enabled")]
   NotEnabled(SvcRole),

   #[error("Service record registration failed: {0}")]
   RecordRegistration(String),

   #[error("Invalid argument: {0}")]
   InvalidArgument(&'static str),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `PanError`.
pub type Result<T> = std::result::Result<T, PanError>;
