//! Error types for the bridge service.
//!
//! This module defines the error taxonomy shared by the connection core,
//! the scan controller, the state notifier and the D-Bus boundary, together
//! with the short error codes reported to callers.

use smol_str::SmolStr;
use thiserror::Error;

use crate::transport::ConnMethod;

/// Main error type for the bridge service.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Bluetooth adapter unavailable")]
   AdapterUnavailable,

   #[error("Bluetooth permission denied")]
   PermissionDenied,

   #[error("Slot {0} has no open connection")]
   NotConnected(u8),

   #[error("Failed to open connection to {address}: {source}")]
   OpenFailed {
      address: SmolStr,
      #[source]
      source: Box<BridgeError>,
   },

   #[error("Work queue is closed")]
   QueueClosed,

   #[error("Work queue is full")]
   QueueFull,

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Connection method not supported: {0}")]
   UnsupportedMethod(ConnMethod),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Job panicked")]
   WorkerPanicked,

   #[error("Bluetooth error: {0}")]
   Bluetooth(bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl From<bluer::Error> for BridgeError {
   fn from(err: bluer::Error) -> Self {
      use bluer::ErrorKind;
      match err.kind {
         ErrorKind::NotAuthorized | ErrorKind::NotPermitted => Self::PermissionDenied,
         ErrorKind::NotReady | ErrorKind::NotAvailable => Self::AdapterUnavailable,
         _ => Self::Bluetooth(err),
      }
   }
}

impl BridgeError {
   /// Wraps a transport-level failure as an open failure for `address`.
   pub fn open_failed(address: impl Into<SmolStr>, source: Self) -> Self {
      Self::OpenFailed {
         address: address.into(),
         source: Box::new(source),
      }
   }

   /// Short identifier reported across the boundary.
   pub const fn code(&self) -> &'static str {
      match self {
         Self::AdapterUnavailable => "bluetooth_unavailable",
         Self::PermissionDenied => "permission_denied",
         Self::NotConnected(_) => "not_connected",
         Self::OpenFailed { .. } => "open_failed",
         Self::QueueClosed => "queue_closed",
         Self::QueueFull => "queue_full",
         Self::InvalidArgument(_) => "invalid_arg",
         Self::UnsupportedMethod(_) => "unsupported_method",
         Self::RequestTimeout => "timeout",
         _ => "internal_error",
      }
   }
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
