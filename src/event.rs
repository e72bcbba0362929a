//! Event handling for adapter state, scan results and inbound data.
//!
//! Producers inside the service push [`BridgeEvent`]s through an
//! [`EventBus`]; the daemon turns them into D-Bus signals.

use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;

use crate::transport::Packet;

/// ACL link came up.
pub const ACL_CONNECTED: i32 = 1;
/// ACL link went down.
pub const ACL_DISCONNECTED: i32 = 0;

/// Platform device type codes reported with scan results.
pub const DEVICE_TYPE_UNKNOWN: i32 = 0;
pub const DEVICE_TYPE_CLASSIC: i32 = 1;
pub const DEVICE_TYPE_LE: i32 = 2;
pub const DEVICE_TYPE_DUAL: i32 = 3;

/// Observed adapter or link-level state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
   /// Raw adapter power state code.
   Adapter(i32),
   AclConnected,
   AclDisconnected,
}

impl StateEvent {
   /// Integer delivered to listeners.
   pub const fn code(self) -> i32 {
      match self {
         Self::Adapter(state) => state,
         Self::AclConnected => ACL_CONNECTED,
         Self::AclDisconnected => ACL_DISCONNECTED,
      }
   }
}

/// A device reported by one discovery callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
   pub address: SmolStr,
   pub name: SmolStr,
   #[serde(rename = "type")]
   pub device_type: i32,
}

/// Events that can be emitted by the bridge service.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
   State(i32),
   ScanResult(DiscoveredDevice),
   DataReceived { slot: u8, bytes: Packet },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   fn emit(&self, event: BridgeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
