use std::sync::Arc;

use log::warn;
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{adapter::STATE_OFF, bridge::Bridge};

pub const BUS_NAME: &str = "org.btbridge";
pub const OBJECT_PATH: &str = "/org/btbridge/bridge";

pub struct BridgeService {
   bridge: Arc<Bridge>,
}

impl BridgeService {
   pub const fn new(bridge: Arc<Bridge>) -> Self {
      Self { bridge }
   }
}

#[interface(name = "org.btbridge.Bridge")]
impl BridgeService {
   /// Calls a bridge method. `args` and the result are JSON documents; an
   /// empty `args` string means no arguments. Failures carry the error code
   /// in front of the message, e.g. `bytes_empty: missing bytes`.
   async fn invoke(&self, method: String, args: String) -> fdo::Result<String> {
      let args = if args.trim().is_empty() {
         serde_json::Value::Null
      } else {
         serde_json::from_str(&args).map_err(|e| fdo::Error::InvalidArgs(format!("invalid_arg: {e}")))?
      };

      match self.bridge.invoke(&method, &args).await {
         Ok(value) => Ok(value.to_string()),
         Err(e) if e.is_invalid_args() => Err(fdo::Error::InvalidArgs(e.to_string())),
         Err(e) if e.is_not_implemented() => Err(fdo::Error::UnknownMethod(e.to_string())),
         Err(e) => {
            warn!("{method} failed: {e}");
            Err(fdo::Error::Failed(e.to_string()))
         },
      }
   }

   // Signals
   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: i32) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_result(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
      device_type: i32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(emitter: &SignalEmitter<'_>, slot: u8, data: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn available(&self) -> bool {
      self.bridge.is_available()
   }

   #[zbus(property)]
   async fn adapter_state(&self) -> i32 {
      self.bridge.state().await.unwrap_or(STATE_OFF)
   }
}
