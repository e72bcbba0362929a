//! Printer bridge service.
//!
//! [`Bridge`] is the top-level service object. It owns the connection
//! manager, the scan controller and the state notifier, answers method
//! calls by name with JSON arguments, and pushes scan results, state codes
//! and inbound data onto the [`EventBus`].
//!
//! Method calls mirror the client boundary:
//!
//! | method        | arguments                               | result            |
//! |---------------|-----------------------------------------|-------------------|
//! | `state`       |                                         | state code        |
//! | `isAvailable` |                                         | bool              |
//! | `isOn`        |                                         | bool              |
//! | `startScan`   |                                         | null              |
//! | `stopScan`    |                                         | null              |
//! | `connect`     | `address`, `method?`, `wait?`           | `true`            |
//! | `disconnect`  |                                         | `true`            |
//! | `destroy`     |                                         | `true`            |
//! | `init`        |                                         | bool              |
//! | `writeData`   | `bytes`, `wait?`                        | null              |
//! | `status`      | `slot?`                                 | slot status       |
//! | `listenState` |                                         | `true`            |
//! | `cancelState` |                                         | bool              |
//!
//! `connect` returns once the open is queued unless `wait` is `true`;
//! `writeData` waits for the write unless `wait` is `false`. An empty
//! `bytes` list is queued as an empty write.

use std::{str::FromStr, sync::Arc};

use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
   adapter::SharedAdapter,
   config::Config,
   connection::{
      PRIMARY_SLOT, SlotId,
      manager::ConnectionManager,
      payload,
      queue::Completion,
      reader::InboundSink,
   },
   error::{BridgeError, Result},
   event::{BridgeEvent, EventSender},
   notifier::StateNotifier,
   scan::ScanController,
   transport::{ConnMethod, Packet, SharedConnector, Target},
};

const START_SCAN_ERROR: &str = "startScan_error";
const STATE_ERROR: &str = "state_error";
const INVALID_ARG: &str = "invalid_arg";
const BYTES_EMPTY: &str = "bytes_empty";
const NOT_IMPLEMENTED: &str = "not_implemented";

/// Failed method call, reported to the caller as `code` plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct CallError {
   pub code: &'static str,
   pub message: String,
}

impl CallError {
   fn new(code: &'static str, message: impl Into<String>) -> Self {
      Self {
         code,
         message: message.into(),
      }
   }

   /// Whether the caller sent a malformed request.
   pub fn is_invalid_args(&self) -> bool {
      matches!(self.code, INVALID_ARG | BYTES_EMPTY)
   }

   pub fn is_not_implemented(&self) -> bool {
      self.code == NOT_IMPLEMENTED
   }
}

impl From<BridgeError> for CallError {
   fn from(err: BridgeError) -> Self {
      Self::new(err.code(), err.to_string())
   }
}

pub type CallResult = std::result::Result<Value, CallError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
#[strum(serialize_all = "camelCase")]
enum Method {
   State,
   IsAvailable,
   IsOn,
   StartScan,
   StopScan,
   Connect,
   Disconnect,
   Destroy,
   Init,
   WriteData,
   Status,
   ListenState,
   CancelState,
}

pub struct Bridge {
   adapter: SharedAdapter,
   manager: ConnectionManager,
   scan: ScanController,
   notifier: StateNotifier,
   events: EventSender,
   default_method: ConnMethod,
}

impl Bridge {
   pub fn new(
      adapter: SharedAdapter,
      connector: SharedConnector,
      events: EventSender,
      config: &Config,
   ) -> Self {
      let inbound = events.clone();
      let sink: InboundSink = Arc::new(move |slot: SlotId, bytes: &[u8]| {
         inbound.emit(BridgeEvent::DataReceived {
            slot,
            bytes: Packet::from_slice(bytes),
         });
      });

      Self {
         manager: ConnectionManager::new(connector, sink, config.queue_capacity),
         scan: ScanController::new(adapter.clone()),
         notifier: StateNotifier::new(adapter.clone()),
         adapter,
         events,
         default_method: config.default_method,
      }
   }

   pub fn is_available(&self) -> bool {
      self.adapter.is_available()
   }

   pub async fn state(&self) -> Result<i32> {
      self.adapter.state().await
   }

   /// Dispatches a method call by name.
   pub async fn invoke(&self, method: &str, args: &Value) -> CallResult {
      debug!("Call {method} {args}");
      if method != "isAvailable" && !self.adapter.is_available() {
         return Err(BridgeError::AdapterUnavailable.into());
      }
      let Ok(call) = Method::from_str(method) else {
         warn!("Unknown method {method}");
         return Err(CallError::new(NOT_IMPLEMENTED, format!("{method} is not implemented")));
      };

      match call {
         Method::State => match self.adapter.state().await {
            Ok(state) => Ok(state.into()),
            Err(e) => {
               warn!("Failed to read adapter state: {e}");
               Err(CallError::new(STATE_ERROR, e.to_string()))
            },
         },
         Method::IsAvailable => Ok(self.adapter.is_available().into()),
         Method::IsOn => Ok(self.adapter.is_on().await?.into()),
         Method::StartScan => self.start_scan().await.map(|()| Value::Null),
         Method::StopScan => {
            self.scan.stop_scan();
            Ok(Value::Null)
         },
         Method::Connect => self.connect(args).await,
         Method::Disconnect => {
            self.manager.disconnect(PRIMARY_SLOT).await?;
            Ok(true.into())
         },
         Method::Destroy => {
            self.destroy().await?;
            Ok(true.into())
         },
         Method::Init => Ok(self.manager.reinit().into()),
         Method::ListenState => {
            self.listen_state().await?;
            Ok(true.into())
         },
         Method::CancelState => Ok(self.cancel_state().into()),
         Method::WriteData => self.write_data(args).await,
         Method::Status => {
            let slot = match args.get("slot") {
               None | Some(Value::Null) => PRIMARY_SLOT,
               Some(slot) => slot
                  .as_u64()
                  .and_then(|s| SlotId::try_from(s).ok())
                  .ok_or_else(|| CallError::new(INVALID_ARG, format!("invalid slot {slot}")))?,
            };
            let status = serde_json::to_value(self.manager.status(slot)).map_err(BridgeError::from)?;
            Ok(status)
         },
      }
   }

   async fn start_scan(&self) -> std::result::Result<(), CallError> {
      let mut results = match self.scan.start_scan().await {
         Ok(results) => results,
         Err(BridgeError::PermissionDenied) => return Err(BridgeError::PermissionDenied.into()),
         Err(e) => {
            warn!("Failed to start scan: {e}");
            return Err(CallError::new(START_SCAN_ERROR, e.to_string()));
         },
      };

      let events = self.events.clone();
      tokio::spawn(async move {
         while let Some(device) = results.recv().await {
            events.emit(BridgeEvent::ScanResult(device));
         }
      });
      Ok(())
   }

   async fn connect(&self, args: &Value) -> CallResult {
      let Some(address) = args.get("address").and_then(Value::as_str) else {
         return Err(CallError::new(INVALID_ARG, "missing address"));
      };
      let method = match args.get("method").and_then(Value::as_str) {
         Some(method) => ConnMethod::from_str(method)
            .map_err(|_| CallError::new(INVALID_ARG, format!("unknown connection method {method}")))?,
         None => self.default_method,
      };

      info!("Connecting to {address} via {method}");
      let opened = self
         .manager
         .connect(PRIMARY_SLOT, Target::new(address, method))
         .await?;
      settle(opened, args, false).await?;
      Ok(true.into())
   }

   async fn write_data(&self, args: &Value) -> CallResult {
      let values: Vec<i64> = match args.get("bytes") {
         None | Some(Value::Null) => return Err(CallError::new(BYTES_EMPTY, "missing bytes")),
         Some(bytes) => serde_json::from_value(bytes.clone()).map_err(|e| {
            CallError::new(INVALID_ARG, format!("bytes must be a list of integers: {e}"))
         })?,
      };
      let written = self.manager.write(PRIMARY_SLOT, payload::encode(&values))?;
      settle(written, args, true).await?;
      Ok(Value::Null)
   }

   /// Starts forwarding adapter and ACL state codes to the event bus,
   /// replacing any previous listener.
   pub async fn listen_state(&self) -> Result<()> {
      let mut codes: mpsc::UnboundedReceiver<i32> = self.notifier.listen().await?;
      let events = self.events.clone();
      tokio::spawn(async move {
         while let Some(code) = codes.recv().await {
            events.emit(BridgeEvent::State(code));
         }
      });
      Ok(())
   }

   pub fn cancel_state(&self) -> bool {
      self.notifier.cancel()
   }

   /// Closes every connection and stops the work queue.
   pub async fn destroy(&self) -> Result<()> {
      self.manager.destroy().await
   }

   /// Stops everything before the process exits.
   pub async fn shutdown(&self) -> Result<()> {
      self.scan.stop_scan();
      self.cancel_state();
      self.destroy().await
   }
}

/// Waits for a queued job according to the caller's `wait` argument.
async fn settle(completion: Completion, args: &Value, wait_by_default: bool) -> Result<()> {
   if args.get("wait").and_then(Value::as_bool).unwrap_or(wait_by_default) {
      completion.wait().await
   } else {
      completion.detach();
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::atomic::Ordering, time::Duration};

   use parking_lot::Mutex;
   use serde_json::json;
   use tokio::time;

   use super::*;
   use crate::{
      adapter::{STATE_OFF, STATE_ON, fake::FakeAdapter},
      event::{DEVICE_TYPE_LE, DiscoveredDevice, EventBus, StateEvent},
      transport::fake::FakeConnector,
   };

   #[derive(Default)]
   struct Collector(Mutex<Vec<BridgeEvent>>);

   impl EventBus for Collector {
      fn emit(&self, event: BridgeEvent) {
         self.0.lock().push(event);
      }
   }

   impl Collector {
      async fn wait_for(&self, pred: impl Fn(&BridgeEvent) -> bool) -> bool {
         for _ in 0..200 {
            if self.0.lock().iter().any(&pred) {
               return true;
            }
            time::sleep(Duration::from_millis(5)).await;
         }
         false
      }
   }

   struct Harness {
      bridge: Bridge,
      adapter: Arc<FakeAdapter>,
      connector: Arc<FakeConnector>,
      events: Arc<Collector>,
   }

   fn harness(available: bool, powered: bool) -> Harness {
      let adapter = FakeAdapter::new(available, powered);
      let connector = FakeConnector::new(Some(adapter.clone()));
      let events = Arc::new(Collector::default());
      let bridge = Bridge::new(
         adapter.clone(),
         connector.clone(),
         events.clone(),
         &Config::default(),
      );
      Harness {
         bridge,
         adapter,
         connector,
         events,
      }
   }

   const ADDR: &str = "AA:BB:CC:DD:EE:FF";

   #[tokio::test]
   async fn test_only_is_available_works_without_adapter() {
      let h = harness(false, false);

      assert_eq!(h.bridge.invoke("isAvailable", &Value::Null).await, Ok(json!(false)));
      for method in ["state", "isOn", "startScan", "connect", "writeData", "destroy", "bogus"] {
         let err = h.bridge.invoke(method, &Value::Null).await.unwrap_err();
         assert_eq!(err.code, "bluetooth_unavailable", "{method}");
      }
   }

   #[tokio::test]
   async fn test_state_and_power() {
      let h = harness(true, true);
      assert_eq!(h.bridge.invoke("state", &Value::Null).await, Ok(json!(STATE_ON)));
      assert_eq!(h.bridge.invoke("isOn", &Value::Null).await, Ok(json!(true)));

      h.adapter.powered.store(false, Ordering::SeqCst);
      assert_eq!(h.bridge.invoke("state", &Value::Null).await, Ok(json!(STATE_OFF)));
      assert_eq!(h.bridge.invoke("isOn", &Value::Null).await, Ok(json!(false)));
   }

   #[tokio::test]
   async fn test_unknown_method() {
      let h = harness(true, true);
      let err = h.bridge.invoke("printQrCode", &Value::Null).await.unwrap_err();
      assert!(err.is_not_implemented());
   }

   #[tokio::test]
   async fn test_argument_checks() {
      let h = harness(true, true);

      let err = h.bridge.invoke("connect", &json!({})).await.unwrap_err();
      assert_eq!(err.code, "invalid_arg");
      let err = h
         .bridge
         .invoke("connect", &json!({"address": ADDR, "method": "serial"}))
         .await
         .unwrap_err();
      assert_eq!(err.code, "invalid_arg");

      let err = h.bridge.invoke("writeData", &json!({})).await.unwrap_err();
      assert_eq!(err.code, "bytes_empty");
      let err = h.bridge.invoke("writeData", &json!({"bytes": "hi"})).await.unwrap_err();
      assert!(err.is_invalid_args());
      assert_eq!(h.connector.opens(), 0);
   }

   #[tokio::test]
   async fn test_connect_then_write() {
      let h = harness(true, true);
      h.bridge.listen_state().await.unwrap();

      assert_eq!(h.bridge.invoke("connect", &json!({"address": ADDR})).await, Ok(json!(true)));
      let written = h
         .bridge
         .invoke("writeData", &json!({"bytes": [72, 101, 108, 108, 111]}))
         .await;
      assert_eq!(written, Ok(Value::Null));
      h.bridge
         .invoke("writeData", &json!({"bytes": [200]}))
         .await
         .unwrap();

      assert_eq!(
         *h.connector.written.lock(),
         vec![vec![72, 101, 108, 108, 111], vec![0xC8]]
      );
      assert!(h.events.wait_for(|e| matches!(e, BridgeEvent::State(1))).await);

      let status = h.bridge.invoke("status", &Value::Null).await.unwrap();
      assert_eq!(status["state"], "open");
      assert_eq!(status["address"], ADDR);
      assert_eq!(status["method"], "classic_bt");
   }

   #[tokio::test]
   async fn test_write_without_connection_is_reported() {
      let h = harness(true, true);

      let detached = h.bridge.invoke("writeData", &json!({"bytes": [1], "wait": false})).await;
      assert_eq!(detached, Ok(Value::Null));
      let err = h.bridge.invoke("writeData", &json!({"bytes": [1]})).await.unwrap_err();
      assert_eq!(err.code, "not_connected");
   }

   #[tokio::test]
   async fn test_destroy_twice_then_init() {
      let h = harness(true, true);
      h.bridge
         .invoke("connect", &json!({"address": ADDR, "wait": true}))
         .await
         .unwrap();

      assert_eq!(h.bridge.invoke("destroy", &Value::Null).await, Ok(json!(true)));
      assert_eq!(h.bridge.invoke("destroy", &Value::Null).await, Ok(json!(true)));
      assert_eq!(h.connector.live(), 0);
      assert_eq!(h.bridge.invoke("disconnect", &Value::Null).await, Ok(json!(true)));

      let err = h
         .bridge
         .invoke("connect", &json!({"address": ADDR}))
         .await
         .unwrap_err();
      assert_eq!(err.code, "queue_closed");

      assert_eq!(h.bridge.invoke("init", &Value::Null).await, Ok(json!(true)));
      assert_eq!(h.bridge.invoke("init", &Value::Null).await, Ok(json!(false)));
      h.bridge
         .invoke("connect", &json!({"address": ADDR, "wait": true}))
         .await
         .unwrap();
      assert_eq!(h.connector.opens(), 2);
   }

   #[tokio::test]
   async fn test_scan_errors() {
      let h = harness(true, false);
      let err = h.bridge.invoke("startScan", &Value::Null).await.unwrap_err();
      assert_eq!(err.code, "startScan_error");

      let h = harness(true, true);
      h.adapter.permitted.store(false, Ordering::SeqCst);
      let err = h.bridge.invoke("startScan", &Value::Null).await.unwrap_err();
      assert_eq!(err.code, "permission_denied");
   }

   #[tokio::test]
   async fn test_scan_results_are_pushed() {
      let h = harness(true, true);
      assert_eq!(h.bridge.invoke("startScan", &Value::Null).await, Ok(Value::Null));

      h.adapter.push_device(DiscoveredDevice {
         address: ADDR.into(),
         name: "MTP-II".into(),
         device_type: DEVICE_TYPE_LE,
      });
      assert!(
         h.events
            .wait_for(|e| matches!(e, BridgeEvent::ScanResult(d) if d.name == "MTP-II"))
            .await
      );

      assert_eq!(h.bridge.invoke("stopScan", &Value::Null).await, Ok(Value::Null));
      assert_eq!(h.bridge.invoke("stopScan", &Value::Null).await, Ok(Value::Null));
   }

   #[tokio::test]
   async fn test_empty_bytes_are_queued() {
      let h = harness(true, true);

      let err = h.bridge.invoke("writeData", &json!({"bytes": []})).await.unwrap_err();
      assert_eq!(err.code, "not_connected");

      h.bridge.invoke("connect", &json!({"address": ADDR})).await.unwrap();
      assert_eq!(h.bridge.invoke("writeData", &json!({"bytes": []})).await, Ok(Value::Null));
      assert_eq!(*h.connector.written.lock(), vec![Vec::<u8>::new()]);
   }

   #[tokio::test]
   async fn test_state_and_inbound_events() {
      let h = harness(true, true);
      assert_eq!(h.bridge.invoke("listenState", &Value::Null).await, Ok(json!(true)));
      h.adapter.push_state(StateEvent::Adapter(STATE_OFF));
      assert!(h.events.wait_for(|e| matches!(e, BridgeEvent::State(10))).await);

      h.bridge
         .invoke("connect", &json!({"address": ADDR, "wait": true}))
         .await
         .unwrap();
      let peer = h.connector.inbound.lock().clone().unwrap();
      peer.send(vec![0x12, 0x34]).unwrap();
      assert!(
         h.events
            .wait_for(|e| matches!(
               e,
               BridgeEvent::DataReceived { slot: 0, bytes } if bytes.as_slice() == [0x12, 0x34]
            ))
            .await
      );

      assert_eq!(h.bridge.invoke("cancelState", &Value::Null).await, Ok(json!(true)));
      assert_eq!(h.bridge.invoke("cancelState", &Value::Null).await, Ok(json!(false)));
   }

   #[tokio::test]
   async fn test_listen_state_after_destroy_and_init() {
      let h = harness(true, true);
      h.bridge.invoke("destroy", &Value::Null).await.unwrap();
      h.bridge.invoke("init", &Value::Null).await.unwrap();

      assert_eq!(h.bridge.invoke("listenState", &Value::Null).await, Ok(json!(true)));
      h.adapter.push_state(StateEvent::AclDisconnected);
      assert!(h.events.wait_for(|e| matches!(e, BridgeEvent::State(0))).await);
   }
}
