//! Bluetooth printer bridge D-Bus service
//!
//! This service connects to receipt and label printers over Classic
//! Bluetooth (RFCOMM) or BLE (GATT) through BlueZ and exposes scanning,
//! connection management and raw data writes on the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, object_server::InterfaceRef};

use adapter::BluezAdapter;
use bridge::Bridge;
use dbus::{BUS_NAME, BridgeService, OBJECT_PATH};
use event::{BridgeEvent, EventBus};
use transport::BluezConnector;

mod adapter;
mod bridge;
mod config;
mod connection;
mod dbus;
mod error;
mod event;
mod notifier;
mod scan;
mod transport;

use crate::{dbus::BridgeServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btbridge D-Bus service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices, default method {}",
      config.known_devices.len(),
      config.default_method
   );

   let event_bus = EventProcessor::new();

   let session = bluer::Session::new().await?;
   let adapter = BluezAdapter::new(&session, &config).await;
   let connector = BluezConnector::new(adapter.raw(), &config);
   let bridge = Arc::new(Bridge::new(
      Arc::new(adapter),
      Arc::new(connector),
      event_bus.clone(),
      &config,
   ));

   let connection = zbus::connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, BridgeService::new(bridge.clone()))?
      .build()
      .await?;

   info!("btbridge D-Bus service started at {BUS_NAME}");

   event_bus.spawn_dispatcher(connection).await?;

   if bridge.is_available() {
      if let Err(e) = bridge.listen_state().await {
         warn!("Failed to observe adapter state: {e}");
      }
   } else {
      warn!("No Bluetooth adapter present, only availability queries will succeed");
   }

   signal::ctrl_c().await?;
   info!("Shutting down btbridge service...");
   bridge.shutdown().await?;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<BridgeEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<BridgeEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<BridgeService>, event: BridgeEvent) -> Result<()> {
      match event {
         BridgeEvent::State(state) => {
            iface.state_changed(state).await?;
         },
         BridgeEvent::ScanResult(device) => {
            iface
               .scan_result(&device.address, &device.name, device.device_type)
               .await?;
         },
         BridgeEvent::DataReceived { slot, bytes } => {
            iface.data_received(slot, &hex::encode(&bytes)).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BridgeService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: BridgeEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
