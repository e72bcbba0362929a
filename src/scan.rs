//! Device discovery.

use futures::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   adapter::SharedAdapter,
   error::{BridgeError, Result},
   event::DiscoveredDevice,
};

/// Pending scan results per listener before discovery is throttled
const SCAN_BUFFER: usize = 64;

/// Runs at most one discovery session at a time.
pub struct ScanController {
   adapter: SharedAdapter,
   active: Mutex<Option<JoinHandle<()>>>,
}

impl ScanController {
   pub fn new(adapter: SharedAdapter) -> Self {
      Self {
         adapter,
         active: Mutex::new(None),
      }
   }

   /// Starts discovery and returns its results.
   ///
   /// Every discovery callback for a named device is delivered, so the same
   /// device shows up again whenever its advertisement changes. A scan that
   /// is already running is replaced and its channel closes.
   pub async fn start_scan(&self) -> Result<mpsc::Receiver<DiscoveredDevice>> {
      if !self.adapter.is_available() || !self.adapter.is_on().await? {
         return Err(BridgeError::AdapterUnavailable);
      }
      self.adapter.check_scan_permission().await?;

      let mut devices = self.adapter.discover().await?;
      let (tx, rx) = mpsc::channel(SCAN_BUFFER);
      let task = tokio::spawn(async move {
         while let Some(device) = devices.next().await {
            if device.name.is_empty() {
               continue;
            }
            if tx.send(device).await.is_err() {
               break;
            }
         }
         debug!("Discovery stream ended");
      });

      if let Some(previous) = self.active.lock().replace(task) {
         previous.abort();
         debug!("Replaced running scan");
      }
      info!("Scan started");
      Ok(rx)
   }

   /// Stops discovery. Returns `false` if no scan was running.
   pub fn stop_scan(&self) -> bool {
      match self.active.lock().take() {
         Some(task) => {
            task.abort();
            info!("Scan stopped");
            true
         },
         None => false,
      }
   }
}

impl Drop for ScanController {
   fn drop(&mut self) {
      if let Some(task) = self.active.get_mut().take() {
         task.abort();
      }
   }
}
