//! Adapter power and ACL link notifications.

use futures::StreamExt;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{adapter::SharedAdapter, error::Result};

/// Delivers state codes to a single listener.
pub struct StateNotifier {
   adapter: SharedAdapter,
   listener: Mutex<Option<JoinHandle<()>>>,
}

impl StateNotifier {
   pub fn new(adapter: SharedAdapter) -> Self {
      Self {
         adapter,
         listener: Mutex::new(None),
      }
   }

   /// Registers a new listener, replacing the current one.
   ///
   /// The stream carries raw adapter state codes and ACL events (`1`
   /// connected, `0` disconnected) in arrival order. The previous
   /// listener's channel closes.
   pub async fn listen(&self) -> Result<mpsc::UnboundedReceiver<i32>> {
      let mut events = self.adapter.state_events().await?;
      let (tx, rx) = mpsc::unbounded_channel();
      let task = tokio::spawn(async move {
         while let Some(event) = events.next().await {
            debug!("State event {event:?}");
            if tx.send(event.code()).is_err() {
               break;
            }
         }
      });

      if let Some(previous) = self.listener.lock().replace(task) {
         previous.abort();
         debug!("Replaced state listener");
      }
      info!("State listener registered");
      Ok(rx)
   }

   /// Drops the listener. Returns `false` if none was registered.
   pub fn cancel(&self) -> bool {
      let Some(task) = self.listener.lock().take() else {
         return false;
      };
      task.abort();
      info!("State listener cancelled");
      true
   }
}

impl Drop for StateNotifier {
   fn drop(&mut self) {
      if let Some(task) = self.listener.get_mut().take() {
         task.abort();
      }
   }
}
