//! Connection manager.
//!
//! Slots live inside [`SlotWorker`], which only the queue worker touches.
//! Callers see a snapshot of slot states that the worker republishes after
//! every transition, so status reads may briefly lag behind queued jobs.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use smol_str::SmolStr;

use super::{
   SlotId,
   queue::{Completion, JobHandler, SerialQueue},
   reader::{InboundSink, ReaderTask},
};
use crate::{
   error::{BridgeError, Result},
   transport::{ConnMethod, LinkWriter, Packet, SharedConnector, Target},
};

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SlotState {
   #[default]
   Unconnected,
   Opening,
   Open,
   Closing,
}

/// Point-in-time view of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
   pub slot: SlotId,
   pub address: Option<SmolStr>,
   pub method: Option<ConnMethod>,
   pub state: SlotState,
}

impl SlotStatus {
   const fn unconnected(slot: SlotId) -> Self {
      Self {
         slot,
         address: None,
         method: None,
         state: SlotState::Unconnected,
      }
   }
}

type Snapshot = Arc<RwLock<HashMap<SlotId, SlotStatus>>>;

/// Work executed against the slots.
pub enum Job {
   Open { slot: SlotId, target: Target },
   Write { slot: SlotId, data: Packet },
   Close { slot: SlotId },
}

impl fmt::Debug for Job {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Open { slot, target } => {
            write!(f, "open slot {slot} -> {} ({})", target.address, target.method)
         },
         Self::Write { slot, data } => write!(f, "write {} bytes to slot {slot}", data.len()),
         Self::Close { slot } => write!(f, "close slot {slot}"),
      }
   }
}

struct Slot {
   target: Target,
   state: SlotState,
   writer: Option<Box<dyn LinkWriter>>,
   reader: Option<ReaderTask>,
}

fn publish(snapshot: &Snapshot, id: SlotId, slot: &Slot) {
   snapshot.write().insert(id, SlotStatus {
      slot: id,
      address: Some(slot.target.address.clone()),
      method: Some(slot.target.method),
      state: slot.state,
   });
}

/// Owns the slots; runs on the queue worker.
pub struct SlotWorker {
   connector: SharedConnector,
   sink: InboundSink,
   snapshot: Snapshot,
   slots: HashMap<SlotId, Slot>,
}

impl SlotWorker {
   fn new(connector: SharedConnector, sink: InboundSink, snapshot: Snapshot) -> Self {
      Self {
         connector,
         sink,
         snapshot,
         slots: HashMap::new(),
      }
   }

   async fn open(&mut self, id: SlotId, target: Target) -> Result<()> {
      // A slot never holds two links.
      self.close(id).await;

      let slot = self.slots.entry(id).or_insert_with(|| Slot {
         target: target.clone(),
         state: SlotState::Unconnected,
         writer: None,
         reader: None,
      });
      slot.target = target;
      slot.state = SlotState::Opening;
      publish(&self.snapshot, id, slot);
      info!(
         "Opening slot {id} to {} via {}",
         slot.target.address, slot.target.method
      );

      match self.connector.open(&slot.target).await {
         Ok(link) => {
            if let Some(stale) = slot.reader.take() {
               error!("Slot {id} still had a reader running, cancelling it");
               stale.cancel().await;
            }
            slot.reader = Some(ReaderTask::spawn(id, link.reader, self.sink.clone()));
            slot.writer = Some(link.writer);
            slot.state = SlotState::Open;
            publish(&self.snapshot, id, slot);
            info!("Slot {id} open to {}", slot.target.address);
            Ok(())
         },
         Err(e) => {
            slot.state = SlotState::Unconnected;
            publish(&self.snapshot, id, slot);
            error!("Failed to open slot {id}: {e}");
            Err(e)
         },
      }
   }

   async fn write(&mut self, id: SlotId, data: &[u8]) -> Result<()> {
      let lost = match self.slots.get(&id) {
         Some(slot) if slot.state == SlotState::Open => {
            slot.reader.as_ref().is_some_and(ReaderTask::is_finished)
         },
         _ => return Err(BridgeError::NotConnected(id)),
      };
      if lost {
         warn!("Slot {id} was dropped by the peer");
         self.close(id).await;
         return Err(BridgeError::NotConnected(id));
      }

      let writer = self
         .slots
         .get_mut(&id)
         .and_then(|slot| slot.writer.as_mut())
         .ok_or(BridgeError::NotConnected(id))?;
      writer.write(data).await
   }

   async fn close(&mut self, id: SlotId) {
      let Some(slot) = self.slots.get_mut(&id) else {
         return;
      };
      let Some(mut writer) = slot.writer.take() else {
         return;
      };

      slot.state = SlotState::Closing;
      publish(&self.snapshot, id, slot);

      // Stop reading before the handle goes away.
      if let Some(reader) = slot.reader.take() {
         reader.cancel().await;
      }
      if let Err(e) = writer.close().await {
         warn!("Error closing slot {id}: {e}");
      }

      slot.state = SlotState::Unconnected;
      publish(&self.snapshot, id, slot);
      info!("Slot {id} closed");
   }
}

#[async_trait]
impl JobHandler for SlotWorker {
   type Job = Job;

   async fn handle(&mut self, job: Job) -> Result<()> {
      match job {
         Job::Open { slot, target } => self.open(slot, target).await,
         Job::Write { slot, data } => self.write(slot, &data).await,
         Job::Close { slot } => {
            self.close(slot).await;
            Ok(())
         },
      }
   }

   async fn shutdown(&mut self) {
      let ids: Vec<SlotId> = self.slots.keys().copied().collect();
      for id in ids {
         self.close(id).await;
      }
   }
}

/// Owns the device connections and serializes every operation on them.
pub struct ConnectionManager {
   queue: SerialQueue<SlotWorker>,
   connector: SharedConnector,
   sink: InboundSink,
   snapshot: Snapshot,
}

impl ConnectionManager {
   /// Starts the manager's work queue. `queue_capacity` bounds pending jobs.
   pub fn new(connector: SharedConnector, sink: InboundSink, queue_capacity: Option<usize>) -> Self {
      let snapshot = Snapshot::default();
      let worker = SlotWorker::new(connector.clone(), sink.clone(), snapshot.clone());
      Self {
         queue: SerialQueue::start(worker, queue_capacity),
         connector,
         sink,
         snapshot,
      }
   }

   /// Tears down whatever the slot holds, then queues an open of `target`.
   ///
   /// Returns once the open is queued; the completion resolves when the open
   /// has succeeded or failed.
   pub async fn connect(&self, slot: SlotId, target: Target) -> Result<Completion> {
      self.queue.run(Job::Close { slot }).await?;
      self.queue.submit(Job::Open { slot, target })
   }

   /// Closes the slot's link if it has one.
   pub async fn disconnect(&self, slot: SlotId) -> Result<()> {
      match self.queue.run(Job::Close { slot }).await {
         // Destroyed managers have nothing left open.
         Err(BridgeError::QueueClosed) => Ok(()),
         other => other,
      }
   }

   /// Stops the work queue. Jobs already queued still run, then every slot
   /// is closed before this returns.
   pub async fn destroy(&self) -> Result<()> {
      if self.queue.stop().await {
         info!("Connection manager destroyed");
      }
      Ok(())
   }

   /// Brings a destroyed manager back with empty slots.
   pub fn reinit(&self) -> bool {
      if self.queue.is_running() {
         return false;
      }
      self.snapshot.write().clear();
      let worker = SlotWorker::new(self.connector.clone(), self.sink.clone(), self.snapshot.clone());
      self.queue.restart(worker)
   }

   /// Queues `data` for the slot.
   pub fn write(&self, slot: SlotId, data: Packet) -> Result<Completion> {
      self.queue.submit(Job::Write { slot, data })
   }

   pub fn status(&self, slot: SlotId) -> SlotStatus {
      self
         .snapshot
         .read()
         .get(&slot)
         .cloned()
         .unwrap_or_else(|| SlotStatus::unconnected(slot))
   }
}
