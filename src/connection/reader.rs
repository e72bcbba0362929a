//! Background reader for an open link.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use tokio::{select, sync::oneshot, task::JoinHandle, time};

use super::SlotId;
use crate::transport::LinkReader;

/// Read buffer size; large enough for a full LE ATT MTU.
const READ_BUFFER_SIZE: usize = 1024;
/// How long a cancelled reader may take to wind down before it is aborted
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Receives inbound bytes for a slot.
pub type InboundSink = Arc<dyn Fn(SlotId, &[u8]) + Send + Sync>;

/// Handle to the task draining a link's inbound bytes.
pub struct ReaderTask {
   slot: SlotId,
   cancel: Option<oneshot::Sender<()>>,
   handle: JoinHandle<()>,
}

impl ReaderTask {
   pub fn spawn(slot: SlotId, reader: Box<dyn LinkReader>, sink: InboundSink) -> Self {
      let (cancel, cancelled) = oneshot::channel();
      Self {
         slot,
         cancel: Some(cancel),
         handle: tokio::spawn(read_loop(slot, reader, sink, cancelled)),
      }
   }

   /// True once the loop has stopped on its own (peer closed or read error).
   pub fn is_finished(&self) -> bool {
      self.handle.is_finished()
   }

   /// Stops the loop and waits for it; no data is delivered afterwards.
   pub async fn cancel(mut self) {
      if let Some(cancel) = self.cancel.take() {
         let _ = cancel.send(());
      }
      if time::timeout(CANCEL_GRACE, &mut self.handle).await.is_err() {
         warn!("Reader for slot {} did not stop in time, aborting", self.slot);
         self.handle.abort();
      }
   }
}

impl Drop for ReaderTask {
   fn drop(&mut self) {
      self.handle.abort();
   }
}

async fn read_loop(
   slot: SlotId,
   mut reader: Box<dyn LinkReader>,
   sink: InboundSink,
   mut cancelled: oneshot::Receiver<()>,
) {
   let mut buf = vec![0u8; READ_BUFFER_SIZE];
   loop {
      select! {
         biased;
         _ = &mut cancelled => {
            debug!("Reader for slot {slot} cancelled");
            return;
         }
         read = reader.read(&mut buf) => match read {
            Ok(0) => {
               warn!("Slot {slot}: connection lost");
               return;
            },
            Ok(n) => sink(slot, &buf[..n]),
            Err(e) => {
               warn!("Slot {slot}: read failed: {e}");
               return;
            },
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use async_trait::async_trait;
   use parking_lot::Mutex;
   use tokio::sync::mpsc;

   use super::*;
   use crate::error::Result;

   struct ChannelReader(mpsc::UnboundedReceiver<Vec<u8>>);

   #[async_trait]
   impl LinkReader for ChannelReader {
      async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
         match self.0.recv().await {
            Some(data) => {
               buf[..data.len()].copy_from_slice(&data);
               Ok(data.len())
            },
            None => Ok(0),
         }
      }
   }

   fn collecting_sink() -> (InboundSink, Arc<Mutex<Vec<u8>>>) {
      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink_seen = seen.clone();
      let sink: InboundSink = Arc::new(move |_slot: SlotId, bytes: &[u8]| {
         sink_seen.lock().extend_from_slice(bytes);
      });
      (sink, seen)
   }

   #[tokio::test]
   async fn test_forwards_until_cancelled() {
      let (tx, rx) = mpsc::unbounded_channel();
      let (sink, seen) = collecting_sink();
      let task = ReaderTask::spawn(0, Box::new(ChannelReader(rx)), sink);

      tx.send(vec![1, 2, 3]).unwrap();
      time::sleep(Duration::from_millis(10)).await;
      assert_eq!(*seen.lock(), vec![1, 2, 3]);

      task.cancel().await;
      let _ = tx.send(vec![4]);
      time::sleep(Duration::from_millis(10)).await;
      assert_eq!(*seen.lock(), vec![1, 2, 3]);
   }

   #[tokio::test]
   async fn test_finishes_when_peer_closes() {
      let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
      let (sink, _seen) = collecting_sink();
      let task = ReaderTask::spawn(0, Box::new(ChannelReader(rx)), sink);

      drop(tx);
      time::sleep(Duration::from_millis(10)).await;
      assert!(task.is_finished());
   }
}
