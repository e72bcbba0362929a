//! Serial work queue.
//!
//! A single worker task drains a FIFO of jobs and hands each one to a
//! [`JobHandler`], which owns all state the jobs touch. At most one job
//! runs at a time and jobs run in submission order. A failing or panicking
//! job is reported to its submitter and the worker moves on.

use std::{fmt, panic::AssertUnwindSafe};

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinHandle,
};

use crate::error::{BridgeError, Result};

/// Executes jobs on the worker.
#[async_trait]
pub trait JobHandler: Send + 'static {
   type Job: fmt::Debug + Send + 'static;

   async fn handle(&mut self, job: Self::Job) -> Result<()>;

   /// Runs once on the worker after the last queued job, when intake has
   /// already stopped.
   async fn shutdown(&mut self) {}
}

struct Envelope<J> {
   job: J,
   done: oneshot::Sender<Result<()>>,
}

enum Inbox<J> {
   Bounded(mpsc::Sender<Envelope<J>>),
   Unbounded(mpsc::UnboundedSender<Envelope<J>>),
}

enum Outbox<J> {
   Bounded(mpsc::Receiver<Envelope<J>>),
   Unbounded(mpsc::UnboundedReceiver<Envelope<J>>),
}

impl<J> Inbox<J> {
   fn push(&self, envelope: Envelope<J>) -> Result<()> {
      match self {
         Self::Bounded(tx) => tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BridgeError::QueueClosed,
         }),
         Self::Unbounded(tx) => tx.send(envelope).map_err(|_| BridgeError::QueueClosed),
      }
   }
}

impl<J> Outbox<J> {
   async fn recv(&mut self) -> Option<Envelope<J>> {
      match self {
         Self::Bounded(rx) => rx.recv().await,
         Self::Unbounded(rx) => rx.recv().await,
      }
   }
}

fn channel<J>(capacity: Option<usize>) -> (Inbox<J>, Outbox<J>) {
   match capacity {
      Some(cap) => {
         let (tx, rx) = mpsc::channel(cap.max(1));
         (Inbox::Bounded(tx), Outbox::Bounded(rx))
      },
      None => {
         let (tx, rx) = mpsc::unbounded_channel();
         (Inbox::Unbounded(tx), Outbox::Unbounded(rx))
      },
   }
}

/// Outcome of a submitted job.
#[must_use = "dropping a completion discards the job outcome"]
pub struct Completion(oneshot::Receiver<Result<()>>);

impl Completion {
   /// Waits until the job has run.
   pub async fn wait(self) -> Result<()> {
      self.0.await.map_err(|_| BridgeError::QueueClosed)?
   }

   /// Drops the completion, leaving failures to the worker log.
   pub fn detach(self) {}
}

/// Single-worker FIFO job queue.
pub struct SerialQueue<H: JobHandler> {
   capacity: Option<usize>,
   inbox: Mutex<Option<Inbox<H::Job>>>,
   worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: JobHandler> SerialQueue<H> {
   /// Spawns the worker. `capacity` bounds pending jobs; `None` is unbounded.
   pub fn start(handler: H, capacity: Option<usize>) -> Self {
      let queue = Self {
         capacity,
         inbox: Mutex::new(None),
         worker: Mutex::new(None),
      };
      queue.spawn(handler);
      queue
   }

   fn spawn(&self, handler: H) {
      let (inbox, outbox) = channel(self.capacity);
      *self.inbox.lock() = Some(inbox);
      *self.worker.lock() = Some(tokio::spawn(work(handler, outbox)));
   }

   pub fn is_running(&self) -> bool {
      self.inbox.lock().is_some()
   }

   /// Enqueues a job without waiting for it.
   pub fn submit(&self, job: H::Job) -> Result<Completion> {
      let (done, rx) = oneshot::channel();
      let inbox = self.inbox.lock();
      let inbox = inbox.as_ref().ok_or(BridgeError::QueueClosed)?;
      inbox.push(Envelope { job, done })?;
      Ok(Completion(rx))
   }

   /// Enqueues a job and waits for its outcome.
   pub async fn run(&self, job: H::Job) -> Result<()> {
      self.submit(job)?.wait().await
   }

   /// Closes the queue, lets the worker finish what is already queued and
   /// joins it. Returns `false` if the queue was already stopped.
   pub async fn stop(&self) -> bool {
      drop(self.inbox.lock().take());
      let Some(worker) = self.worker.lock().take() else {
         return false;
      };
      if let Err(e) = worker.await {
         error!("Queue worker terminated abnormally: {e}");
      }
      info!("Work queue stopped");
      true
   }

   /// Starts a fresh worker after [`stop`](Self::stop). Returns `false` and
   /// drops `handler` if the queue is still running.
   pub fn restart(&self, handler: H) -> bool {
      if self.is_running() {
         return false;
      }
      self.spawn(handler);
      info!("Work queue restarted");
      true
   }
}

async fn work<H: JobHandler>(mut handler: H, mut outbox: Outbox<H::Job>) {
   while let Some(Envelope { job, done }) = outbox.recv().await {
      debug!("Running {job:?}");
      let result = AssertUnwindSafe(handler.handle(job))
         .catch_unwind()
         .await
         .unwrap_or_else(|_| Err(BridgeError::WorkerPanicked));
      if let Err(e) = &result {
         warn!("Job failed: {e}");
      }
      let _ = done.send(result);
   }
   handler.shutdown().await;
   debug!("Queue worker exiting");
}
