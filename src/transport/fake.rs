//! In-memory connector for tests.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time};

use super::{Connector, Link, LinkReader, LinkWriter, Target};
use crate::{
   adapter::fake::FakeAdapter,
   error::{BridgeError, Result},
   event::StateEvent,
};

#[derive(Default)]
pub struct LinkStats {
   pub opens: AtomicUsize,
   pub closes: AtomicUsize,
   pub live: AtomicUsize,
   pub peak: AtomicUsize,
}

pub struct FakeConnector {
   pub stats: Arc<LinkStats>,
   pub fail_open: AtomicBool,
   pub open_delay: Mutex<Duration>,
   pub written: Arc<Mutex<Vec<Vec<u8>>>>,
   pub inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
   pub targets: Mutex<Vec<Target>>,
   adapter: Option<Arc<FakeAdapter>>,
}

impl FakeConnector {
   pub fn new(adapter: Option<Arc<FakeAdapter>>) -> Arc<Self> {
      Arc::new(Self {
         stats: Arc::default(),
         fail_open: AtomicBool::new(false),
         open_delay: Mutex::new(Duration::ZERO),
         written: Arc::default(),
         inbound: Mutex::new(None),
         targets: Mutex::new(Vec::new()),
         adapter,
      })
   }

   pub fn opens(&self) -> usize {
      self.stats.opens.load(Ordering::SeqCst)
   }

   pub fn closes(&self) -> usize {
      self.stats.closes.load(Ordering::SeqCst)
   }

   pub fn live(&self) -> usize {
      self.stats.live.load(Ordering::SeqCst)
   }

   pub fn peak(&self) -> usize {
      self.stats.peak.load(Ordering::SeqCst)
   }

   /// Drops the peer side of the last opened link.
   pub fn hang_up(&self) {
      self.inbound.lock().take();
   }
}

struct FakeReader(mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl LinkReader for FakeReader {
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

struct FakeWriter {
   stats: Arc<LinkStats>,
   written: Arc<Mutex<Vec<Vec<u8>>>>,
   adapter: Option<Arc<FakeAdapter>>,
   closed: bool,
}

#[async_trait]
impl LinkWriter for FakeWriter {
   async fn write(&mut self, data: &[u8]) -> Result<()> {
      if self.closed {
         return Err(BridgeError::Io(std::io::ErrorKind::BrokenPipe.into()));
      }
      self.written.lock().push(data.to_vec());
      Ok(())
   }

   async fn close(&mut self) -> Result<()> {
      assert!(!self.closed, "link closed twice");
      self.closed = true;
      self.stats.closes.fetch_add(1, Ordering::SeqCst);
      self.stats.live.fetch_sub(1, Ordering::SeqCst);
      if let Some(adapter) = &self.adapter {
         adapter.push_state(StateEvent::AclDisconnected);
      }
      Ok(())
   }
}

#[async_trait]
impl Connector for FakeConnector {
   async fn open(&self, target: &Target) -> Result<Link> {
      self.targets.lock().push(target.clone());
      let delay = *self.open_delay.lock();
      if !delay.is_zero() {
         time::sleep(delay).await;
      }
      if self.fail_open.load(Ordering::SeqCst) {
         return Err(BridgeError::open_failed(
            target.address.clone(),
            BridgeError::RequestTimeout,
         ));
      }

      self.stats.opens.fetch_add(1, Ordering::SeqCst);
      let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
      self.stats.peak.fetch_max(live, Ordering::SeqCst);
      if let Some(adapter) = &self.adapter {
         adapter.push_state(StateEvent::AclConnected);
      }

      let (tx, rx) = mpsc::unbounded_channel();
      *self.inbound.lock() = Some(tx);
      Ok(Link {
         reader: Box::new(FakeReader(rx)),
         writer: Box::new(FakeWriter {
            stats: self.stats.clone(),
            written: self.written.clone(),
            adapter: self.adapter.clone(),
            closed: false,
         }),
      })
   }
}
