//! Bluetooth adapter access.
//!
//! The [`Adapter`] trait covers everything the service needs from the
//! local radio besides opening links: presence and power state, the scan
//! permission check, raw discovery and state observation. [`BluezAdapter`]
//! implements it on top of BlueZ.

use std::sync::Arc;

use async_trait::async_trait;
use bluer::{
   AdapterEvent, AdapterProperty, Address, AddressType, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::{
   StreamExt,
   stream::{self, BoxStream, SelectAll},
};
use log::{debug, info, warn};
use smol_str::SmolStr;

use crate::{
   config::{Config, ScanTransport},
   error::{BridgeError, Result},
   event::{
      DEVICE_TYPE_CLASSIC, DEVICE_TYPE_DUAL, DEVICE_TYPE_LE, DEVICE_TYPE_UNKNOWN, DiscoveredDevice,
      StateEvent,
   },
};

/// Adapter power state codes, as reported by the platform.
pub const STATE_OFF: i32 = 10;
pub const STATE_ON: i32 = 12;

const fn power_code(powered: bool) -> i32 {
   if powered { STATE_ON } else { STATE_OFF }
}

#[async_trait]
pub trait Adapter: Send + Sync {
   /// Whether a radio is present at all.
   fn is_available(&self) -> bool;

   /// Current power state code.
   async fn state(&self) -> Result<i32>;

   async fn is_on(&self) -> Result<bool>;

   /// Fails with `PermissionDenied` when scanning is not allowed.
   async fn check_scan_permission(&self) -> Result<()>;

   /// Starts discovery; dropping the stream stops it.
   async fn discover(&self) -> Result<BoxStream<'static, DiscoveredDevice>>;

   /// Adapter power changes and ACL link events, in arrival order.
   async fn state_events(&self) -> Result<BoxStream<'static, StateEvent>>;
}

pub type SharedAdapter = Arc<dyn Adapter>;

/// BlueZ-backed adapter.
pub struct BluezAdapter {
   adapter: Option<bluer::Adapter>,
   scan_transport: ScanTransport,
   known_devices: Arc<Vec<(SmolStr, SmolStr)>>,
}

impl BluezAdapter {
   pub async fn new(session: &Session, config: &Config) -> Self {
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      };
      let adapter = match adapter {
         Ok(adapter) => {
            info!("Using adapter {}", adapter.name());
            Some(adapter)
         },
         Err(e) => {
            warn!("No Bluetooth adapter available: {e}");
            None
         },
      };

      Self {
         adapter,
         scan_transport: config.scan_transport,
         known_devices: Arc::new(
            config
               .known_devices
               .iter()
               .map(|d| (d.address.to_ascii_uppercase().into(), d.name.as_str().into()))
               .collect(),
         ),
      }
   }

   /// Underlying BlueZ adapter, shared with the GATT transport.
   pub fn raw(&self) -> Option<bluer::Adapter> {
      self.adapter.clone()
   }

   fn require(&self) -> Result<&bluer::Adapter> {
      self.adapter.as_ref().ok_or(BridgeError::AdapterUnavailable)
   }
}

#[async_trait]
impl Adapter for BluezAdapter {
   fn is_available(&self) -> bool {
      self.adapter.is_some()
   }

   async fn state(&self) -> Result<i32> {
      let powered = self.require()?.is_powered().await?;
      Ok(power_code(powered))
   }

   async fn is_on(&self) -> Result<bool> {
      Ok(self.require()?.is_powered().await?)
   }

   async fn check_scan_permission(&self) -> Result<()> {
      // BlueZ authorizes discovery per call through polkit; a denial
      // surfaces from `discover` as `PermissionDenied`.
      self.require().map(|_| ())
   }

   async fn discover(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
      let adapter = self.require()?.clone();
      if !adapter.is_powered().await? {
         return Err(BridgeError::AdapterUnavailable);
      }

      let transport = match self.scan_transport {
         ScanTransport::Auto => DiscoveryTransport::Auto,
         ScanTransport::Le => DiscoveryTransport::Le,
         ScanTransport::Bredr => DiscoveryTransport::BrEdr,
      };
      adapter
         .set_discovery_filter(DiscoveryFilter {
            transport,
            duplicate_data: true,
            ..Default::default()
         })
         .await?;

      let events = adapter.discover_devices_with_changes().await?;
      let known = self.known_devices.clone();
      let devices = events.filter_map(move |event| {
         let adapter = adapter.clone();
         let known = known.clone();
         async move {
            match event {
               AdapterEvent::DeviceAdded(addr) => describe_device(&adapter, addr, &known).await,
               _ => None,
            }
         }
      });
      Ok(devices.boxed())
   }

   async fn state_events(&self) -> Result<BoxStream<'static, StateEvent>> {
      let adapter = self.require()?.clone();
      let events = adapter.events().await?.boxed();

      let mut links = SelectAll::new();
      for addr in adapter.device_addresses().await? {
         if let Some(link) = link_events(&adapter, addr).await {
            links.push(link);
         }
      }

      let merged = stream::unfold(
         (adapter, events, links),
         |(adapter, mut events, mut links)| async move {
            loop {
               let next = tokio::select! {
                  Some(event) = links.next(), if !links.is_empty() => Next::Link(event),
                  event = events.next() => Next::Adapter(event),
               };
               match next {
                  Next::Link(event) => return Some((event, (adapter, events, links))),
                  Next::Adapter(None) => return None,
                  Next::Adapter(Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)))) => {
                     return Some((StateEvent::Adapter(power_code(on)), (adapter, events, links)));
                  },
                  Next::Adapter(Some(AdapterEvent::DeviceAdded(addr))) => {
                     if let Some(link) = link_events(&adapter, addr).await {
                        links.push(link);
                     }
                  },
                  Next::Adapter(Some(_)) => {},
               }
            }
         },
      );
      Ok(merged.boxed())
   }
}

enum Next {
   Link(StateEvent),
   Adapter(Option<AdapterEvent>),
}

async fn describe_device(
   adapter: &bluer::Adapter,
   addr: Address,
   known: &[(SmolStr, SmolStr)],
) -> Option<DiscoveredDevice> {
   let device = adapter.device(addr).ok()?;
   let address: SmolStr = addr.to_string().into();

   let name = match device.name().await {
      Ok(Some(name)) if !name.is_empty() => SmolStr::from(name),
      _ => known
         .iter()
         .find(|(known_addr, _)| *known_addr == address)
         .map(|(_, name)| name.clone())?,
   };

   let has_class = device.class().await.ok().flatten().is_some();
   let device_type = match device.address_type().await {
      Ok(AddressType::BrEdr) => DEVICE_TYPE_CLASSIC,
      Ok(_) if has_class => DEVICE_TYPE_DUAL,
      Ok(_) => DEVICE_TYPE_LE,
      Err(_) => DEVICE_TYPE_UNKNOWN,
   };

   debug!("Discovered {name} ({address}) type {device_type}");
   Some(DiscoveredDevice {
      address,
      name,
      device_type,
   })
}

async fn link_events(adapter: &bluer::Adapter, addr: Address) -> Option<BoxStream<'static, StateEvent>> {
   let device = adapter.device(addr).ok()?;
   let events = device.events().await.ok()?;
   Some(
      events
         .filter_map(|event| async move {
            match event {
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => {
                  Some(StateEvent::AclConnected)
               },
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                  Some(StateEvent::AclDisconnected)
               },
               _ => None,
            }
         })
         .boxed(),
   )
}

#[cfg(test)]
pub mod fake {
   //! In-memory adapter for tests.

   use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

   use tokio::sync::broadcast;

   use super::*;

   pub struct FakeAdapter {
      pub available: bool,
      pub powered: AtomicBool,
      pub permitted: AtomicBool,
      pub discover_calls: AtomicUsize,
      pub state_subscriptions: AtomicUsize,
      pub scan_tx: broadcast::Sender<DiscoveredDevice>,
      pub state_tx: broadcast::Sender<StateEvent>,
   }

   impl FakeAdapter {
      pub fn new(available: bool, powered: bool) -> Arc<Self> {
         Arc::new(Self {
            available,
            powered: AtomicBool::new(powered),
            permitted: AtomicBool::new(true),
            discover_calls: AtomicUsize::new(0),
            state_subscriptions: AtomicUsize::new(0),
            scan_tx: broadcast::channel(64).0,
            state_tx: broadcast::channel(64).0,
         })
      }

      pub fn push_state(&self, event: StateEvent) {
         let _ = self.state_tx.send(event);
      }

      pub fn push_device(&self, device: DiscoveredDevice) {
         let _ = self.scan_tx.send(device);
      }
   }

   fn from_broadcast<T: Clone + Send + 'static>(
      rx: broadcast::Receiver<T>,
   ) -> BoxStream<'static, T> {
      stream::unfold(rx, |mut rx| async move {
         rx.recv().await.ok().map(|item| (item, rx))
      })
      .boxed()
   }

   #[async_trait]
   impl Adapter for FakeAdapter {
      fn is_available(&self) -> bool {
         self.available
      }

      async fn state(&self) -> Result<i32> {
         Ok(power_code(self.is_on().await?))
      }

      async fn is_on(&self) -> Result<bool> {
         if !self.available {
            return Err(BridgeError::AdapterUnavailable);
         }
         Ok(self.powered.load(Ordering::SeqCst))
      }

      async fn check_scan_permission(&self) -> Result<()> {
         if self.permitted.load(Ordering::SeqCst) {
            Ok(())
         } else {
            Err(BridgeError::PermissionDenied)
         }
      }

      async fn discover(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
         if !self.is_on().await? {
            return Err(BridgeError::AdapterUnavailable);
         }
         self.discover_calls.fetch_add(1, Ordering::SeqCst);
         Ok(from_broadcast(self.scan_tx.subscribe()))
      }

      async fn state_events(&self) -> Result<BoxStream<'static, StateEvent>> {
         self.state_subscriptions.fetch_add(1, Ordering::SeqCst);
         Ok(from_broadcast(self.state_tx.subscribe()))
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::Ordering;

   use super::{fake::FakeAdapter, *};

   #[test]
   fn test_power_codes() {
      assert_eq!(power_code(true), STATE_ON);
      assert_eq!(power_code(false), STATE_OFF);
   }

   #[tokio::test]
   async fn test_fake_discovery_needs_power() {
      let adapter = FakeAdapter::new(true, false);
      assert!(matches!(adapter.discover().await, Err(BridgeError::AdapterUnavailable)));
      assert_eq!(adapter.discover_calls.load(Ordering::SeqCst), 0);
      assert_eq!(adapter.state().await.unwrap(), STATE_OFF);
   }
}
