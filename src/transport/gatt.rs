//! BLE transport over GATT characteristics.
//!
//! Printers that speak BLE expose a writable characteristic for commands
//! and usually a notifying one for status bytes. Both are wrapped as byte
//! streams so the rest of the service treats them like an RFCOMM socket.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{
   Adapter, Address, Device,
   gatt::{CharacteristicReader, remote::Characteristic},
};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::time;
use uuid::Uuid;

use super::{Link, LinkReader, LinkWriter, StreamReader, StreamWriter};
use crate::error::{BridgeError, Result};

/// Poll interval while waiting for service resolution
const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Characteristic selection for BLE links.
#[derive(Debug, Clone, Default)]
pub struct GattOptions {
   pub write_uuid: Option<Uuid>,
   pub notify_uuid: Option<Uuid>,
}

/// Reader used when the device exposes no notifying characteristic.
struct SilentReader;

#[async_trait]
impl LinkReader for SilentReader {
   async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
      futures::future::pending().await
   }
}

/// Side of a BLE link that can be torn down after its sockets close.
#[async_trait]
trait Peer: Send + Sync {
   async fn release(&self) -> Result<()>;
}

#[async_trait]
impl Peer for Device {
   async fn release(&self) -> Result<()> {
      Ok(self.disconnect().await?)
   }
}

/// Writer that drops the LE connection on close when the link opened it.
struct GattWriter<P: Peer> {
   inner: Box<dyn LinkWriter>,
   owned: Option<P>,
}

#[async_trait]
impl<P: Peer> LinkWriter for GattWriter<P> {
   async fn write(&mut self, data: &[u8]) -> Result<()> {
      self.inner.write(data).await
   }

   async fn close(&mut self) -> Result<()> {
      let closed = self.inner.close().await;
      if let Some(peer) = self.owned.take() {
         debug!("Disconnecting LE link");
         peer.release().await?;
      }
      closed
   }
}

pub async fn connect(
   adapter: &Adapter,
   address: Address,
   options: &GattOptions,
   open_timeout: Duration,
   write_timeout: Duration,
) -> Result<Link> {
   let device = adapter.device(address)?;
   let owned = !device.is_connected().await?;

   let opened = open_link(&device, address, options, open_timeout, write_timeout).await;
   match opened {
      Ok((reader, writer)) => {
         info!("GATT link to {address} ready");
         Ok(Link {
            reader,
            writer: Box::new(GattWriter {
               inner: writer,
               owned: owned.then_some(device),
            }),
         })
      },
      Err(e) => {
         if owned {
            if let Err(disconnect_err) = device.disconnect().await {
               warn!("Failed to drop LE link to {address}: {disconnect_err}");
            }
         }
         Err(e)
      },
   }
}

async fn open_link(
   device: &Device,
   address: Address,
   options: &GattOptions,
   open_timeout: Duration,
   write_timeout: Duration,
) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
   time::timeout(open_timeout, async {
      if !device.is_connected().await? {
         debug!("Connecting LE link to {address}");
         device.connect().await?;
      }
      while !device.is_services_resolved().await? {
         time::sleep(RESOLVE_POLL_INTERVAL).await;
      }
      Ok::<_, BridgeError>(())
   })
   .await
   .map_err(|_| BridgeError::RequestTimeout)??;

   let (write_char, notify_char) = find_characteristics(device, options).await?;
   let write_char = write_char.ok_or_else(|| {
      BridgeError::InvalidArgument(format!("{address} exposes no writable characteristic"))
   })?;

   let name: SmolStr = address.to_string().into();
   let writer = StreamWriter {
      address: name.clone(),
      inner: write_char.write_io().await?,
      write_timeout,
   };
   let reader: Box<dyn LinkReader> = match notify_char {
      Some(ch) => Box::new(StreamReader::<CharacteristicReader> {
         address: name,
         inner: ch.notify_io().await?,
      }),
      None => Box::new(SilentReader),
   };
   Ok((reader, Box::new(writer)))
}

async fn find_characteristics(
   device: &Device,
   options: &GattOptions,
) -> Result<(Option<Characteristic>, Option<Characteristic>)> {
   let mut write = None;
   let mut notify = None;

   for service in device.services().await? {
      for ch in service.characteristics().await? {
         let uuid = ch.uuid().await?;
         let flags = ch.flags().await?;

         let writable = flags.write || flags.write_without_response;
         let wanted_write = match options.write_uuid {
            Some(want) => want == uuid,
            None => writable && write.is_none(),
         };
         let wanted_notify = match options.notify_uuid {
            Some(want) => want == uuid,
            None => (flags.notify || flags.indicate) && notify.is_none(),
         };

         if wanted_notify {
            debug!("Using notify characteristic {uuid}");
            notify = Some(ch.clone());
         }
         if wanted_write {
            debug!("Using write characteristic {uuid}");
            write = Some(ch);
         }
      }
   }

   Ok((write, notify))
}
