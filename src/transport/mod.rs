//! Transport handles for printer connections.
//!
//! A [`Link`] is an open byte channel to one device, split into a reader
//! half (drained by the reader task) and a writer half (used by queued
//! jobs). The [`Connector`] trait opens links; [`BluezConnector`] selects
//! the RFCOMM or GATT implementation from the requested [`ConnMethod`].

use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bluer::Address;
use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   time,
};

use crate::{
   config::Config,
   error::{BridgeError, Result},
};

#[cfg(test)]
pub mod fake;
pub mod gatt;
pub mod rfcomm;

pub type Packet = SmallVec<[u8; 64]>;

/// Physical connection kind of a slot.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnMethod {
   #[default]
   ClassicBt,
   Ble,
   Usb,
}

/// Where a slot connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
   pub address: SmolStr,
   pub method: ConnMethod,
}

impl Target {
   pub fn new(address: impl Into<SmolStr>, method: ConnMethod) -> Self {
      Self {
         address: address.into(),
         method,
      }
   }

   /// Parses the target address as a Bluetooth device address.
   pub fn bt_address(&self) -> Result<Address> {
      Address::from_str(&self.address)
         .map_err(|e| BridgeError::InvalidArgument(format!("{}: {e}", self.address)))
   }
}

/// Inbound half of an open link.
#[async_trait]
pub trait LinkReader: Send {
   /// Reads available bytes into `buf`; `Ok(0)` means the peer closed.
   async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Outbound half of an open link.
#[async_trait]
pub trait LinkWriter: Send {
   async fn write(&mut self, data: &[u8]) -> Result<()>;
   async fn close(&mut self) -> Result<()>;
}

/// An open communication channel to one device.
pub struct Link {
   pub reader: Box<dyn LinkReader>,
   pub writer: Box<dyn LinkWriter>,
}

/// Opens links for a target.
#[async_trait]
pub trait Connector: Send + Sync {
   async fn open(&self, target: &Target) -> Result<Link>;
}

pub type SharedConnector = Arc<dyn Connector>;

/// [`Link`] halves backed by any tokio byte stream.
pub struct StreamReader<R> {
   address: SmolStr,
   inner: R,
}

pub struct StreamWriter<W> {
   address: SmolStr,
   inner: W,
   write_timeout: Duration,
}

impl Link {
   pub fn from_stream<R, W>(address: SmolStr, reader: R, writer: W, write_timeout: Duration) -> Self
   where
      R: AsyncRead + Unpin + Send + 'static,
      W: AsyncWrite + Unpin + Send + 'static,
   {
      Self {
         reader: Box::new(StreamReader {
            address: address.clone(),
            inner: reader,
         }),
         writer: Box::new(StreamWriter {
            address,
            inner: writer,
            write_timeout,
         }),
      }
   }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LinkReader for StreamReader<R> {
   async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
      let n = self.inner.read(buf).await?;
      if n > 0 {
         debug!("← {}: {}", self.address, hex::encode(&buf[..n]));
      }
      Ok(n)
   }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LinkWriter for StreamWriter<W> {
   async fn write(&mut self, data: &[u8]) -> Result<()> {
      debug!("→ {}: {}", self.address, hex::encode(data));
      time::timeout(self.write_timeout, async {
         self.inner.write_all(data).await?;
         self.inner.flush().await
      })
      .await
      .map_err(|_| BridgeError::RequestTimeout)??;
      Ok(())
   }

   async fn close(&mut self) -> Result<()> {
      debug!("Closing link to {}", self.address);
      self.inner.shutdown().await?;
      Ok(())
   }
}

/// Opens links through BlueZ.
pub struct BluezConnector {
   adapter: Option<bluer::Adapter>,
   rfcomm_channel: u8,
   open_timeout: Duration,
   write_timeout: Duration,
   gatt: gatt::GattOptions,
}

impl BluezConnector {
   pub fn new(adapter: Option<bluer::Adapter>, config: &Config) -> Self {
      Self {
         adapter,
         rfcomm_channel: config.rfcomm_channel,
         open_timeout: Duration::from_secs(config.open_timeout_secs),
         write_timeout: Duration::from_secs(config.write_timeout_secs),
         gatt: gatt::GattOptions {
            write_uuid: config.ble_write_uuid,
            notify_uuid: config.ble_notify_uuid,
         },
      }
   }
}

#[async_trait]
impl Connector for BluezConnector {
   async fn open(&self, target: &Target) -> Result<Link> {
      let address = target.bt_address();
      let opened = match target.method {
         ConnMethod::ClassicBt => match address {
            Ok(address) => {
               rfcomm::connect(
                  address,
                  self.rfcomm_channel,
                  self.open_timeout,
                  self.write_timeout,
               )
               .await
            },
            Err(e) => Err(e),
         },
         ConnMethod::Ble => match (address, &self.adapter) {
            (Ok(address), Some(adapter)) => {
               gatt::connect(
                  adapter,
                  address,
                  &self.gatt,
                  self.open_timeout,
                  self.write_timeout,
               )
               .await
            },
            (Err(e), _) => Err(e),
            (_, None) => Err(BridgeError::AdapterUnavailable),
         },
         ConnMethod::Usb => Err(BridgeError::UnsupportedMethod(target.method)),
      };
      opened.map_err(|e| BridgeError::open_failed(target.address.clone(), e))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_conn_method_names() {
      assert_eq!(ConnMethod::from_str("classic_bt").unwrap(), ConnMethod::ClassicBt);
      assert_eq!(ConnMethod::from_str("ble").unwrap(), ConnMethod::Ble);
      assert_eq!(ConnMethod::Usb.to_string(), "usb");
      assert_eq!(ConnMethod::default(), ConnMethod::ClassicBt);
   }

   #[test]
   fn test_target_address_parsing() {
      let target = Target::new("AA:BB:CC:DD:EE:FF", ConnMethod::ClassicBt);
      assert!(target.bt_address().is_ok());

      let bad = Target::new("not-an-address", ConnMethod::ClassicBt);
      assert!(matches!(bad.bt_address(), Err(BridgeError::InvalidArgument(_))));
   }

   #[tokio::test]
   async fn test_stream_link_moves_bytes() {
      let (local, remote) = tokio::io::duplex(64);
      let (r, w) = tokio::io::split(local);
      let mut link = Link::from_stream("test".into(), r, w, Duration::from_secs(1));
      let (mut remote_r, mut remote_w) = tokio::io::split(remote);

      link.writer.write(&[0x1b, 0x40]).await.unwrap();
      let mut buf = [0u8; 2];
      remote_r.read_exact(&mut buf).await.unwrap();
      assert_eq!(buf, [0x1b, 0x40]);

      remote_w.write_all(b"ok").await.unwrap();
      let mut buf = [0u8; 8];
      let n = link.reader.read(&mut buf).await.unwrap();
      assert_eq!(&buf[..n], b"ok");
   }

   #[tokio::test]
   async fn test_usb_is_rejected_as_open_failure() {
      let connector = BluezConnector::new(None, &Config::default());
      let target = Target::new("/dev/usb/lp0", ConnMethod::Usb);
      let err = connector.open(&target).await.err().expect("usb should fail");
      match err {
         BridgeError::OpenFailed { source, .. } => {
            assert!(matches!(*source, BridgeError::UnsupportedMethod(ConnMethod::Usb)));
         },
         other => panic!("unexpected error: {other}"),
      }
   }
}
