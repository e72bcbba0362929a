//! Classic Bluetooth transport over an RFCOMM stream socket.

use std::time::Duration;

use bluer::{
   Address,
   rfcomm::{SocketAddr, Stream},
};
use log::debug;
use tokio::time;

use super::Link;
use crate::error::{BridgeError, Result};

pub async fn connect(
   address: Address,
   channel: u8,
   open_timeout: Duration,
   write_timeout: Duration,
) -> Result<Link> {
   let addr = SocketAddr::new(address, channel);
   debug!("Connecting RFCOMM to {address} channel {channel}");

   let stream = time::timeout(open_timeout, Stream::connect(addr))
      .await
      .map_err(|_| BridgeError::RequestTimeout)??;

   let (reader, writer) = tokio::io::split(stream);
   Ok(Link::from_stream(
      address.to_string().into(),
      reader,
      writer,
      write_timeout,
   ))
}
