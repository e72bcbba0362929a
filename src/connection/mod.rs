//! Connection lifecycle and serialized I/O.
//!
//! The [`manager::ConnectionManager`] owns every slot and routes all slot
//! mutations through a [`queue::SerialQueue`], so opens, writes and closes
//! never overlap. Each open slot has one [`reader::ReaderTask`] draining
//! inbound bytes.

pub mod manager;
pub mod payload;
pub mod queue;
pub mod reader;

/// Identifies a connection slot.
pub type SlotId = u8;

/// The slot used by the bridge.
pub const PRIMARY_SLOT: SlotId = 0;
