//! I/O utilities for tun-interceptor
//!
//! # Buffer Pool
//!
//! `PacketBufferPool` holds the fixed set of frame buffers shared by the
//! ingestion loop and the per-flow transmit paths.
//!
//! # Bridge
//!
//! `relay` copies bytes between a virtual connection and its dialed
//! upstream stream.

mod bridge;
mod buffer_pool;

pub use bridge::{relay, CopyResult, VirtualStream, RELAY_BUFFER_SIZE};
pub use buffer_pool::{
    BufferPoolStats, BufferPoolStatsSnapshot, PacketBuffer, PacketBufferPool, MAX_FRAME_SIZE,
};
