//! SDN Sensor Common - shared types for the packet sensor
//!
//! This crate provides the pieces every other sensor crate agrees on:
//! - Frame decoding (`FrameView`) over raw Ethernet bytes
//! - The normalized per-packet header record (`Metadata`)
//! - Lock-free counters for match and queue statistics
//! - The configuration document
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dns;
pub mod error;
pub mod frame;
pub mod metadata;

pub use config::*;
pub use error::*;
pub use frame::{FrameView, MacAddr, Network};
pub use metadata::{Direction, HeaderExtractor, Metadata, MetadataExtractor};

use std::sync::atomic::{AtomicU64, Ordering};

/// Ingress/egress port identifier
pub type PortId = u16;

/// Per-core queue identifier (one RX and one TX queue per core on each port)
pub type QueueId = u16;

/// High-performance counter for lock-free metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero, returning the last value
    #[inline(always)]
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}
