//! # ringbridge
//!
//! Low-latency bridging between realtime audio callbacks and ordinary
//! application threads.
//!
//! A capture stream copies device frames into a lock-free ring buffer
//! from the audio callback; the application drains the ring at its own
//! pace. A playback stream is the mirror image: the application fills
//! the ring, the callback drains it into the device, padding with
//! silence when data runs short. The callback side never blocks and
//! never allocates; trouble is reported through a bounded fault channel
//! instead of being thrown across the realtime boundary.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐    ┌──────────────────────────────┐
//! │        Capture device        │    │       Playback device        │
//! │      (backend callback)      │    │      (backend callback)      │
//! └──────────────┬───────────────┘    └──────────────▲───────────────┘
//!                │ InputBridge                       │ OutputBridge
//!                │  grant loop, copy,                │  silence pad,
//!                │  commit                           │  drain, release
//!                ▼                                   │
//! ┌──────────────────────────────┐    ┌──────────────┴───────────────┐
//! │       SPSC ring buffer       │    │       SPSC ring buffer       │
//! │   producer ──────► consumer  │    │   producer ──────► consumer  │
//! └──────────────┬───────────────┘    └──────────────▲───────────────┘
//!                │ pop_slice /                       │ push_slice /
//!                │ read_region                       │ write_region
//!                ▼                                   │
//! ┌──────────────────────────────────────────────────┴───────────────┐
//! │                       Application threads                        │
//! │    InputStream / OutputStream handles, StreamContext faults,     │
//! │           stats, notification callbacks, StreamRegistry          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod error;
pub mod format;
pub mod notify;
pub mod registry;
pub mod ring;
pub mod stream;

pub use error::{Error, Result};

/// Crate-wide constants
pub mod constants {
    /// Default sample rate for stream descriptions
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Most channels a single grant can describe
    pub const MAX_CHANNELS: usize = 24;

    /// Default ring buffer capacity in seconds of audio
    pub const DEFAULT_RING_SECONDS: u32 = 30;

    /// Faults queued per stream before older ones win
    pub const FAULT_CHANNEL_CAPACITY: usize = 16;
}
