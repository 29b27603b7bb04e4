//! Audio backend abstraction
//!
//! A backend owns the device callback thread and hands the realtime
//! bridges raw device memory through grant transactions. The production
//! backend wraps cpal; the mock backend scripts grants for tests.

pub mod cpal;
pub mod device;
pub mod mock;

pub use self::cpal::CpalBackend;
pub use device::{list_devices, DeviceInfo};
pub use mock::MockBackend;

use std::sync::Arc;

use crate::constants::MAX_CHANNELS;
use crate::error::{BackendError, TransactionError};
use crate::format::StreamFormat;

/// One channel of device memory: a base pointer plus the byte stride
/// between consecutive frames of that channel.
#[derive(Clone, Copy, Debug)]
pub struct ChannelArea {
    pub ptr: *mut u8,
    pub step: usize,
}

/// Per-channel areas for one grant. Fixed-size so a grant never
/// allocates on the realtime path.
#[derive(Clone, Copy)]
pub struct ChannelAreas {
    areas: [ChannelArea; MAX_CHANNELS],
    len: usize,
}

impl ChannelAreas {
    /// Areas for a zero-frame grant. No pointers, no channels.
    pub fn empty() -> Self {
        Self {
            areas: [ChannelArea {
                ptr: std::ptr::null_mut(),
                step: 0,
            }; MAX_CHANNELS],
            len: 0,
        }
    }

    /// Describes an interleaved buffer: channel `c` starts `c` samples
    /// into the first frame and every channel strides by a whole frame.
    pub fn interleaved(base: *mut u8, format: &StreamFormat) -> Self {
        let bytes_per_sample = format.bytes_per_sample();
        let step = format.bytes_per_frame();
        let len = (format.channels as usize).min(MAX_CHANNELS);
        let mut areas = [ChannelArea {
            ptr: std::ptr::null_mut(),
            step: 0,
        }; MAX_CHANNELS];
        for (ch, area) in areas.iter_mut().take(len).enumerate() {
            // SAFETY: caller guarantees `base` spans the granted frames;
            // the channel offset stays inside the first frame.
            area.ptr = unsafe { base.add(ch * bytes_per_sample) };
            area.step = step;
        }
        Self { areas, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, channel: usize) -> Option<ChannelArea> {
        self.areas.get(..self.len)?.get(channel).copied()
    }

    pub fn as_slice(&self) -> &[ChannelArea] {
        &self.areas[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [ChannelArea] {
        &mut self.areas[..self.len]
    }
}

impl std::fmt::Debug for ChannelAreas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAreas")
            .field("channels", &self.len)
            .finish()
    }
}

/// What the bridge tells the backend after a callback.
#[must_use = "a Stop result must reach the backend so it stops invoking the stream"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFlow {
    Continue,
    Stop,
}

/// Result of [`CaptureSession::begin_read`]. `frames` may be less than
/// requested; `areas` of `None` with nonzero frames marks a hole the
/// device cannot back with data and the reader must treat as silence.
#[derive(Debug)]
pub struct ReadGrant {
    pub frames: usize,
    pub areas: Option<ChannelAreas>,
}

/// Result of [`PlaybackSession::begin_write`]. `frames` may be less than
/// requested; a zero grant means the device has no room this pass.
#[derive(Debug)]
pub struct WriteGrant {
    pub frames: usize,
    pub areas: ChannelAreas,
}

/// Grant-based access to a capture callback's device memory.
///
/// # Safety
/// An implementation must keep every pointer in a returned grant valid
/// until the matching [`end_read`](Self::end_read), and must not hand the
/// same frames out twice.
pub unsafe trait CaptureSession {
    /// Requests up to `frames` frames of captured data.
    fn begin_read(&mut self, frames: usize) -> Result<ReadGrant, TransactionError>;

    /// Closes the open grant.
    fn end_read(&mut self) -> Result<(), TransactionError>;
}

/// Grant-based access to a playback callback's device memory.
///
/// # Safety
/// An implementation must keep every pointer in a returned grant valid
/// and writable until the matching [`end_write`](Self::end_write), and
/// must not hand the same frames out twice.
pub unsafe trait PlaybackSession {
    /// Requests up to `frames` frames of writable space.
    fn begin_write(&mut self, frames: usize) -> Result<WriteGrant, TransactionError>;

    /// Closes the open grant.
    fn end_write(&mut self) -> Result<(), TransactionError>;
}

/// Reports an asynchronous backend error. A failing device stops
/// invoking its data callbacks, so delivery through the sink must not
/// depend on them.
pub type ErrorSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Realtime entry points of a capture stream, driven by the backend.
pub trait InputHooks: Send {
    /// One capture callback: the backend has between `frame_count_min`
    /// and `frame_count_max` frames ready in `session`.
    fn read(
        &mut self,
        session: &mut dyn CaptureSession,
        frame_count_min: usize,
        frame_count_max: usize,
    ) -> StreamFlow;

    /// The backend dropped capture data before the callback ran.
    fn overflow(&mut self);

    /// Sink the backend reports asynchronous stream errors through,
    /// cloned out once when the stream opens.
    fn error_sink(&self) -> ErrorSink;
}

/// Realtime entry points of a playback stream, driven by the backend.
pub trait OutputHooks: Send {
    /// One playback callback: the backend wants between
    /// `frame_count_min` and `frame_count_max` frames written through
    /// `session`.
    fn write(
        &mut self,
        session: &mut dyn PlaybackSession,
        frame_count_min: usize,
        frame_count_max: usize,
    ) -> StreamFlow;

    /// The backend played a gap because no data arrived in time.
    fn underflow(&mut self);

    /// Sink the backend reports asynchronous stream errors through,
    /// cloned out once when the stream opens.
    fn error_sink(&self) -> ErrorSink;
}

/// Handle to one open backend stream. Dropping the handle stops the
/// stream and joins its thread; after drop no hook invocation is in
/// flight.
pub trait StreamHandle: Send {
    /// Begins callback delivery. Errors are reported synchronously.
    fn start(&mut self) -> Result<(), BackendError>;

    /// Pauses or resumes callback delivery on a started stream.
    fn pause(&mut self, paused: bool) -> Result<(), BackendError>;

    fn is_running(&self) -> bool;
}

/// Requested parameters for opening a stream.
#[derive(Clone, Debug)]
pub struct StreamDesc {
    /// Backend device id, or `None` for the default device.
    pub device_id: Option<String>,
    pub format: StreamFormat,
    /// Requested hardware buffer size; `None` leaves the choice to the
    /// backend.
    pub buffer_frames: Option<u32>,
}

impl StreamDesc {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            device_id: None,
            format,
            buffer_frames: None,
        }
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        if self.format.channels == 0 || self.format.channels as usize > MAX_CHANNELS {
            return Err(BackendError::UnsupportedFormat(format!(
                "channel count {} out of range 1..={}",
                self.format.channels, MAX_CHANNELS
            )));
        }
        if self.format.sample_rate == 0 {
            return Err(BackendError::UnsupportedFormat(
                "sample rate must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Factory for capture and playback streams.
pub trait AudioBackend {
    fn name(&self) -> &str;

    /// Opens a capture stream; callbacks stay idle until
    /// [`StreamHandle::start`].
    fn open_input(
        &self,
        desc: &StreamDesc,
        hooks: Box<dyn InputHooks>,
    ) -> Result<Box<dyn StreamHandle>, BackendError>;

    /// Opens a playback stream; callbacks stay idle until
    /// [`StreamHandle::start`].
    fn open_output(
        &self,
        desc: &StreamDesc,
        hooks: Box<dyn OutputHooks>,
    ) -> Result<Box<dyn StreamHandle>, BackendError>;
}
