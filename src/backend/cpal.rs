//! cpal-backed streams
//!
//! Each stream runs on a dedicated thread that builds the cpal stream,
//! acknowledges play and pause commands over a control channel, and
//! drops the stream on the way out. cpal streams are not `Send`, so the
//! thread owns the stream for its whole life; the handle only talks to
//! the thread. Data callbacks wrap the raw device buffer in a grant
//! session and hand it to the hooks. Stream errors stop the stream and
//! travel the hooks' error sink, not the data path, since a failing
//! device stops invoking data callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::error;

use crate::error::{BackendError, TransactionError};
use crate::format::{SampleFormat, StreamFormat};

use super::device::{find_input_device, find_output_device};
use super::{
    AudioBackend, CaptureSession, ChannelAreas, InputHooks, OutputHooks, PlaybackSession,
    ReadGrant, StreamDesc, StreamFlow, StreamHandle, WriteGrant,
};

fn map_sample_format(format: SampleFormat) -> cpal::SampleFormat {
    match format {
        SampleFormat::S16 => cpal::SampleFormat::I16,
        SampleFormat::S32 => cpal::SampleFormat::I32,
        SampleFormat::F32 => cpal::SampleFormat::F32,
        SampleFormat::F64 => cpal::SampleFormat::F64,
    }
}

fn stream_config(desc: &StreamDesc) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: desc.format.channels,
        sample_rate: cpal::SampleRate(desc.format.sample_rate),
        buffer_size: match desc.buffer_frames {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        },
    }
}

enum Control {
    Play(Sender<Result<(), String>>),
    Pause(Sender<Result<(), String>>),
    Stop,
}

/// Handle to a stream thread. Dropping it tells the thread to stop and
/// joins it, so after drop no hook invocation is in flight.
struct CpalStreamHandle {
    control_tx: Sender<Control>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStreamHandle {
    fn command(
        &self,
        make: impl FnOnce(Sender<Result<(), String>>) -> Control,
    ) -> Result<(), String> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control_tx
            .send(make(ack_tx))
            .map_err(|_| "stream thread is gone".to_string())?;
        ack_rx.recv().map_err(|_| "stream thread is gone".to_string())?
    }
}

impl StreamHandle for CpalStreamHandle {
    fn start(&mut self) -> Result<(), BackendError> {
        self.command(Control::Play).map_err(BackendError::StreamStart)
    }

    fn pause(&mut self, paused: bool) -> Result<(), BackendError> {
        let result = if paused {
            self.command(Control::Pause)
        } else {
            self.command(Control::Play)
        };
        result.map_err(BackendError::StreamControl)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Stop);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Serves play/pause/stop until the handle goes away, then drops the
/// stream. `running` mirrors the playing state for the callbacks.
fn serve_controls(stream: &cpal::Stream, running: &AtomicBool, control_rx: &Receiver<Control>) {
    loop {
        match control_rx.recv() {
            Ok(Control::Play(ack)) => {
                let result = stream.play().map_err(|e| e.to_string());
                if result.is_ok() {
                    running.store(true, Ordering::SeqCst);
                }
                let _ = ack.send(result);
            }
            Ok(Control::Pause(ack)) => {
                let result = stream.pause().map_err(|e| e.to_string());
                if result.is_ok() {
                    running.store(false, Ordering::SeqCst);
                }
                let _ = ack.send(result);
            }
            Ok(Control::Stop) | Err(_) => break,
        }
    }
    running.store(false, Ordering::SeqCst);
}

fn run_input_stream(
    device: cpal::Device,
    config: cpal::StreamConfig,
    format: StreamFormat,
    mut hooks: Box<dyn InputHooks>,
    running: Arc<AtomicBool>,
    ready_tx: Sender<Result<(), BackendError>>,
    control_rx: Receiver<Control>,
) {
    let sink = hooks.error_sink();
    let err_running = running.clone();
    let cb_running = running.clone();
    let bytes_per_frame = format.bytes_per_frame();

    let stream = device.build_input_stream_raw(
        &config,
        map_sample_format(format.sample_format),
        move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
            if !cb_running.load(Ordering::Relaxed) {
                return;
            }
            let frames = data.bytes().len() / bytes_per_frame;
            if frames == 0 {
                return;
            }
            // one fixed buffer per callback: the whole of it is mandatory
            let mut session = CpalCaptureSession::new(data.bytes(), format);
            if hooks.read(&mut session, frames, frames) == StreamFlow::Stop {
                cb_running.store(false, Ordering::SeqCst);
            }
        },
        move |err| {
            error!(error = %err, "input stream error");
            err_running.store(false, Ordering::SeqCst);
            sink(&err.to_string());
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(BackendError::StreamOpen(e.to_string())));
            return;
        }
    };

    serve_controls(&stream, &running, &control_rx);
}

fn run_output_stream(
    device: cpal::Device,
    config: cpal::StreamConfig,
    format: StreamFormat,
    mut hooks: Box<dyn OutputHooks>,
    running: Arc<AtomicBool>,
    ready_tx: Sender<Result<(), BackendError>>,
    control_rx: Receiver<Control>,
) {
    let sink = hooks.error_sink();
    let err_running = running.clone();
    let cb_running = running.clone();
    let bytes_per_frame = format.bytes_per_frame();

    let stream = device.build_output_stream_raw(
        &config,
        map_sample_format(format.sample_format),
        move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
            if !cb_running.load(Ordering::Relaxed) {
                // keep the device quiet while paused or stopped
                data.bytes_mut().fill(0);
                return;
            }
            let frames = data.bytes().len() / bytes_per_frame;
            if frames == 0 {
                return;
            }
            let mut session = CpalPlaybackSession::new(data.bytes_mut(), format);
            if hooks.write(&mut session, frames, frames) == StreamFlow::Stop {
                let done = session.bytes_done();
                data.bytes_mut()[done..].fill(0);
                cb_running.store(false, Ordering::SeqCst);
            }
        },
        move |err| {
            error!(error = %err, "output stream error");
            err_running.store(false, Ordering::SeqCst);
            sink(&err.to_string());
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(BackendError::StreamOpen(e.to_string())));
            return;
        }
    };

    serve_controls(&stream, &running, &control_rx);
}

/// Session over one capture callback's interleaved buffer. Grants are
/// carved off the front; the buffer outlives the callback, so every
/// grant stays valid through its end call.
struct CpalCaptureSession<'a> {
    buf: &'a [u8],
    format: StreamFormat,
    cursor_frames: usize,
    pending_frames: usize,
    open: bool,
}

impl<'a> CpalCaptureSession<'a> {
    fn new(buf: &'a [u8], format: StreamFormat) -> Self {
        Self {
            buf,
            format,
            cursor_frames: 0,
            pending_frames: 0,
            open: false,
        }
    }

    fn remaining_frames(&self) -> usize {
        self.buf.len() / self.format.bytes_per_frame() - self.cursor_frames
    }
}

// SAFETY: grants reference the callback-owned buffer, disjoint by
// `cursor_frames`. Capture areas are only ever read through.
unsafe impl CaptureSession for CpalCaptureSession<'_> {
    fn begin_read(&mut self, frames: usize) -> Result<ReadGrant, TransactionError> {
        if self.open {
            return Err(TransactionError("begin_read while a grant is open".into()));
        }
        let granted = frames.min(self.remaining_frames());
        if granted == 0 {
            return Ok(ReadGrant {
                frames: 0,
                areas: None,
            });
        }
        let offset = self.cursor_frames * self.format.bytes_per_frame();
        let base = self.buf[offset..].as_ptr() as *mut u8;
        self.open = true;
        self.pending_frames = granted;
        Ok(ReadGrant {
            frames: granted,
            areas: Some(ChannelAreas::interleaved(base, &self.format)),
        })
    }

    fn end_read(&mut self) -> Result<(), TransactionError> {
        if !self.open {
            return Err(TransactionError("end_read without an open grant".into()));
        }
        self.open = false;
        self.cursor_frames += self.pending_frames;
        Ok(())
    }
}

/// Session over one playback callback's interleaved buffer.
struct CpalPlaybackSession<'a> {
    buf: &'a mut [u8],
    format: StreamFormat,
    cursor_frames: usize,
    pending_frames: usize,
    open: bool,
}

impl<'a> CpalPlaybackSession<'a> {
    fn new(buf: &'a mut [u8], format: StreamFormat) -> Self {
        Self {
            buf,
            format,
            cursor_frames: 0,
            pending_frames: 0,
            open: false,
        }
    }

    fn remaining_frames(&self) -> usize {
        self.buf.len() / self.format.bytes_per_frame() - self.cursor_frames
    }

    /// Bytes covered by closed grants.
    fn bytes_done(&self) -> usize {
        self.cursor_frames * self.format.bytes_per_frame()
    }
}

// SAFETY: grants reference the callback-owned buffer, disjoint by
// `cursor_frames`.
unsafe impl PlaybackSession for CpalPlaybackSession<'_> {
    fn begin_write(&mut self, frames: usize) -> Result<WriteGrant, TransactionError> {
        if self.open {
            return Err(TransactionError("begin_write while a grant is open".into()));
        }
        let granted = frames.min(self.remaining_frames());
        if granted == 0 {
            return Ok(WriteGrant {
                frames: 0,
                areas: ChannelAreas::empty(),
            });
        }
        let offset = self.cursor_frames * self.format.bytes_per_frame();
        // SAFETY: offset is in bounds of the callback buffer.
        let base = unsafe { self.buf.as_mut_ptr().add(offset) };
        self.open = true;
        self.pending_frames = granted;
        Ok(WriteGrant {
            frames: granted,
            areas: ChannelAreas::interleaved(base, &self.format),
        })
    }

    fn end_write(&mut self) -> Result<(), TransactionError> {
        if !self.open {
            return Err(TransactionError("end_write without an open grant".into()));
        }
        self.open = false;
        self.cursor_frames += self.pending_frames;
        Ok(())
    }
}

/// Backend over the platform's default cpal host.
pub struct CpalBackend {
    host: cpal::Host,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    pub fn host(&self) -> &cpal::Host {
        &self.host
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        self.host.id().name()
    }

    fn open_input(
        &self,
        desc: &StreamDesc,
        hooks: Box<dyn InputHooks>,
    ) -> Result<Box<dyn StreamHandle>, BackendError> {
        desc.validate()?;
        let device = find_input_device(&self.host, desc.device_id.as_deref())?;
        let config = stream_config(desc);
        let format = desc.format;

        let running = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = bounded(4);
        let (ready_tx, ready_rx) = bounded(1);

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name("audio-input".into())
            .spawn(move || {
                run_input_stream(
                    device,
                    config,
                    format,
                    hooks,
                    thread_running,
                    ready_tx,
                    control_rx,
                )
            })
            .map_err(|e| BackendError::StreamOpen(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStreamHandle {
                control_tx,
                running,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(BackendError::StreamOpen(
                    "stream thread exited before it was ready".into(),
                ))
            }
        }
    }

    fn open_output(
        &self,
        desc: &StreamDesc,
        hooks: Box<dyn OutputHooks>,
    ) -> Result<Box<dyn StreamHandle>, BackendError> {
        desc.validate()?;
        let device = find_output_device(&self.host, desc.device_id.as_deref())?;
        let config = stream_config(desc);
        let format = desc.format;

        let running = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = bounded(4);
        let (ready_tx, ready_rx) = bounded(1);

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                run_output_stream(
                    device,
                    config,
                    format,
                    hooks,
                    thread_running,
                    ready_tx,
                    control_rx,
                )
            })
            .map_err(|e| BackendError::StreamOpen(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStreamHandle {
                control_tx,
                running,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(BackendError::StreamOpen(
                    "stream thread exited before it was ready".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_formats_map_to_cpal() {
        assert_eq!(map_sample_format(SampleFormat::S16), cpal::SampleFormat::I16);
        assert_eq!(map_sample_format(SampleFormat::S32), cpal::SampleFormat::I32);
        assert_eq!(map_sample_format(SampleFormat::F32), cpal::SampleFormat::F32);
        assert_eq!(map_sample_format(SampleFormat::F64), cpal::SampleFormat::F64);
    }

    #[test]
    fn buffer_request_maps_to_fixed_size() {
        let mut desc = StreamDesc::new(StreamFormat::new(SampleFormat::F32, 48_000, 2));
        desc.buffer_frames = Some(256);
        match stream_config(&desc).buffer_size {
            cpal::BufferSize::Fixed(frames) => assert_eq!(frames, 256),
            other => panic!("expected a fixed buffer size, got {other:?}"),
        }
        desc.buffer_frames = None;
        assert!(matches!(
            stream_config(&desc).buffer_size,
            cpal::BufferSize::Default
        ));
    }

    #[test]
    fn capture_session_carves_grants_off_the_front() {
        let format = StreamFormat::new(SampleFormat::S16, 48_000, 2);
        let buf: Vec<u8> = (0..40).collect(); // 10 frames
        let mut session = CpalCaptureSession::new(&buf, format);

        let grant = session.begin_read(4).unwrap();
        assert_eq!(grant.frames, 4);
        let areas = grant.areas.unwrap();
        assert_eq!(areas.get(0).unwrap().ptr, buf.as_ptr() as *mut u8);
        session.end_read().unwrap();

        let grant = session.begin_read(100).unwrap();
        assert_eq!(grant.frames, 6);
        let areas = grant.areas.unwrap();
        // second grant starts after the first 4 frames
        assert_eq!(areas.get(0).unwrap().ptr, buf[16..].as_ptr() as *mut u8);
        session.end_read().unwrap();

        let grant = session.begin_read(1).unwrap();
        assert_eq!(grant.frames, 0);
        assert!(grant.areas.is_none());
    }

    #[test]
    fn playback_session_tracks_completed_bytes() {
        let format = StreamFormat::new(SampleFormat::S16, 48_000, 2);
        let mut buf = vec![0u8; 40];
        let mut session = CpalPlaybackSession::new(&mut buf, format);

        let grant = session.begin_write(3).unwrap();
        assert_eq!(grant.frames, 3);
        assert_eq!(session.bytes_done(), 0);
        session.end_write().unwrap();
        assert_eq!(session.bytes_done(), 12);
        assert_eq!(session.remaining_frames(), 7);
    }

    // exercised only where audio hardware exists; asserts nothing about
    // the outcome beyond not panicking
    #[test]
    fn open_input_on_default_device_when_present() {
        struct NoopHooks;
        impl InputHooks for NoopHooks {
            fn read(
                &mut self,
                _session: &mut dyn CaptureSession,
                _min: usize,
                _max: usize,
            ) -> StreamFlow {
                StreamFlow::Continue
            }
            fn overflow(&mut self) {}
            fn error_sink(&self) -> crate::backend::ErrorSink {
                Arc::new(|_| ())
            }
        }

        let backend = CpalBackend::new();
        let devices = super::super::device::list_devices(backend.host());
        if !devices.iter().any(|d| d.is_input) {
            return;
        }
        let desc = StreamDesc::new(StreamFormat::new(SampleFormat::F32, 48_000, 2));
        let _ = backend.open_input(&desc, Box::new(NoopHooks));
    }
}
