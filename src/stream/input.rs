//! Capture stream
//!
//! [`InputBridge`] runs on the backend's realtime thread and moves device
//! frames into the ring; [`InputStream`] is the application-side handle.
//! The bridge never blocks and never allocates: shortage of ring space is
//! a fault, not a wait.

use std::sync::Arc;

use tracing::info;

use crate::backend::{
    AudioBackend, CaptureSession, ErrorSink, InputHooks, StreamDesc, StreamFlow, StreamHandle,
};
use crate::error::{Result, StreamFault};
use crate::format::StreamFormat;
use crate::notify::InputNotify;
use crate::ring::{RegionWriter, RingProducer};
use crate::stream::context::{StreamContext, StreamStatsSnapshot};

pub(crate) struct CopyOutcome {
    pub(crate) frames: usize,
    pub(crate) silence_frames: usize,
}

/// Moves one callback's worth of captured frames into the ring.
///
/// Walks the device grant loop: each grant is copied frame by frame,
/// channel by channel, into a single uncommitted ring region, and the
/// region is committed once with exactly the bytes written. A grant hole
/// becomes zeros. An error before the commit publishes nothing.
fn pump_capture(
    session: &mut dyn CaptureSession,
    producer: &mut RingProducer,
    frames: usize,
    format: StreamFormat,
) -> std::result::Result<CopyOutcome, StreamFault> {
    let bytes_per_sample = format.bytes_per_sample();
    let bytes_per_frame = format.bytes_per_frame();
    let mut region = producer.write_region(frames * bytes_per_frame);
    // free space only grows under the consumer, so the caller's frame
    // count is still covered here
    debug_assert_eq!(region.len(), frames * bytes_per_frame);
    let (head, tail) = region.slices();
    let mut dst = RegionWriter::new(head, tail);

    let mut frames_left = frames;
    let mut silence_frames = 0usize;
    while frames_left > 0 {
        let grant = session
            .begin_read(frames_left)
            .map_err(|e| StreamFault::Transaction(e.0))?;
        let granted = grant.frames.min(frames_left);
        if granted == 0 {
            break;
        }
        match grant.areas {
            None => {
                dst.put_zeros(granted * bytes_per_frame);
                silence_frames += granted;
            }
            Some(mut areas) => {
                for _ in 0..granted {
                    for area in areas.as_mut_slice() {
                        // SAFETY: the open grant keeps `area.ptr` valid
                        // for `granted` frames at stride `step`.
                        let sample = unsafe {
                            std::slice::from_raw_parts(area.ptr as *const u8, bytes_per_sample)
                        };
                        dst.put(sample);
                        area.ptr = unsafe { area.ptr.add(area.step) };
                    }
                }
            }
        }
        session
            .end_read()
            .map_err(|e| StreamFault::Transaction(e.0))?;
        frames_left -= granted;
    }

    let copied = dst.written();
    debug_assert_eq!(copied % bytes_per_frame, 0);
    region.commit(copied);
    Ok(CopyOutcome {
        frames: copied / bytes_per_frame,
        silence_frames,
    })
}

/// Realtime half of a capture stream. Owned by the backend once the
/// stream is open.
pub(crate) struct InputBridge {
    producer: RingProducer,
    ctx: Arc<StreamContext>,
    format: StreamFormat,
    bytes_per_frame: usize,
    stopped: bool,
}

impl InputBridge {
    pub(crate) fn new(
        producer: RingProducer,
        ctx: Arc<StreamContext>,
        format: StreamFormat,
    ) -> Self {
        Self {
            producer,
            ctx,
            format,
            bytes_per_frame: format.bytes_per_frame(),
            stopped: false,
        }
    }

    fn fail(&mut self, fault: StreamFault) -> StreamFlow {
        self.stopped = true;
        self.ctx.report_fault(fault);
        StreamFlow::Stop
    }
}

impl InputHooks for InputBridge {
    fn read(
        &mut self,
        session: &mut dyn CaptureSession,
        frame_count_min: usize,
        frame_count_max: usize,
    ) -> StreamFlow {
        if self.stopped {
            return StreamFlow::Stop;
        }
        let free_frames = self.producer.free_count() / self.bytes_per_frame;
        if free_frames < frame_count_min {
            // the device would drop data the ring cannot take; losing
            // capture silently is worse than stopping
            return self.fail(StreamFault::Overflow {
                needed: frame_count_min,
                free: free_frames,
            });
        }
        let write_frames = free_frames.min(frame_count_max);

        let outcome = match pump_capture(session, &mut self.producer, write_frames, self.format) {
            Ok(outcome) => outcome,
            Err(fault) => return self.fail(fault),
        };

        let counters = self.ctx.counters();
        counters.add_captured(outcome.frames as u64);
        if outcome.silence_frames > 0 {
            counters.add_silence(outcome.silence_frames as u64);
        }

        let notify = self.ctx.input_notify();
        if let Some(cb) = notify.data_available.as_ref() {
            self.ctx.invoker().invoke(|| cb());
        }
        StreamFlow::Continue
    }

    fn overflow(&mut self) {
        self.ctx.counters().add_overflow();
        let notify = self.ctx.input_notify();
        if let Some(cb) = notify.overflow.as_ref() {
            self.ctx.invoker().invoke(|| cb());
        }
    }

    fn error_sink(&self) -> ErrorSink {
        let ctx = self.ctx.clone();
        Arc::new(move |message: &str| {
            ctx.report_fault(StreamFault::Backend(message.to_string()));
        })
    }
}

/// An open capture stream. Dropping it stops the backend stream and
/// joins the callback thread; buffered data stays readable from the
/// consumer half afterwards.
pub struct InputStream {
    handle: Box<dyn StreamHandle>,
    ctx: Arc<StreamContext>,
    format: StreamFormat,
}

impl InputStream {
    /// Opens a capture stream feeding `producer`. Callbacks stay idle
    /// until [`start`](Self::start).
    pub fn open(
        backend: &dyn AudioBackend,
        desc: &StreamDesc,
        producer: RingProducer,
    ) -> Result<Self> {
        Self::open_with_context(backend, desc, producer, StreamContext::new())
    }

    /// Opens a capture stream on an existing context, for callers that
    /// install callbacks before the stream exists or share a context
    /// between directions.
    pub fn open_with_context(
        backend: &dyn AudioBackend,
        desc: &StreamDesc,
        producer: RingProducer,
        ctx: Arc<StreamContext>,
    ) -> Result<Self> {
        ctx.attach_input_ring(producer.view());
        let bridge = InputBridge::new(producer, ctx.clone(), desc.format);
        let handle = backend.open_input(desc, Box::new(bridge))?;
        info!(backend = backend.name(), format = %desc.format, "input stream open");
        Ok(Self {
            handle,
            ctx,
            format: desc.format,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.handle.start()?;
        Ok(())
    }

    pub fn pause(&mut self, paused: bool) -> Result<()> {
        self.handle.pause(paused)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn context(&self) -> &Arc<StreamContext> {
        &self.ctx
    }

    /// Installs or replaces the notification callbacks.
    pub fn set_callbacks(&self, notify: InputNotify) {
        self.ctx.set_input_callbacks(notify);
    }

    pub fn take_fault(&self) -> Option<StreamFault> {
        self.ctx.take_fault()
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.ctx.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{GrantStep, MockCaptureSession};
    use crate::backend::{ChannelArea, ChannelAreas, MockBackend, ReadGrant};
    use crate::error::TransactionError;
    use crate::format::SampleFormat;
    use crate::ring::{RingBuffer, RingConsumer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn s16_stereo() -> StreamFormat {
        StreamFormat::new(SampleFormat::S16, 48_000, 2)
    }

    fn bridge_with_ring(capacity: usize) -> (InputBridge, RingConsumer, Arc<StreamContext>) {
        let (producer, consumer) = RingBuffer::with_capacity(capacity).unwrap().split();
        let ctx = StreamContext::new();
        let bridge = InputBridge::new(producer, ctx.clone(), s16_stereo());
        (bridge, consumer, ctx)
    }

    fn frame_bytes(frames: usize) -> Vec<u8> {
        (0..frames * 4).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn copies_min_of_free_and_max() {
        // 1024-byte ring = 256 frames; prefill 106 frames leaves 150 free
        let (mut bridge, mut consumer, ctx) = bridge_with_ring(1024);
        bridge.producer.push_slice(&[0xCC; 106 * 4]);

        let data = frame_bytes(200);
        let mut session = MockCaptureSession::new(s16_stereo(), data.clone());
        let flow = bridge.read(&mut session, 100, 200);

        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(session.remaining_frames(), 50);
        assert_eq!(consumer.fill_count(), (106 + 150) * 4);
        assert_eq!(ctx.stats().frames_captured, 150);

        let mut out = vec![0u8; 1024];
        consumer.pop_slice(&mut out);
        assert_eq!(&out[..106 * 4], &[0xCC; 106 * 4][..]);
        assert_eq!(&out[106 * 4..], &data[..150 * 4]);
    }

    #[test]
    fn overflow_stops_the_stream_without_copying() {
        // 64-byte ring = 16 frames; prefill 15 frames leaves 1 free
        let (mut bridge, consumer, ctx) = bridge_with_ring(64);
        bridge.producer.push_slice(&[1u8; 60]);

        let mut session = MockCaptureSession::new(s16_stereo(), frame_bytes(4));
        let flow = bridge.read(&mut session, 2, 4);

        assert_eq!(flow, StreamFlow::Stop);
        assert_eq!(session.begin_calls, 0);
        assert_eq!(consumer.fill_count(), 60);
        assert_eq!(ctx.take_fault(), Some(StreamFault::Overflow { needed: 2, free: 1 }));

        // the bridge stays stopped and reports nothing further
        let flow = bridge.read(&mut session, 1, 1);
        assert_eq!(flow, StreamFlow::Stop);
        assert_eq!(ctx.take_fault(), None);
    }

    #[test]
    fn grant_hole_becomes_silence() {
        let (mut bridge, mut consumer, ctx) = bridge_with_ring(256);
        let data = frame_bytes(5);
        let mut session =
            MockCaptureSession::new(s16_stereo(), data.clone()).with_script([GrantStep::Hole(3)]);

        let flow = bridge.read(&mut session, 8, 8);
        assert_eq!(flow, StreamFlow::Continue);

        let mut out = vec![0u8; 8 * 4];
        assert_eq!(consumer.pop_slice(&mut out), 8 * 4);
        assert_eq!(&out[..12], &[0u8; 12][..]);
        assert_eq!(&out[12..], &data[..]);

        let stats = ctx.stats();
        assert_eq!(stats.frames_captured, 8);
        assert_eq!(stats.silence_frames, 3);
    }

    #[test]
    fn fragmented_grants_cover_the_request() {
        let (mut bridge, consumer, _ctx) = bridge_with_ring(256);
        let mut session = MockCaptureSession::new(s16_stereo(), frame_bytes(10))
            .with_script([GrantStep::Frames(2), GrantStep::Frames(3)]);

        let flow = bridge.read(&mut session, 7, 7);
        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(consumer.fill_count(), 7 * 4);
        assert_eq!(session.begin_calls, 3);
        assert_eq!(session.end_calls, 3);
    }

    #[test]
    fn zero_grant_commits_only_copied_frames() {
        let (mut bridge, consumer, ctx) = bridge_with_ring(256);
        let mut session = MockCaptureSession::new(s16_stereo(), frame_bytes(10))
            .with_script([GrantStep::Frames(2), GrantStep::Frames(0)]);

        let flow = bridge.read(&mut session, 7, 7);
        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(consumer.fill_count(), 2 * 4);
        assert_eq!(ctx.stats().frames_captured, 2);
        // the zero grant opened no transaction
        assert_eq!(session.end_calls, 1);
    }

    #[test]
    fn transaction_failure_publishes_nothing() {
        let (mut bridge, consumer, ctx) = bridge_with_ring(256);
        let mut session = MockCaptureSession::new(s16_stereo(), frame_bytes(10))
            .with_script([GrantStep::Frames(2), GrantStep::Fail]);

        let flow = bridge.read(&mut session, 7, 7);
        assert_eq!(flow, StreamFlow::Stop);
        assert_eq!(consumer.fill_count(), 0);
        assert!(matches!(ctx.take_fault(), Some(StreamFault::Transaction(_))));
    }

    #[test]
    fn planar_areas_interleave_into_the_ring() {
        struct PlanarSession {
            left: Vec<u8>,
            right: Vec<u8>,
            open: bool,
        }

        // SAFETY: the planes outlive the grant and are granted once.
        unsafe impl CaptureSession for PlanarSession {
            fn begin_read(
                &mut self,
                frames: usize,
            ) -> std::result::Result<ReadGrant, TransactionError> {
                let frames = frames.min(self.left.len() / 2);
                let mut areas = ChannelAreas::interleaved(self.left.as_mut_ptr(), &s16_stereo());
                areas.as_mut_slice()[0] = ChannelArea {
                    ptr: self.left.as_mut_ptr(),
                    step: 2,
                };
                areas.as_mut_slice()[1] = ChannelArea {
                    ptr: self.right.as_mut_ptr(),
                    step: 2,
                };
                self.open = true;
                Ok(ReadGrant {
                    frames,
                    areas: Some(areas),
                })
            }

            fn end_read(&mut self) -> std::result::Result<(), TransactionError> {
                assert!(self.open);
                self.open = false;
                Ok(())
            }
        }

        let (mut bridge, mut consumer, _ctx) = bridge_with_ring(64);
        let mut session = PlanarSession {
            left: vec![0x10, 0x11, 0x20, 0x21, 0x30, 0x31],
            right: vec![0x40, 0x41, 0x50, 0x51, 0x60, 0x61],
            open: false,
        };

        let flow = bridge.read(&mut session, 3, 3);
        assert_eq!(flow, StreamFlow::Continue);

        let mut out = [0u8; 12];
        assert_eq!(consumer.pop_slice(&mut out), 12);
        assert_eq!(
            out,
            [0x10, 0x11, 0x40, 0x41, 0x20, 0x21, 0x50, 0x51, 0x30, 0x31, 0x60, 0x61]
        );
    }

    #[test]
    fn data_available_fires_once_per_callback() {
        let (mut bridge, _consumer, ctx) = bridge_with_ring(256);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        ctx.set_input_callbacks(InputNotify {
            data_available: Some(Arc::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        let mut session = MockCaptureSession::new(s16_stereo(), frame_bytes(8));
        assert_eq!(bridge.read(&mut session, 4, 4), StreamFlow::Continue);
        assert_eq!(bridge.read(&mut session, 4, 4), StreamFlow::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backend_overflow_counts_and_notifies() {
        let (mut bridge, _consumer, ctx) = bridge_with_ring(256);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        ctx.set_input_callbacks(InputNotify {
            overflow: Some(Arc::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        bridge.overflow();
        bridge.overflow();
        assert_eq!(ctx.stats().overflows, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // backend overflow is informational, not fatal
        assert_eq!(ctx.take_fault(), None);
    }

    #[test]
    fn backend_errors_surface_without_data_callbacks() {
        let (bridge, _consumer, ctx) = bridge_with_ring(256);
        let sink = bridge.error_sink();
        // a dead device stops calling read; the sink must not care
        drop(bridge);

        sink("device unplugged");
        assert_eq!(
            ctx.take_fault(),
            Some(StreamFault::Backend("device unplugged".into()))
        );
    }

    #[test]
    fn dropping_the_stream_releases_its_ring_half() {
        let backend = MockBackend::new();
        let desc = StreamDesc::new(s16_stereo());
        let (producer, consumer) = RingBuffer::with_capacity(64).unwrap().split();

        let stream = InputStream::open(&backend, &desc, producer).unwrap();
        assert!(!consumer.is_abandoned());
        drop(stream);
        assert!(consumer.is_abandoned());
    }
}
