//! Playback stream
//!
//! [`OutputBridge`] runs on the backend's realtime thread and fills
//! device grants from the ring; [`OutputStream`] is the application-side
//! handle. Starvation is compensated, not fatal: when the ring holds
//! fewer frames than the device's minimum, the gap is padded with
//! silence ahead of whatever real data is buffered, and the underrun
//! shows up in the stream counters.

use std::sync::Arc;

use tracing::info;

use crate::backend::{
    AudioBackend, ErrorSink, OutputHooks, PlaybackSession, StreamDesc, StreamFlow, StreamHandle,
};
use crate::error::{Result, StreamFault};
use crate::format::StreamFormat;
use crate::notify::OutputNotify;
use crate::ring::{RegionReader, RingConsumer};
use crate::stream::context::{StreamContext, StreamStatsSnapshot};

/// Writes `frames` frames of silence to the device, returning the count
/// actually emitted (the device may grant less).
fn render_silence(
    session: &mut dyn PlaybackSession,
    frames: usize,
    format: StreamFormat,
) -> std::result::Result<usize, StreamFault> {
    let bytes_per_sample = format.bytes_per_sample();
    let mut frames_left = frames;
    while frames_left > 0 {
        let grant = session
            .begin_write(frames_left)
            .map_err(|e| StreamFault::Transaction(e.0))?;
        let granted = grant.frames.min(frames_left);
        if granted == 0 {
            break;
        }
        let mut areas = grant.areas;
        for _ in 0..granted {
            for area in areas.as_mut_slice() {
                // SAFETY: the open grant keeps `area.ptr` writable for
                // `granted` frames at stride `step`.
                unsafe {
                    std::ptr::write_bytes(area.ptr, 0, bytes_per_sample);
                    area.ptr = area.ptr.add(area.step);
                }
            }
        }
        session
            .end_write()
            .map_err(|e| StreamFault::Transaction(e.0))?;
        frames_left -= granted;
    }
    Ok(frames - frames_left)
}

/// Moves up to `frames` buffered frames from the ring to the device.
///
/// Ring bytes are released only for frames fully written, at the end of
/// the pass. On a transaction error nothing is released, so buffered
/// audio stays drainable after the stream stops.
fn render_data(
    session: &mut dyn PlaybackSession,
    consumer: &mut RingConsumer,
    frames: usize,
    format: StreamFormat,
) -> std::result::Result<usize, StreamFault> {
    let bytes_per_sample = format.bytes_per_sample();
    let bytes_per_frame = format.bytes_per_frame();
    let region = consumer.read_region(frames * bytes_per_frame);
    // fill only grows under the producer, so the caller's frame count is
    // still covered here
    debug_assert_eq!(region.len(), frames * bytes_per_frame);
    let (head, tail) = region.slices();
    let mut src = RegionReader::new(head, tail);

    let mut frames_left = frames;
    let mut sample = [0u8; 8];
    while frames_left > 0 {
        let grant = session
            .begin_write(frames_left)
            .map_err(|e| StreamFault::Transaction(e.0))?;
        let granted = grant.frames.min(frames_left);
        if granted == 0 {
            break;
        }
        let mut areas = grant.areas;
        for _ in 0..granted {
            for area in areas.as_mut_slice() {
                src.take(&mut sample[..bytes_per_sample]);
                // SAFETY: the open grant keeps `area.ptr` writable for
                // `granted` frames at stride `step`.
                unsafe {
                    std::ptr::copy_nonoverlapping(sample.as_ptr(), area.ptr, bytes_per_sample);
                    area.ptr = area.ptr.add(area.step);
                }
            }
        }
        session
            .end_write()
            .map_err(|e| StreamFault::Transaction(e.0))?;
        frames_left -= granted;
    }

    let consumed = src.consumed();
    debug_assert_eq!(consumed % bytes_per_frame, 0);
    region.release(consumed);
    Ok(consumed / bytes_per_frame)
}

/// Realtime half of a playback stream. Owned by the backend once the
/// stream is open.
pub(crate) struct OutputBridge {
    consumer: RingConsumer,
    ctx: Arc<StreamContext>,
    format: StreamFormat,
    bytes_per_frame: usize,
    stopped: bool,
}

impl OutputBridge {
    pub(crate) fn new(
        consumer: RingConsumer,
        ctx: Arc<StreamContext>,
        format: StreamFormat,
    ) -> Self {
        Self {
            consumer,
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

impl OutputHooks for OutputBridge {
    fn write(
        &mut self,
        session: &mut dyn PlaybackSession,
        frame_count_min: usize,
        frame_count_max: usize,
    ) -> StreamFlow {
        if self.stopped {
            return StreamFlow::Stop;
        }
        let fill_frames = self.consumer.fill_count() / self.bytes_per_frame;

        // pad exactly the shortfall so real data lands as early as the
        // device minimum allows
        let mut silence = 0usize;
        if fill_frames < frame_count_min {
            let shortfall = frame_count_min - fill_frames;
            silence = match render_silence(session, shortfall, self.format) {
                Ok(n) => n,
                Err(fault) => return self.fail(fault),
            };
        }

        let drain = fill_frames.min(frame_count_max);
        let drained = match render_data(session, &mut self.consumer, drain, self.format) {
            Ok(n) => n,
            Err(fault) => return self.fail(fault),
        };

        let total = silence + drained;
        let counters = self.ctx.counters();
        counters.add_rendered(total as u64);
        if silence > 0 {
            counters.add_silence(silence as u64);
        }

        let notify = self.ctx.output_notify();
        if let Some(cb) = notify.data_needed.as_ref() {
            self.ctx.invoker().invoke(|| cb(total));
        }
        StreamFlow::Continue
    }

    fn underflow(&mut self) {
        self.ctx.counters().add_underflow();
        let notify = self.ctx.output_notify();
        if let Some(cb) = notify.underflow.as_ref() {
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

/// An open playback stream. Dropping it stops the backend stream and
/// joins the callback thread; undrained ring data is discarded with the
/// producer half.
pub struct OutputStream {
    handle: Box<dyn StreamHandle>,
    ctx: Arc<StreamContext>,
    format: StreamFormat,
}

impl OutputStream {
    /// Opens a playback stream draining `consumer`. Callbacks stay idle
    /// until [`start`](Self::start).
    pub fn open(
        backend: &dyn AudioBackend,
        desc: &StreamDesc,
        consumer: RingConsumer,
    ) -> Result<Self> {
        Self::open_with_context(backend, desc, consumer, StreamContext::new())
    }

    /// Opens a playback stream on an existing context.
    pub fn open_with_context(
        backend: &dyn AudioBackend,
        desc: &StreamDesc,
        consumer: RingConsumer,
        ctx: Arc<StreamContext>,
    ) -> Result<Self> {
        ctx.attach_output_ring(consumer.view());
        let bridge = OutputBridge::new(consumer, ctx.clone(), desc.format);
        let handle = backend.open_output(desc, Box::new(bridge))?;
        info!(backend = backend.name(), format = %desc.format, "output stream open");
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
    pub fn set_callbacks(&self, notify: OutputNotify) {
        self.ctx.set_output_callbacks(notify);
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
    use crate::backend::mock::{GrantStep, MockPlaybackSession};
    use crate::format::SampleFormat;
    use crate::ring::{RingBuffer, RingProducer};
    use parking_lot::Mutex;

    fn s16_stereo() -> StreamFormat {
        StreamFormat::new(SampleFormat::S16, 48_000, 2)
    }

    fn bridge_with_ring(capacity: usize) -> (OutputBridge, RingProducer, Arc<StreamContext>) {
        let (producer, consumer) = RingBuffer::with_capacity(capacity).unwrap().split();
        let ctx = StreamContext::new();
        let bridge = OutputBridge::new(consumer, ctx.clone(), s16_stereo());
        (bridge, producer, ctx)
    }

    fn frame_bytes(frames: usize) -> Vec<u8> {
        (0..frames * 4).map(|i| (i.wrapping_add(1) % 251) as u8).collect()
    }

    #[test]
    fn starvation_pads_silence_before_real_data() {
        let (mut bridge, mut producer, ctx) = bridge_with_ring(1024);
        let data = frame_bytes(30);
        producer.push_slice(&data);

        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        ctx.set_output_callbacks(OutputNotify {
            data_needed: Some(Arc::new(move |frames| sink.lock().push(frames))),
            ..Default::default()
        });

        let mut session = MockPlaybackSession::new(s16_stereo(), 300);
        let flow = bridge.write(&mut session, 100, 200);

        assert_eq!(flow, StreamFlow::Continue);
        let written = session.written();
        assert_eq!(written.len(), 100 * 4);
        assert_eq!(&written[..70 * 4], &vec![0u8; 70 * 4][..]);
        assert_eq!(&written[70 * 4..], &data[..]);
        assert_eq!(bridge.consumer.fill_count(), 0);

        let stats = ctx.stats();
        assert_eq!(stats.frames_rendered, 100);
        assert_eq!(stats.silence_frames, 70);
        assert_eq!(*emitted.lock(), vec![100]);
    }

    #[test]
    fn drains_min_of_fill_and_max() {
        let (mut bridge, mut producer, ctx) = bridge_with_ring(1024);
        let data = frame_bytes(150);
        producer.push_slice(&data);

        let mut session = MockPlaybackSession::new(s16_stereo(), 300);
        let flow = bridge.write(&mut session, 100, 120);

        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(session.written(), &data[..120 * 4]);
        assert_eq!(bridge.consumer.fill_count(), 30 * 4);
        assert_eq!(ctx.stats().silence_frames, 0);
    }

    #[test]
    fn zero_grant_ends_the_pass_with_data_retained() {
        let (mut bridge, mut producer, ctx) = bridge_with_ring(1024);
        producer.push_slice(&frame_bytes(50));

        let mut session =
            MockPlaybackSession::new(s16_stereo(), 300).with_script([GrantStep::Frames(0)]);
        let flow = bridge.write(&mut session, 0, 50);

        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(session.begin_calls, 1);
        assert_eq!(session.end_calls, 0);
        assert_eq!(bridge.consumer.fill_count(), 50 * 4);
        assert_eq!(ctx.stats().frames_rendered, 0);
    }

    #[test]
    fn fragmented_grants_cover_the_drain() {
        let (mut bridge, mut producer, _ctx) = bridge_with_ring(1024);
        let data = frame_bytes(40);
        producer.push_slice(&data);

        let mut session = MockPlaybackSession::new(s16_stereo(), 40)
            .with_script([GrantStep::Frames(10), GrantStep::Frames(15)]);
        let flow = bridge.write(&mut session, 0, 40);

        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(session.written(), &data[..]);
        assert_eq!(session.begin_calls, 3);
        assert_eq!(bridge.consumer.fill_count(), 0);
    }

    #[test]
    fn transaction_failure_keeps_ring_data() {
        let (mut bridge, mut producer, ctx) = bridge_with_ring(1024);
        producer.push_slice(&frame_bytes(20));

        let mut session = MockPlaybackSession::new(s16_stereo(), 40)
            .with_script([GrantStep::Frames(5), GrantStep::Fail]);
        let flow = bridge.write(&mut session, 0, 20);

        assert_eq!(flow, StreamFlow::Stop);
        assert!(matches!(ctx.take_fault(), Some(StreamFault::Transaction(_))));
        // nothing was released, remaining data is still drainable
        assert_eq!(bridge.consumer.fill_count(), 20 * 4);

        let flow = bridge.write(&mut session, 0, 20);
        assert_eq!(flow, StreamFlow::Stop);
    }

    #[test]
    fn silence_failure_is_fatal() {
        let (mut bridge, _producer, ctx) = bridge_with_ring(1024);
        let mut session =
            MockPlaybackSession::new(s16_stereo(), 40).with_script([GrantStep::Fail]);

        let flow = bridge.write(&mut session, 10, 20);
        assert_eq!(flow, StreamFlow::Stop);
        assert!(matches!(ctx.take_fault(), Some(StreamFault::Transaction(_))));
    }

    #[test]
    fn empty_ring_with_zero_min_emits_nothing() {
        let (mut bridge, _producer, ctx) = bridge_with_ring(1024);
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        ctx.set_output_callbacks(OutputNotify {
            data_needed: Some(Arc::new(move |frames| sink.lock().push(frames))),
            ..Default::default()
        });

        let mut session = MockPlaybackSession::new(s16_stereo(), 40);
        let flow = bridge.write(&mut session, 0, 20);

        assert_eq!(flow, StreamFlow::Continue);
        assert_eq!(session.written().len(), 0);
        assert_eq!(*emitted.lock(), vec![0]);
    }

    #[test]
    fn backend_underflow_counts_and_notifies() {
        let (mut bridge, _producer, ctx) = bridge_with_ring(1024);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        ctx.set_output_callbacks(OutputNotify {
            underflow: Some(Arc::new(move || {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..Default::default()
        });

        bridge.underflow();
        assert_eq!(ctx.stats().underflows, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ctx.take_fault(), None);
    }

    #[test]
    fn backend_errors_surface_without_data_callbacks() {
        let (bridge, _producer, ctx) = bridge_with_ring(1024);
        let sink = bridge.error_sink();
        drop(bridge);

        sink("device unplugged");
        assert_eq!(
            ctx.take_fault(),
            Some(StreamFault::Backend("device unplugged".into()))
        );
    }
}
