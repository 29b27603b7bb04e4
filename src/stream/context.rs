//! Shared per-stream state
//!
//! Each stream owns a [`StreamContext`]: its notification callbacks, the
//! serializing invoker, a bounded fault channel, and counters. A context
//! can also be shared by one capture and one playback stream when the
//! application drives both ends of a duplex pipeline from the same
//! monitoring loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::error;

use crate::constants::FAULT_CHANNEL_CAPACITY;
use crate::error::StreamFault;
use crate::notify::{CallbackInvoker, InputNotify, OutputNotify};
use crate::ring::RingView;

/// Counters bumped on the realtime path. Relaxed ordering: these are
/// running totals, not synchronization.
#[derive(Default)]
pub(crate) struct StreamStats {
    frames_captured: AtomicU64,
    frames_rendered: AtomicU64,
    silence_frames: AtomicU64,
    overflows: AtomicU64,
    underflows: AtomicU64,
}

impl StreamStats {
    pub(crate) fn add_captured(&self, frames: u64) {
        self.frames_captured.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn add_rendered(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn add_silence(&self, frames: u64) {
        self.silence_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn add_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_underflow(&self) {
        self.underflows.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a stream's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStatsSnapshot {
    /// Frames committed to the capture ring, hole silence included
    /// (see `silence_frames`).
    pub frames_captured: u64,
    /// Frames emitted to the device, silence included.
    pub frames_rendered: u64,
    /// Frames of silence inserted for holes or starvation.
    pub silence_frames: u64,
    pub overflows: u64,
    pub underflows: u64,
    /// Notification callbacks that panicked and were contained.
    pub callback_panics: u64,
}

/// State shared between a stream's realtime bridge and the application.
pub struct StreamContext {
    input_notify: ArcSwap<InputNotify>,
    output_notify: ArcSwap<OutputNotify>,
    invoker: CallbackInvoker,
    fault_tx: Sender<StreamFault>,
    fault_rx: Receiver<StreamFault>,
    stats: StreamStats,
    input_ring: Mutex<Option<RingView>>,
    output_ring: Mutex<Option<RingView>>,
}

impl StreamContext {
    pub fn new() -> Arc<Self> {
        let (fault_tx, fault_rx) = bounded(FAULT_CHANNEL_CAPACITY);
        Arc::new(Self {
            input_notify: ArcSwap::from_pointee(InputNotify::default()),
            output_notify: ArcSwap::from_pointee(OutputNotify::default()),
            invoker: CallbackInvoker::new(),
            fault_tx,
            fault_rx,
            stats: StreamStats::default(),
            input_ring: Mutex::new(None),
            output_ring: Mutex::new(None),
        })
    }

    /// Replaces the capture callbacks. Takes effect from the next
    /// realtime callback; an invocation already in flight finishes with
    /// the old set.
    pub fn set_input_callbacks(&self, notify: InputNotify) {
        self.input_notify.store(Arc::new(notify));
    }

    /// Replaces the playback callbacks, same visibility as
    /// [`set_input_callbacks`](Self::set_input_callbacks).
    pub fn set_output_callbacks(&self, notify: OutputNotify) {
        self.output_notify.store(Arc::new(notify));
    }

    pub(crate) fn input_notify(&self) -> Guard<Arc<InputNotify>> {
        self.input_notify.load()
    }

    pub(crate) fn output_notify(&self) -> Guard<Arc<OutputNotify>> {
        self.output_notify.load()
    }

    /// Next undelivered fault, if any. Faults queue in arrival order in
    /// a bounded channel; once it is full further faults are logged and
    /// dropped, so the earliest faults survive.
    pub fn take_fault(&self) -> Option<StreamFault> {
        self.fault_rx.try_recv().ok()
    }

    pub(crate) fn report_fault(&self, fault: StreamFault) {
        error!(%fault, "stream fault");
        let _ = self.fault_tx.try_send(fault);
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            frames_rendered: self.stats.frames_rendered.load(Ordering::Relaxed),
            silence_frames: self.stats.silence_frames.load(Ordering::Relaxed),
            overflows: self.stats.overflows.load(Ordering::Relaxed),
            underflows: self.stats.underflows.load(Ordering::Relaxed),
            callback_panics: self.invoker.panic_count(),
        }
    }

    pub(crate) fn counters(&self) -> &StreamStats {
        &self.stats
    }

    pub(crate) fn invoker(&self) -> &CallbackInvoker {
        &self.invoker
    }

    /// Fill-level view of the capture ring, once an input stream is
    /// attached.
    pub fn input_ring(&self) -> Option<RingView> {
        self.input_ring.lock().clone()
    }

    /// Fill-level view of the playback ring, once an output stream is
    /// attached.
    pub fn output_ring(&self) -> Option<RingView> {
        self.output_ring.lock().clone()
    }

    pub(crate) fn attach_input_ring(&self, view: RingView) {
        *self.input_ring.lock() = Some(view);
    }

    pub(crate) fn attach_output_ring(&self, view: RingView) {
        *self.output_ring.lock() = Some(view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_arrive_in_order() {
        let ctx = StreamContext::new();
        ctx.report_fault(StreamFault::Overflow { needed: 4, free: 1 });
        ctx.report_fault(StreamFault::Backend("device unplugged".into()));

        assert_eq!(
            ctx.take_fault(),
            Some(StreamFault::Overflow { needed: 4, free: 1 })
        );
        assert_eq!(
            ctx.take_fault(),
            Some(StreamFault::Backend("device unplugged".into()))
        );
        assert_eq!(ctx.take_fault(), None);
    }

    #[test]
    fn full_fault_channel_keeps_earliest() {
        let ctx = StreamContext::new();
        for i in 0..FAULT_CHANNEL_CAPACITY + 4 {
            ctx.report_fault(StreamFault::Backend(format!("fault {i}")));
        }
        let mut drained = 0;
        while let Some(fault) = ctx.take_fault() {
            assert_eq!(fault, StreamFault::Backend(format!("fault {drained}")));
            drained += 1;
        }
        assert_eq!(drained, FAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let ctx = StreamContext::new();
        ctx.counters().add_captured(480);
        ctx.counters().add_silence(20);
        ctx.counters().add_overflow();

        let stats = ctx.stats();
        assert_eq!(stats.frames_captured, 480);
        assert_eq!(stats.silence_frames, 20);
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.callback_panics, 0);
    }

    #[test]
    fn callback_swap_is_visible_to_next_load() {
        let ctx = StreamContext::new();
        assert!(ctx.input_notify().data_available.is_none());

        ctx.set_input_callbacks(InputNotify {
            data_available: Some(Arc::new(|| ())),
            ..Default::default()
        });
        assert!(ctx.input_notify().data_available.is_some());
    }
}
