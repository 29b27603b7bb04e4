//! Sine Playback
//!
//! Renders a stereo sine tone through the default output device.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringbridge::backend::{CpalBackend, StreamDesc};
use ringbridge::constants::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use ringbridge::format::{SampleFormat, StreamFormat};
use ringbridge::notify::OutputNotify;
use ringbridge::ring::RingBuffer;
use ringbridge::stream::OutputStream;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let freq: f32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(440.0);
    let seconds: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let format = StreamFormat::new(SampleFormat::F32, DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS);
    // a couple of seconds of ring is plenty for a generated tone
    let capacity = format.ring_capacity(2);
    let (mut producer, consumer) = RingBuffer::with_capacity(capacity)?.split();

    let backend = CpalBackend::new();
    let desc = StreamDesc::new(format);
    let mut stream = OutputStream::open(&backend, &desc, consumer)?;

    let underruns = Arc::new(AtomicU64::new(0));
    let seen = underruns.clone();
    stream.set_callbacks(OutputNotify {
        underflow: Some(Arc::new(move || {
            seen.fetch_add(1, Ordering::Relaxed);
        })),
        ..Default::default()
    });

    // phase-accumulator tone generator
    let step = TAU * freq / format.sample_rate as f32;
    let mut phase: f32 = 0.0;
    let mut render = move |frames: usize| -> Vec<u8> {
        let mut bytes = Vec::with_capacity(frames * format.bytes_per_frame());
        for _ in 0..frames {
            let sample = 0.2 * phase.sin();
            phase = (phase + step) % TAU;
            for _ in 0..format.channels {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
        }
        bytes
    };

    // prefill ~100ms so the first callback finds data
    let target_frames = format.sample_rate as usize / 10;
    producer.push_slice(&render(target_frames));

    stream.start()?;
    tracing::info!("Playing {}Hz for {}s", freq, seconds);

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        if let Some(fault) = stream.take_fault() {
            bail!("stream fault: {fault}");
        }
        let buffered = producer.fill_count() / format.bytes_per_frame();
        if buffered < target_frames {
            producer.push_slice(&render(target_frames - buffered));
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let stats = stream.stats();
    drop(stream);

    tracing::info!(
        "Rendered {} frames ({} silence, {} underruns)",
        stats.frames_rendered,
        stats.silence_frames,
        underruns.load(Ordering::Relaxed)
    );
    Ok(())
}
