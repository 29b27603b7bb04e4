//! PCM Recorder
//!
//! Captures the default (or a named) input device into a raw PCM file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringbridge::backend::{list_devices, AudioBackend, CpalBackend, StreamDesc};
use ringbridge::constants::{DEFAULT_CHANNELS, DEFAULT_RING_SECONDS, DEFAULT_SAMPLE_RATE};
use ringbridge::format::{SampleFormat, StreamFormat};
use ringbridge::ring::RingBuffer;
use ringbridge::stream::InputStream;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let out_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "capture.pcm".to_string());
    let seconds: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let device_id = std::env::args().nth(3);

    let backend = CpalBackend::new();
    tracing::info!("Using audio host: {}", backend.name());

    // List available devices
    println!("\n=== Available Audio Devices ===");
    let devices = list_devices(backend.host());
    for device in &devices {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let format = StreamFormat::new(SampleFormat::S16, DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS);
    let capacity = format.ring_capacity(DEFAULT_RING_SECONDS);
    let (producer, mut consumer) = RingBuffer::with_capacity(capacity)?.split();

    let mut desc = StreamDesc::new(format);
    desc.device_id = device_id;

    let mut stream = InputStream::open(&backend, &desc, producer)?;
    stream.start()?;
    tracing::info!("Recording {}s of {} to {}", seconds, format, out_path);

    let file = File::create(&out_path).with_context(|| format!("creating {out_path}"))?;
    let mut out = BufWriter::new(file);

    // drain in ~100ms blocks
    let block = format.bytes_per_frame() * (format.sample_rate as usize / 10);
    let mut buf = vec![0u8; block];
    let deadline = Instant::now() + Duration::from_secs(seconds);

    while Instant::now() < deadline {
        if let Some(fault) = stream.take_fault() {
            bail!("stream fault: {fault}");
        }
        while consumer.fill_count() >= block {
            let n = consumer.pop_slice(&mut buf);
            out.write_all(&buf[..n])?;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let stats = stream.stats();
    drop(stream);

    // the callback thread is joined; drain whatever is left
    loop {
        let n = consumer.pop_slice(&mut buf);
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.flush()?;

    tracing::info!(
        "Captured {} frames ({} silence, {} overflows)",
        stats.frames_captured,
        stats.silence_frames,
        stats.overflows
    );
    println!("Wrote {out_path}. Play it with: ffplay -f s16le -ar 48000 -ac 2 {out_path}");
    Ok(())
}
