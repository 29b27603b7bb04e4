//! Byte-oriented SPSC ring buffer
//!
//! The handoff channel between a realtime stream callback and application
//! code. Capacity is rounded up to a power of two so the free-running
//! cursors can be masked instead of wrapped. All operations are
//! non-blocking and O(1) in the number of cursor updates; the only
//! synchronization is a pair of acquire/release atomics.
//!
//! Correctness holds under exactly one writer and one reader. The split
//! into [`RingProducer`] and [`RingConsumer`] enforces that discipline by
//! ownership: each half can be moved to its thread but not cloned.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::RingError;

struct RingShared {
    data: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Free-running byte cursors. Capacity is a power of two, so the
    /// difference stays exact across usize wraparound.
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    /// Liveness of each half, cleared by its drop. Monitoring views share
    /// the same allocation, so reference counts cannot tell the halves
    /// apart.
    producer_alive: AtomicBool,
    consumer_alive: AtomicBool,
}

// The producer half writes only [write, write+free) and the consumer half
// reads only [read, read+fill); the cursor protocol keeps the spans
// disjoint.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Borrows a region of the backing store as a mutable byte slice.
///
/// # Safety
/// The caller must have exclusive access to `data[start..start + len]`
/// for the lifetime of the returned slice.
unsafe fn region_mut(data: &[UnsafeCell<u8>], start: usize, len: usize) -> &mut [u8] {
    let base = data.as_ptr() as *mut u8;
    std::slice::from_raw_parts_mut(base.add(start), len)
}

/// Shared-borrow counterpart of [`region_mut`].
///
/// # Safety
/// No writer may touch `data[start..start + len]` for the lifetime of the
/// returned slice.
unsafe fn region_ref(data: &[UnsafeCell<u8>], start: usize, len: usize) -> &[u8] {
    let base = data.as_ptr() as *const u8;
    std::slice::from_raw_parts(base.add(start), len)
}

/// Fixed-capacity byte ring buffer shared by one producer and one consumer.
pub struct RingBuffer {
    shared: Arc<RingShared>,
}

impl RingBuffer {
    /// Allocates a ring of at least `capacity` bytes, rounded up to the
    /// next power of two. Fails on a zero request or when the allocator
    /// cannot satisfy the rounded size; no partial buffer is left behind.
    pub fn with_capacity(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        let capacity = capacity
            .checked_next_power_of_two()
            .ok_or(RingError::Allocation(capacity))?;
        let mut data: Vec<UnsafeCell<u8>> = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| RingError::Allocation(capacity))?;
        data.resize_with(capacity, || UnsafeCell::new(0));
        Ok(Self {
            shared: Arc::new(RingShared {
                data: data.into_boxed_slice(),
                mask: capacity - 1,
                write_pos: AtomicUsize::new(0),
                read_pos: AtomicUsize::new(0),
                producer_alive: AtomicBool::new(true),
                consumer_alive: AtomicBool::new(true),
            }),
        })
    }

    /// Actual capacity in bytes after rounding.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Splits into the write half and the read half.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let consumer = RingConsumer {
            shared: self.shared.clone(),
        };
        (
            RingProducer {
                shared: self.shared,
            },
            consumer,
        )
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Write half of a ring buffer. The sole writer.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes that can be written right now.
    pub fn free_count(&self) -> usize {
        let write = self.shared.write_pos.load(Ordering::Relaxed);
        let read = self.shared.read_pos.load(Ordering::Acquire);
        self.capacity() - write.wrapping_sub(read)
    }

    /// Bytes buffered and not yet read. Advisory on this half: the
    /// consumer may drain concurrently.
    pub fn fill_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    /// True once the consumer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        !self.shared.consumer_alive.load(Ordering::Acquire)
    }

    /// Monitoring view of the shared buffer.
    pub fn view(&self) -> RingView {
        RingView {
            shared: self.shared.clone(),
        }
    }

    /// Borrows up to `max` bytes of free space as two contiguous slices
    /// around the wrap point. Written bytes become visible to the consumer
    /// only through [`WriteRegion::commit`]; dropping the region publishes
    /// nothing.
    pub fn write_region(&mut self, max: usize) -> WriteRegion<'_> {
        let write = self.shared.write_pos.load(Ordering::Relaxed);
        let read = self.shared.read_pos.load(Ordering::Acquire);
        let free = self.capacity() - write.wrapping_sub(read);
        let len = free.min(max);
        let start = write & self.shared.mask;
        let first = len.min(self.capacity() - start);
        // SAFETY: this half is the unique writer and [start, start+len)
        // lies entirely in the free span.
        let (head, tail) = unsafe {
            (
                region_mut(&self.shared.data, start, first),
                region_mut(&self.shared.data, 0, len - first),
            )
        };
        WriteRegion {
            head,
            tail,
            shared: &self.shared,
        }
    }

    /// Copies as much of `data` as fits, returning the number of bytes
    /// written.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let mut region = self.write_region(data.len());
        let n = region.len();
        let (head, tail) = region.slices();
        let split = head.len();
        head.copy_from_slice(&data[..split]);
        tail.copy_from_slice(&data[split..n]);
        region.commit(n);
        n
    }

    /// Appends up to `len` zero bytes, returning the number written.
    pub fn write_zeros(&mut self, len: usize) -> usize {
        let mut region = self.write_region(len);
        let n = region.len();
        let (head, tail) = region.slices();
        head.fill(0);
        tail.fill(0);
        region.commit(n);
        n
    }
}

impl fmt::Debug for RingProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingProducer")
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        // release-ordered after any final commits, so a consumer that
        // observes the abandonment can still drain them
        self.shared.producer_alive.store(false, Ordering::Release);
    }
}

/// Read half of a ring buffer. The sole reader.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes ready to read right now.
    pub fn fill_count(&self) -> usize {
        let read = self.shared.read_pos.load(Ordering::Relaxed);
        let write = self.shared.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Bytes of remaining space. Advisory on this half.
    pub fn free_count(&self) -> usize {
        self.capacity() - self.fill_count()
    }

    /// True once the producer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        !self.shared.producer_alive.load(Ordering::Acquire)
    }

    /// Monitoring view of the shared buffer.
    pub fn view(&self) -> RingView {
        RingView {
            shared: self.shared.clone(),
        }
    }

    /// Borrows up to `max` readable bytes as two contiguous slices around
    /// the wrap point. Space returns to the producer only through
    /// [`ReadRegion::release`]; dropping the region consumes nothing.
    pub fn read_region(&mut self, max: usize) -> ReadRegion<'_> {
        let read = self.shared.read_pos.load(Ordering::Relaxed);
        let write = self.shared.write_pos.load(Ordering::Acquire);
        let fill = write.wrapping_sub(read);
        let len = fill.min(max);
        let start = read & self.shared.mask;
        let first = len.min(self.capacity() - start);
        // SAFETY: this half is the unique reader and [start, start+len)
        // lies entirely in the filled span, which the producer never
        // touches before `release`.
        let (head, tail) = unsafe {
            (
                region_ref(&self.shared.data, start, first),
                region_ref(&self.shared.data, 0, len - first),
            )
        };
        ReadRegion {
            head,
            tail,
            shared: &self.shared,
        }
    }

    /// Copies up to `buf.len()` buffered bytes out, returning the number
    /// read.
    pub fn pop_slice(&mut self, buf: &mut [u8]) -> usize {
        let region = self.read_region(buf.len());
        let n = region.len();
        let (head, tail) = region.slices();
        let split = head.len();
        buf[..split].copy_from_slice(head);
        buf[split..n].copy_from_slice(tail);
        region.release(n);
        n
    }

    /// Drops all buffered data: the read cursor catches up to the write
    /// cursor.
    pub fn clear(&mut self) {
        let write = self.shared.write_pos.load(Ordering::Acquire);
        self.shared.read_pos.store(write, Ordering::Release);
    }
}

impl fmt::Debug for RingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingConsumer")
            .field("capacity", &self.capacity())
            .field("fill", &self.fill_count())
            .finish()
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.shared.consumer_alive.store(false, Ordering::Release);
    }
}

/// Writable span handed out by [`RingProducer::write_region`].
pub struct WriteRegion<'a> {
    head: &'a mut [u8],
    tail: &'a mut [u8],
    shared: &'a RingShared,
}

impl WriteRegion<'_> {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The span as (before-wrap, after-wrap) slices.
    pub fn slices(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut *self.head, &mut *self.tail)
    }

    /// Publishes the first `n` bytes of the span to the consumer.
    pub fn commit(self, n: usize) {
        debug_assert!(n <= self.head.len() + self.tail.len());
        self.shared.write_pos.fetch_add(n, Ordering::Release);
    }
}

/// Readable span handed out by [`RingConsumer::read_region`].
pub struct ReadRegion<'a> {
    head: &'a [u8],
    tail: &'a [u8],
    shared: &'a RingShared,
}

impl ReadRegion<'_> {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The span as (before-wrap, after-wrap) slices.
    pub fn slices(&self) -> (&[u8], &[u8]) {
        (self.head, self.tail)
    }

    /// Returns the first `n` bytes of the span to the producer.
    pub fn release(self, n: usize) {
        debug_assert!(n <= self.head.len() + self.tail.len());
        self.shared.read_pos.fetch_add(n, Ordering::Release);
    }
}

/// Read-only view for monitoring fill levels; never moves a cursor.
#[derive(Clone)]
pub struct RingView {
    shared: Arc<RingShared>,
}

impl RingView {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn fill_count(&self) -> usize {
        let read = self.shared.read_pos.load(Ordering::Acquire);
        let write = self.shared.write_pos.load(Ordering::Acquire);
        // both cursors can move between the two loads; clamp so a racing
        // snapshot never reports more than a full ring
        write.wrapping_sub(read).min(self.capacity())
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.fill_count()
    }
}

impl fmt::Debug for RingView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingView")
            .field("capacity", &self.capacity())
            .field("fill", &self.fill_count())
            .finish()
    }
}

/// Sequential writer over a split region pair. Copies may straddle the
/// wrap boundary mid-sample, which the split handles.
pub(crate) struct RegionWriter<'a> {
    head: &'a mut [u8],
    tail: &'a mut [u8],
    pos: usize,
}

impl<'a> RegionWriter<'a> {
    pub(crate) fn new(head: &'a mut [u8], tail: &'a mut [u8]) -> Self {
        Self { head, tail, pos: 0 }
    }

    pub(crate) fn written(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.head.len() + self.tail.len() - self.pos
    }

    /// Copies `src` at the cursor.
    pub(crate) fn put(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.remaining());
        let split = self.head.len();
        let end = self.pos + src.len();
        if end <= split {
            self.head[self.pos..end].copy_from_slice(src);
        } else if self.pos >= split {
            self.tail[self.pos - split..end - split].copy_from_slice(src);
        } else {
            let first = split - self.pos;
            self.head[self.pos..].copy_from_slice(&src[..first]);
            self.tail[..src.len() - first].copy_from_slice(&src[first..]);
        }
        self.pos = end;
    }

    /// Writes `n` zero bytes at the cursor.
    pub(crate) fn put_zeros(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        let split = self.head.len();
        let end = self.pos + n;
        if self.pos < split {
            self.head[self.pos..end.min(split)].fill(0);
        }
        if end > split {
            self.tail[self.pos.max(split) - split..end - split].fill(0);
        }
        self.pos = end;
    }
}

/// Sequential reader over a split region pair.
pub(crate) struct RegionReader<'a> {
    head: &'a [u8],
    tail: &'a [u8],
    pos: usize,
}

impl<'a> RegionReader<'a> {
    pub(crate) fn new(head: &'a [u8], tail: &'a [u8]) -> Self {
        Self { head, tail, pos: 0 }
    }

    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.head.len() + self.tail.len() - self.pos
    }

    /// Copies `dst.len()` bytes from the cursor into `dst`.
    pub(crate) fn take(&mut self, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.remaining());
        let split = self.head.len();
        let end = self.pos + dst.len();
        if end <= split {
            dst.copy_from_slice(&self.head[self.pos..end]);
        } else if self.pos >= split {
            dst.copy_from_slice(&self.tail[self.pos - split..end - split]);
        } else {
            let first = split - self.pos;
            let rest = dst.len() - first;
            dst[..first].copy_from_slice(&self.head[self.pos..]);
            dst[first..].copy_from_slice(&self.tail[..rest]);
        }
        self.pos = end;
    }
}
