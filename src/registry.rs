//! Stream handle registry
//!
//! Applications that manage streams by value can hold [`InputStream`]
//! and [`OutputStream`] directly. The registry serves the other style:
//! handing out small copyable ids, e.g. across an FFI or scripting
//! boundary. Ids are generational, so an id kept past its stream's
//! removal is detected as stale instead of touching a recycled slot.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{RegistryError, Result, StreamFault};
use crate::stream::{InputStream, OutputStream, StreamStatsSnapshot};

/// Copyable handle to a registered stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StreamId {
    index: u32,
    generation: u32,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

enum Entry {
    Input(InputStream),
    Output(OutputStream),
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Slab of open streams addressed by [`StreamId`].
#[derive(Default)]
pub struct StreamRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, entry: Entry) -> StreamId {
        let mut slots = self.slots.lock();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(entry);
                return StreamId {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        let index = slots.len() as u32;
        slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        StreamId {
            index,
            generation: 0,
        }
    }

    pub fn insert_input(&self, stream: InputStream) -> StreamId {
        self.insert(Entry::Input(stream))
    }

    pub fn insert_output(&self, stream: OutputStream) -> StreamId {
        self.insert(Entry::Output(stream))
    }

    fn with_entry<R>(&self, id: StreamId, f: impl FnOnce(&mut Entry) -> Result<R>) -> Result<R> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(RegistryError::Stale(id))?;
        let entry = slot.entry.as_mut().ok_or(RegistryError::Stale(id))?;
        f(entry)
    }

    /// Runs `f` on the input stream behind `id`. The registry lock is
    /// held for the duration, so keep `f` short.
    pub fn with_input<R>(&self, id: StreamId, f: impl FnOnce(&mut InputStream) -> R) -> Result<R> {
        self.with_entry(id, |entry| match entry {
            Entry::Input(stream) => Ok(f(stream)),
            Entry::Output(_) => Err(RegistryError::NotInput(id).into()),
        })
    }

    /// Runs `f` on the output stream behind `id`, as
    /// [`with_input`](Self::with_input).
    pub fn with_output<R>(
        &self,
        id: StreamId,
        f: impl FnOnce(&mut OutputStream) -> R,
    ) -> Result<R> {
        self.with_entry(id, |entry| match entry {
            Entry::Output(stream) => Ok(f(stream)),
            Entry::Input(_) => Err(RegistryError::NotOutput(id).into()),
        })
    }

    pub fn start(&self, id: StreamId) -> Result<()> {
        self.with_entry(id, |entry| match entry {
            Entry::Input(stream) => stream.start(),
            Entry::Output(stream) => stream.start(),
        })
    }

    pub fn pause(&self, id: StreamId, paused: bool) -> Result<()> {
        self.with_entry(id, |entry| match entry {
            Entry::Input(stream) => stream.pause(paused),
            Entry::Output(stream) => stream.pause(paused),
        })
    }

    pub fn take_fault(&self, id: StreamId) -> Result<Option<StreamFault>> {
        self.with_entry(id, |entry| {
            Ok(match entry {
                Entry::Input(stream) => stream.take_fault(),
                Entry::Output(stream) => stream.take_fault(),
            })
        })
    }

    pub fn stats(&self, id: StreamId) -> Result<StreamStatsSnapshot> {
        self.with_entry(id, |entry| {
            Ok(match entry {
                Entry::Input(stream) => stream.stats(),
                Entry::Output(stream) => stream.stats(),
            })
        })
    }

    /// Closes the stream behind `id` and retires the id. The slot is
    /// recycled under a new generation.
    pub fn remove(&self, id: StreamId) -> Result<()> {
        let entry = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(id.index as usize)
                .filter(|slot| slot.generation == id.generation)
                .ok_or(RegistryError::Stale(id))?;
            let entry = slot.entry.take().ok_or(RegistryError::Stale(id))?;
            slot.generation = slot.generation.wrapping_add(1);
            entry
        };
        // dropping a stream joins its backend thread; never under the lock
        drop(entry);
        Ok(())
    }

    /// Closes every registered stream and retires all ids.
    pub fn clear(&self) {
        let entries: Vec<Entry> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| {
                    let entry = slot.entry.take()?;
                    slot.generation = slot.generation.wrapping_add(1);
                    Some(entry)
                })
                .collect()
        };
        drop(entries);
    }

    pub fn contains(&self, id: StreamId) -> bool {
        let slots = self.slots.lock();
        slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.entry.is_some())
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::backend::StreamDesc;
    use crate::error::Error;
    use crate::format::{SampleFormat, StreamFormat};
    use crate::ring::RingBuffer;

    fn open_input() -> InputStream {
        let backend = MockBackend::new();
        let desc = StreamDesc::new(StreamFormat::new(SampleFormat::S16, 48_000, 2));
        let (producer, _consumer) = RingBuffer::with_capacity(4096).unwrap().split();
        InputStream::open(&backend, &desc, producer).unwrap()
    }

    fn open_output() -> OutputStream {
        let backend = MockBackend::new();
        let desc = StreamDesc::new(StreamFormat::new(SampleFormat::S16, 48_000, 2));
        let (_producer, consumer) = RingBuffer::with_capacity(4096).unwrap().split();
        OutputStream::open(&backend, &desc, consumer).unwrap()
    }

    #[test]
    fn insert_lookup_and_control() {
        let registry = StreamRegistry::new();
        let id = registry.insert_input(open_input());

        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert!(!registry.with_input(id, |s| s.is_running()).unwrap());

        registry.start(id).unwrap();
        assert!(registry.with_input(id, |s| s.is_running()).unwrap());
        registry.pause(id, true).unwrap();
        assert!(!registry.with_input(id, |s| s.is_running()).unwrap());
    }

    #[test]
    fn removed_ids_go_stale() {
        let registry = StreamRegistry::new();
        let id = registry.insert_input(open_input());
        registry.remove(id).unwrap();

        assert!(!registry.contains(id));
        assert!(registry.is_empty());
        match registry.remove(id) {
            Err(Error::Registry(RegistryError::Stale(stale))) => assert_eq!(stale, id),
            other => panic!("expected stale id, got {other:?}"),
        }
        assert!(registry.start(id).is_err());
    }

    #[test]
    fn slots_recycle_under_a_new_generation() {
        let registry = StreamRegistry::new();
        let first = registry.insert_input(open_input());
        registry.remove(first).unwrap();
        let second = registry.insert_output(open_output());

        assert_eq!(first.to_string(), "0v0");
        assert_eq!(second.to_string(), "0v1");
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let registry = StreamRegistry::new();
        let id = registry.insert_input(open_input());

        match registry.with_output(id, |_| ()) {
            Err(Error::Registry(RegistryError::NotOutput(bad))) => assert_eq!(bad, id),
            other => panic!("expected kind mismatch, got {other:?}"),
        }
        assert!(registry.with_input(id, |_| ()).is_ok());
    }

    #[test]
    fn faults_reach_the_registry_surface() {
        let registry = StreamRegistry::new();
        let stream = open_input();
        stream
            .context()
            .report_fault(StreamFault::Backend("gone".into()));
        let id = registry.insert_input(stream);

        assert_eq!(
            registry.take_fault(id).unwrap(),
            Some(StreamFault::Backend("gone".into()))
        );
        assert_eq!(registry.take_fault(id).unwrap(), None);
    }

    #[test]
    fn clear_retires_everything() {
        let registry = StreamRegistry::new();
        let a = registry.insert_input(open_input());
        let b = registry.insert_output(open_output());
        registry.clear();

        assert!(registry.is_empty());
        assert!(!registry.contains(a));
        assert!(!registry.contains(b));
    }
}
