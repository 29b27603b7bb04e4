//! Deterministic in-process backend
//!
//! No device, no thread: capture sessions replay a byte buffer through
//! scripted grants and playback sessions collect what a bridge writes.
//! Used by the crate's own tests and usable by downstream test code.

use std::collections::VecDeque;

use crate::error::{BackendError, TransactionError};
use crate::format::StreamFormat;

use super::{
    AudioBackend, CaptureSession, ChannelAreas, InputHooks, OutputHooks, PlaybackSession,
    ReadGrant, StreamDesc, StreamHandle, WriteGrant,
};

/// One scripted response to a `begin_read`/`begin_write` call.
#[derive(Clone, Copy, Debug)]
pub enum GrantStep {
    /// Grant at most this many frames of real memory.
    Frames(usize),
    /// Grant this many frames with no backing memory (capture only).
    Hole(usize),
    /// Fail the begin call.
    Fail,
}

struct OpenGrant {
    frames: usize,
    hole: bool,
}

/// Capture session replaying an interleaved byte buffer.
pub struct MockCaptureSession {
    format: StreamFormat,
    data: Vec<u8>,
    /// Frames consumed by closed grants.
    cursor: usize,
    script: VecDeque<GrantStep>,
    open: Option<OpenGrant>,
    pub begin_calls: usize,
    pub end_calls: usize,
}

impl MockCaptureSession {
    /// Session over `data`, which must be whole interleaved frames.
    pub fn new(format: StreamFormat, data: Vec<u8>) -> Self {
        assert_eq!(data.len() % format.bytes_per_frame(), 0);
        Self {
            format,
            data,
            cursor: 0,
            script: VecDeque::new(),
            open: None,
            begin_calls: 0,
            end_calls: 0,
        }
    }

    /// Scripts the responses to successive begin calls. Once the script
    /// runs out, every call grants all remaining frames.
    pub fn with_script(mut self, steps: impl IntoIterator<Item = GrantStep>) -> Self {
        self.script = steps.into_iter().collect();
        self
    }

    /// Frames not yet handed out.
    pub fn remaining_frames(&self) -> usize {
        self.data.len() / self.format.bytes_per_frame() - self.cursor
    }

    fn grant_data(&mut self, frames: usize) -> ReadGrant {
        let granted = frames.min(self.remaining_frames());
        if granted == 0 {
            // a zero grant opens no transaction; callers break without
            // an end call
            return ReadGrant {
                frames: 0,
                areas: None,
            };
        }
        let offset = self.cursor * self.format.bytes_per_frame();
        // SAFETY: offset is in bounds and the Vec is neither resized nor
        // dropped while the grant is open.
        let base = unsafe { self.data.as_mut_ptr().add(offset) };
        self.open = Some(OpenGrant {
            frames: granted,
            hole: false,
        });
        ReadGrant {
            frames: granted,
            areas: Some(ChannelAreas::interleaved(base, &self.format)),
        }
    }
}

// SAFETY: grants point into the session-owned Vec, which stays untouched
// until the matching end call, and `cursor` keeps grants disjoint.
unsafe impl CaptureSession for MockCaptureSession {
    fn begin_read(&mut self, frames: usize) -> Result<ReadGrant, TransactionError> {
        self.begin_calls += 1;
        if self.open.is_some() {
            return Err(TransactionError("begin_read while a grant is open".into()));
        }
        match self.script.pop_front() {
            Some(GrantStep::Fail) => Err(TransactionError("scripted begin_read failure".into())),
            Some(GrantStep::Hole(n)) => {
                let granted = n.min(frames);
                if granted > 0 {
                    self.open = Some(OpenGrant {
                        frames: granted,
                        hole: true,
                    });
                }
                Ok(ReadGrant {
                    frames: granted,
                    areas: None,
                })
            }
            Some(GrantStep::Frames(n)) => Ok(self.grant_data(n.min(frames))),
            None => Ok(self.grant_data(frames)),
        }
    }

    fn end_read(&mut self) -> Result<(), TransactionError> {
        self.end_calls += 1;
        let open = self
            .open
            .take()
            .ok_or_else(|| TransactionError("end_read without an open grant".into()))?;
        if !open.hole {
            self.cursor += open.frames;
        }
        Ok(())
    }
}

/// Playback session collecting rendered frames into a byte buffer.
pub struct MockPlaybackSession {
    format: StreamFormat,
    data: Vec<u8>,
    /// Frames finished by closed grants.
    cursor: usize,
    script: VecDeque<GrantStep>,
    open: Option<OpenGrant>,
    pub begin_calls: usize,
    pub end_calls: usize,
}

impl MockPlaybackSession {
    /// Session with room for `frames` frames. The buffer is prefilled
    /// with 0xAA so rendered silence is distinguishable from untouched
    /// memory.
    pub fn new(format: StreamFormat, frames: usize) -> Self {
        Self {
            data: vec![0xAA; frames * format.bytes_per_frame()],
            format,
            cursor: 0,
            script: VecDeque::new(),
            open: None,
            begin_calls: 0,
            end_calls: 0,
        }
    }

    /// Scripts the responses to successive begin calls. Once the script
    /// runs out, every call grants all remaining room.
    pub fn with_script(mut self, steps: impl IntoIterator<Item = GrantStep>) -> Self {
        self.script = steps.into_iter().collect();
        self
    }

    /// Frames of room not yet handed out.
    pub fn remaining_frames(&self) -> usize {
        self.data.len() / self.format.bytes_per_frame() - self.cursor
    }

    /// Everything rendered through closed grants so far.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.cursor * self.format.bytes_per_frame()]
    }

    fn grant_room(&mut self, frames: usize) -> WriteGrant {
        let granted = frames.min(self.remaining_frames());
        if granted == 0 {
            return WriteGrant {
                frames: 0,
                areas: ChannelAreas::empty(),
            };
        }
        let offset = self.cursor * self.format.bytes_per_frame();
        // SAFETY: offset is in bounds and the Vec is neither resized nor
        // dropped while the grant is open.
        let base = unsafe { self.data.as_mut_ptr().add(offset) };
        self.open = Some(OpenGrant {
            frames: granted,
            hole: false,
        });
        WriteGrant {
            frames: granted,
            areas: ChannelAreas::interleaved(base, &self.format),
        }
    }
}

// SAFETY: grants point into the session-owned Vec, which stays untouched
// until the matching end call, and `cursor` keeps grants disjoint.
unsafe impl PlaybackSession for MockPlaybackSession {
    fn begin_write(&mut self, frames: usize) -> Result<WriteGrant, TransactionError> {
        self.begin_calls += 1;
        if self.open.is_some() {
            return Err(TransactionError("begin_write while a grant is open".into()));
        }
        match self.script.pop_front() {
            Some(GrantStep::Fail) => Err(TransactionError("scripted begin_write failure".into())),
            Some(GrantStep::Hole(_)) => {
                Err(TransactionError("holes do not occur on playback".into()))
            }
            Some(GrantStep::Frames(n)) => Ok(self.grant_room(n.min(frames))),
            None => Ok(self.grant_room(frames)),
        }
    }

    fn end_write(&mut self) -> Result<(), TransactionError> {
        self.end_calls += 1;
        let open = self
            .open
            .take()
            .ok_or_else(|| TransactionError("end_write without an open grant".into()))?;
        self.cursor += open.frames;
        Ok(())
    }
}

/// Stream handle with no thread behind it. Start and pause flip a flag;
/// the hooks are parked here so their drop order matches a real handle.
pub struct MockStreamHandle {
    _hooks: Box<dyn Send>,
    started: bool,
    running: bool,
}

impl StreamHandle for MockStreamHandle {
    fn start(&mut self) -> Result<(), BackendError> {
        self.started = true;
        self.running = true;
        Ok(())
    }

    fn pause(&mut self, paused: bool) -> Result<(), BackendError> {
        if !self.started {
            return Err(BackendError::StreamControl(
                "stream has not been started".into(),
            ));
        }
        self.running = !paused;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Backend that opens [`MockStreamHandle`]s. Knows exactly one device,
/// `mock:0`; any other id fails with [`BackendError::DeviceNotFound`].
#[derive(Default)]
pub struct MockBackend;

impl MockBackend {
    pub fn new() -> Self {
        Self
    }

    fn check_device(desc: &StreamDesc) -> Result<(), BackendError> {
        desc.validate()?;
        match desc.device_id.as_deref() {
            None | Some("mock:0") => Ok(()),
            Some(other) => Err(BackendError::DeviceNotFound(other.to_string())),
        }
    }
}

impl AudioBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn open_input(
        &self,
        desc: &StreamDesc,
        hooks: Box<dyn InputHooks>,
    ) -> Result<Box<dyn StreamHandle>, BackendError> {
        Self::check_device(desc)?;
        Ok(Box::new(MockStreamHandle {
            _hooks: Box::new(hooks),
            started: false,
            running: false,
        }))
    }

    fn open_output(
        &self,
        desc: &StreamDesc,
        hooks: Box<dyn OutputHooks>,
    ) -> Result<Box<dyn StreamHandle>, BackendError> {
        Self::check_device(desc)?;
        Ok(Box::new(MockStreamHandle {
            _hooks: Box::new(hooks),
            started: false,
            running: false,
        }))
    }
}
