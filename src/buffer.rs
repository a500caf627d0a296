//! Buffer store: PCM containers and their reference-derived usage state.
//!
//! Buffers are owned by a process-wide [`BufferStore`] shared by every
//! context. A buffer's usage state is never stored; it is derived from two
//! reference sets maintained by the source state machine:
//!
//! - a **current** reference marks the buffer as actively consumed (or
//!   already consumed and awaiting dequeue) by a specific source,
//! - a **queue** reference marks it as scheduled for future consumption.
//!
//! `Unused` means both sets are empty, `Pending` means queue references
//! only, anything else is `Processed`. A buffer can never be deleted while
//! either set is non-empty.

use crate::error::{ResonaError, Result};
use crate::format::{self, PcmFormat};
use crate::source::SourceId;
use std::collections::HashMap;
use std::sync::Arc;

/// Stable handle for a buffer in the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

/// Derived usage state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No source references this buffer at all.
    Unused,
    /// Queued on at least one source but not yet (or no longer) current
    /// anywhere.
    Pending,
    /// Current buffer of some source, or consumed and not yet dequeued.
    Processed,
}

/// Which reference set a tag lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind {
    Current,
    Queue,
}

/// Pull callback for streaming buffers.
///
/// Invoked by the mixer to produce canonical mono f32 samples at the
/// buffer's declared sample rate. Returning fewer samples than the slice
/// holds signals end-of-data, after which the source state machine applies
/// its looping/stop rules.
pub type FillCallback = Box<dyn FnMut(SourceId, BufferId, &mut [f32]) -> usize + Send>;

/// Invoked exactly once when a streaming buffer is destroyed, so the decoder
/// behind the callback can release its own resources.
pub type DestroyCallback = Box<dyn FnOnce(BufferId) + Send>;

pub(crate) enum BufferData {
    /// Created but not yet filled.
    Empty,
    /// Immutable-once-filled PCM, canonical mono f32. The allocation may be
    /// shared between deduplicated buffers.
    Static(Arc<[f32]>),
    /// Streaming buffer backed by a pull callback.
    Callback {
        fill: FillCallback,
        destroy: Option<DestroyCallback>,
    },
}

pub struct Buffer {
    /// Declared format of the data this buffer was filled with. `None` until
    /// the first fill or callback attach.
    pub(crate) format: Option<PcmFormat>,
    pub(crate) data: BufferData,
    /// (source, kind) reference tags. Duplicates are legal: a source that
    /// queued the same buffer twice holds two tags.
    refs: Vec<(SourceId, RefKind)>,
}

impl Buffer {
    fn new() -> Self {
        Self {
            format: None,
            data: BufferData::Empty,
            refs: Vec::new(),
        }
    }

    pub fn state(&self) -> BufferState {
        if self.refs.is_empty() {
            BufferState::Unused
        } else if self.refs.iter().all(|(_, kind)| *kind == RefKind::Queue) {
            BufferState::Pending
        } else {
            BufferState::Processed
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.format.map(|f| f.sample_rate)
    }

    /// Number of canonical frames for static data; zero for empty and
    /// streaming buffers.
    pub fn frames(&self) -> usize {
        match &self.data {
            BufferData::Static(samples) => samples.len(),
            _ => 0,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.data, BufferData::Callback { .. })
    }
}

/// Process-wide arena of buffers keyed by stable integer handles.
pub struct BufferStore {
    buffers: HashMap<BufferId, Buffer>,
    next_id: u64,
}

impl BufferStore {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 1,
        }
    }

    /// Creates an empty buffer and returns its handle.
    pub fn create(&mut self) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, Buffer::new());
        log::debug!("created {}", id);
        id
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    /// Mutable access to a buffer's data, used by the mixer to drive pull
    /// callbacks under the store lock.
    pub(crate) fn get_mut_data(&mut self, id: BufferId) -> Option<&mut BufferData> {
        self.buffers.get_mut(&id).map(|buffer| &mut buffer.data)
    }

    fn get_checked_mut(&mut self, id: BufferId) -> Result<&mut Buffer> {
        self.buffers
            .get_mut(&id)
            .ok_or_else(|| ResonaError::invalid_handle(format!("{} does not exist", id)))
    }

    /// Fills a buffer with interleaved PCM data, canonicalizing it to mono
    /// f32 at the declared rate.
    ///
    /// Identical data already held by another static buffer of the same
    /// format is deduplicated: the new buffer shares the existing
    /// allocation.
    ///
    /// # Errors
    ///
    /// Invalid-handle if `id` is unknown, invalid-operation if a pull
    /// callback is attached, invalid-value for malformed data or format.
    pub fn fill(&mut self, id: BufferId, bytes: &[u8], pcm: PcmFormat) -> Result<()> {
        if !self.contains(id) {
            return Err(ResonaError::invalid_handle(format!("{} does not exist", id)));
        }
        if self.get(id).map(Buffer::is_streaming).unwrap_or(false) {
            return Err(ResonaError::invalid_operation(format!(
                "{} has a pull callback attached; static fill is mutually exclusive",
                id
            )));
        }

        let samples = format::decode_mono(bytes, &pcm)?;
        let shared = match self.find_duplicate(id, &pcm, &samples) {
            Some(existing) => {
                log::debug!("{} deduplicated against an identical buffer", id);
                existing
            }
            None => Arc::from(samples.into_boxed_slice()),
        };

        let buffer = self.get_checked_mut(id)?;
        buffer.format = Some(pcm);
        buffer.data = BufferData::Static(shared);
        Ok(())
    }

    /// Attaches a streaming pull callback, mutually exclusive with static
    /// fill. The `destroy` hook runs when the buffer is deleted.
    pub fn set_callback(
        &mut self,
        id: BufferId,
        pcm: PcmFormat,
        fill: FillCallback,
        destroy: Option<DestroyCallback>,
    ) -> Result<()> {
        pcm.validate()?;
        let buffer = self.get_checked_mut(id)?;
        if matches!(buffer.data, BufferData::Static(_)) {
            return Err(ResonaError::invalid_operation(format!(
                "{} already holds static data; callback attach is mutually exclusive",
                id
            )));
        }
        buffer.format = Some(pcm);
        buffer.data = BufferData::Callback { fill, destroy };
        Ok(())
    }

    /// Derived usage state of a buffer.
    pub fn state(&self, id: BufferId) -> Result<BufferState> {
        self.buffers
            .get(&id)
            .map(Buffer::state)
            .ok_or_else(|| ResonaError::invalid_handle(format!("{} does not exist", id)))
    }

    /// Deletes a buffer.
    ///
    /// # Errors
    ///
    /// Invalid-operation if any source still holds a current or queue
    /// reference to it.
    pub fn delete(&mut self, id: BufferId) -> Result<()> {
        let buffer = self.get_checked_mut(id)?;
        if !buffer.refs.is_empty() {
            return Err(ResonaError::invalid_operation(format!(
                "{} is still referenced by {} source(s)",
                id,
                buffer.refs.len()
            )));
        }
        let mut buffer = self.buffers.remove(&id).expect("checked above");
        if let BufferData::Callback { destroy, .. } = &mut buffer.data {
            if let Some(destroy) = destroy.take() {
                destroy(id);
            }
        }
        log::debug!("deleted {}", id);
        Ok(())
    }

    /// Runs outstanding destroy callbacks; used at engine teardown.
    pub(crate) fn destroy_all(&mut self) {
        for (id, buffer) in self.buffers.drain() {
            let mut buffer = buffer;
            if let BufferData::Callback { destroy, .. } = &mut buffer.data {
                if let Some(destroy) = destroy.take() {
                    destroy(id);
                }
            }
        }
    }

    pub(crate) fn add_ref(&mut self, id: BufferId, source: SourceId, kind: RefKind) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.refs.push((source, kind));
        } else {
            log::warn!("add_ref on missing {}", id);
        }
    }

    /// Removes the first reference tag matching (source, kind).
    pub(crate) fn remove_ref(&mut self, id: BufferId, source: SourceId, kind: RefKind) {
        if let Some(buffer) = self.buffers.get_mut(&id) {
            if let Some(pos) = buffer
                .refs
                .iter()
                .position(|&(s, k)| s == source && k == kind)
            {
                buffer.refs.swap_remove(pos);
            } else {
                log::warn!("remove_ref: no ({}, {:?}) tag on {}", source, kind, id);
            }
        }
    }

    pub(crate) fn swap_ref(&mut self, id: BufferId, source: SourceId, from: RefKind, to: RefKind) {
        self.remove_ref(id, source, from);
        self.add_ref(id, source, to);
    }

    /// Number of current references held on `id`, for state inspection.
    pub fn current_ref_count(&self, id: BufferId) -> usize {
        self.buffers
            .get(&id)
            .map(|b| {
                b.refs
                    .iter()
                    .filter(|(_, k)| *k == RefKind::Current)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of queue references held on `id`.
    pub fn queue_ref_count(&self, id: BufferId) -> usize {
        self.buffers
            .get(&id)
            .map(|b| b.refs.iter().filter(|(_, k)| *k == RefKind::Queue).count())
            .unwrap_or(0)
    }

    fn find_duplicate(
        &self,
        fill_target: BufferId,
        pcm: &PcmFormat,
        samples: &[f32],
    ) -> Option<Arc<[f32]>> {
        self.buffers.iter().find_map(|(&id, buffer)| {
            if id == fill_target || buffer.format != Some(*pcm) {
                return None;
            }
            match &buffer.data {
                BufferData::Static(existing) if existing.as_ref() == samples => {
                    Some(existing.clone())
                }
                _ => None,
            }
        })
    }
}

impl Default for BufferStore {
    fn default() -> Self {
        Self::new()
    }
}
