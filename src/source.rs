//! Source pool: playback entities, their state machine, and buffer queues.
//!
//! A source walks the classic four-state machine (Initial, Playing, Paused,
//! Stopped) over a FIFO of buffer entries. The entry at the read cursor is
//! the "current" buffer; entries behind the cursor have been consumed and
//! stay dequeueable, entries ahead are pending. Every transition keeps the
//! buffer store's reference tags in lockstep so the derived buffer usage
//! state stays truthful.

use crate::buffer::{BufferId, BufferState, BufferStore, RefKind};
use crate::error::{ResonaError, Result};
use crate::math::Vec3;

/// Stable handle for a source within its owning context.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub(crate) u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

/// Play state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Never played (or rewound); no buffer is current.
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Outcome of advancing past the end of the current buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// The next queued buffer became current.
    Promoted,
    /// The queue wrapped because the source is looping.
    Looped,
    /// Queue exhausted; the source stopped.
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueEntry {
    pub bid: BufferId,
    /// Which reference tag this entry currently holds in the buffer store.
    pub kind: RefKind,
}

/// A controllable playback entity with 3-D attributes and a buffer queue.
pub struct Source {
    pub(crate) id: SourceId,
    pub(crate) state: SourceState,
    pub(crate) looping: bool,
    /// Position is interpreted relative to the listener when set.
    pub(crate) relative: bool,

    pub(crate) gain: f32,
    pub(crate) min_gain: f32,
    pub(crate) max_gain: f32,
    pub(crate) pitch: f32,

    pub(crate) position: Vec3,
    pub(crate) velocity: Vec3,
    /// Zero means omnidirectional; non-zero activates cone attenuation.
    pub(crate) direction: Vec3,
    pub(crate) cone_inner_angle: f32,
    pub(crate) cone_outer_angle: f32,
    pub(crate) cone_outer_gain: f32,

    pub(crate) reference_distance: f32,
    pub(crate) max_distance: f32,
    pub(crate) rolloff: f32,

    /// Set when a buffer was attached directly instead of queued.
    pub(crate) static_mode: bool,
    pub(crate) queue: Vec<QueueEntry>,
    /// Index of the current entry; everything before it is consumed.
    pub(crate) read_index: usize,
    /// Fractional frame position within the current buffer.
    pub(crate) cursor: f64,
    /// Carry-over window for streaming (callback) buffers.
    pub(crate) stream_carry: Vec<f32>,
    pub(crate) stream_frac: f64,
    /// The pull callback reported end-of-data for the current entry.
    pub(crate) stream_ended: bool,
}

impl Source {
    pub(crate) fn new(id: SourceId) -> Self {
        Self {
            id,
            state: SourceState::Initial,
            looping: false,
            relative: false,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            pitch: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            cone_inner_angle: 360.0,
            cone_outer_angle: 360.0,
            cone_outer_gain: 0.0,
            reference_distance: 1.0,
            max_distance: f32::MAX,
            rolloff: 1.0,
            static_mode: false,
            queue: Vec::new(),
            read_index: 0,
            cursor: 0.0,
            stream_carry: Vec::new(),
            stream_frac: 0.0,
            stream_ended: false,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Handle of the buffer currently being consumed, if any.
    pub fn current_buffer(&self) -> Option<BufferId> {
        if matches!(self.state, SourceState::Playing | SourceState::Paused) {
            self.queue.get(self.read_index).map(|entry| entry.bid)
        } else {
            None
        }
    }

    /// Number of entries already consumed and dequeueable.
    pub fn processed_count(&self) -> usize {
        self.read_index.min(self.queue.len())
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    fn set_entry_kind(&mut self, store: &mut BufferStore, index: usize, kind: RefKind) {
        let entry = &mut self.queue[index];
        if entry.kind != kind {
            store.swap_ref(entry.bid, self.id, entry.kind, kind);
            entry.kind = kind;
        }
    }

    /// Appends buffers to the queue.
    ///
    /// Fails without modifying the queue if the source has a directly
    /// attached buffer, if any handle is unknown, or if any buffer's
    /// declared format differs from the formats already queued. Format
    /// identity is required across all members so shared allocations are
    /// never silently reconverted.
    pub(crate) fn enqueue(&mut self, store: &mut BufferStore, bids: &[BufferId]) -> Result<()> {
        if bids.is_empty() {
            return Ok(());
        }
        if self.static_mode {
            return Err(ResonaError::invalid_operation(format!(
                "{} has a directly attached buffer; queueing is not allowed",
                self.id
            )));
        }

        // Validate everything before touching the queue.
        let mut reference_format = self
            .queue
            .first()
            .and_then(|entry| store.get(entry.bid))
            .and_then(|buffer| buffer.format);
        for &bid in bids {
            let buffer = store
                .get(bid)
                .ok_or_else(|| ResonaError::invalid_handle(format!("{} does not exist", bid)))?;
            if let Some(pcm) = buffer.format {
                match reference_format {
                    Some(existing) if existing != pcm => {
                        return Err(ResonaError::invalid_operation(format!(
                            "{} format differs from the formats already queued on {}",
                            bid, self.id
                        )));
                    }
                    Some(_) => {}
                    None => reference_format = Some(pcm),
                }
            }
        }

        for &bid in bids {
            store.add_ref(bid, self.id, RefKind::Queue);
            self.queue.push(QueueEntry {
                bid,
                kind: RefKind::Queue,
            });
        }
        log::debug!("{}: queued {} buffer(s)", self.id, bids.len());
        Ok(())
    }

    /// Dequeues up to `count` buffers from the front of the queue.
    ///
    /// Only consumed (processed) entries may leave the queue; the operation
    /// is all-or-nothing and fails with invalid-operation if `count` exceeds
    /// the consumed prefix.
    pub(crate) fn unqueue(
        &mut self,
        store: &mut BufferStore,
        count: usize,
    ) -> Result<Vec<BufferId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.static_mode {
            return Err(ResonaError::invalid_operation(format!(
                "{} has a directly attached buffer; dequeue is not allowed",
                self.id
            )));
        }
        if count > self.processed_count() {
            return Err(ResonaError::invalid_operation(format!(
                "{}: {} buffer(s) requested but only {} are processed",
                self.id,
                count,
                self.processed_count()
            )));
        }
        debug_assert!(
            self.queue[..count]
                .iter()
                .all(|entry| matches!(store.state(entry.bid), Ok(BufferState::Processed))),
            "consumed entries must be processed"
        );

        let removed: Vec<QueueEntry> = self.queue.drain(..count).collect();
        self.read_index -= count;
        let mut bids = Vec::with_capacity(removed.len());
        for entry in removed {
            store.remove_ref(entry.bid, self.id, entry.kind);
            bids.push(entry.bid);
        }
        log::debug!("{}: dequeued {} buffer(s)", self.id, bids.len());
        Ok(bids)
    }

    /// Directly attaches a single buffer (or detaches with `None`),
    /// replacing the queue. Not legal while playing or paused.
    pub(crate) fn attach_buffer(
        &mut self,
        store: &mut BufferStore,
        bid: Option<BufferId>,
    ) -> Result<()> {
        if matches!(self.state, SourceState::Playing | SourceState::Paused) {
            return Err(ResonaError::invalid_operation(format!(
                "{} must not be playing or paused when attaching a buffer",
                self.id
            )));
        }
        if let Some(bid) = bid {
            if !store.contains(bid) {
                return Err(ResonaError::invalid_handle(format!("{} does not exist", bid)));
            }
        }

        self.clear_queue(store);
        match bid {
            Some(bid) => {
                store.add_ref(bid, self.id, RefKind::Queue);
                self.queue.push(QueueEntry {
                    bid,
                    kind: RefKind::Queue,
                });
                self.static_mode = true;
            }
            None => self.static_mode = false,
        }
        Ok(())
    }

    /// Starts (or restarts) playback from the queue head.
    ///
    /// A paused source resumes without losing its position. Playing an
    /// already-playing source restarts it. A source with an empty queue has
    /// nothing to promote and lands in Stopped.
    pub(crate) fn play(&mut self, store: &mut BufferStore) {
        if self.state == SourceState::Paused {
            log::debug!("{} resuming at entry {}", self.id, self.read_index);
            self.state = SourceState::Playing;
            return;
        }
        if self.queue.is_empty() {
            log::debug!("{} has no queued buffers; play is a stop", self.id);
            self.state = SourceState::Stopped;
            return;
        }

        for index in 0..self.queue.len() {
            let kind = if index == 0 {
                RefKind::Current
            } else {
                RefKind::Queue
            };
            self.set_entry_kind(store, index, kind);
        }
        self.read_index = 0;
        self.cursor = 0.0;
        self.reset_stream_window();
        self.state = SourceState::Playing;
        log::debug!("{} playing", self.id);
    }

    pub(crate) fn pause(&mut self) {
        if self.state == SourceState::Playing {
            self.state = SourceState::Paused;
            log::debug!("{} paused at entry {}", self.id, self.read_index);
        }
    }

    /// Stops the source. Every queue entry is marked consumed, which makes
    /// the whole queue dequeueable.
    pub(crate) fn stop(&mut self, store: &mut BufferStore) {
        for index in 0..self.queue.len() {
            self.set_entry_kind(store, index, RefKind::Current);
        }
        self.read_index = self.queue.len();
        self.cursor = 0.0;
        self.reset_stream_window();
        self.state = SourceState::Stopped;
        log::debug!("{} stopped", self.id);
    }

    /// Returns the source to Initial: cursor reset, all entries pending
    /// again, nothing current.
    pub(crate) fn rewind(&mut self, store: &mut BufferStore) {
        for index in 0..self.queue.len() {
            self.set_entry_kind(store, index, RefKind::Queue);
        }
        self.read_index = 0;
        self.cursor = 0.0;
        self.reset_stream_window();
        self.state = SourceState::Initial;
        log::debug!("{} rewound", self.id);
    }

    /// Advances past the end of the current buffer.
    ///
    /// The finished entry keeps its current reference (that is what keeps it
    /// processed and dequeueable). A looping source with nothing further
    /// queued re-arms at the queue head instead of stopping.
    pub(crate) fn advance(&mut self, store: &mut BufferStore, leftover: f64) -> Advance {
        self.reset_stream_window();
        self.read_index += 1;

        if self.read_index < self.queue.len() {
            self.set_entry_kind(store, self.read_index, RefKind::Current);
            self.cursor = leftover.max(0.0);
            return Advance::Promoted;
        }

        if self.looping && !self.queue.is_empty() {
            self.read_index = 0;
            self.cursor = leftover.max(0.0);
            return Advance::Looped;
        }

        self.state = SourceState::Stopped;
        self.cursor = 0.0;
        Advance::Exhausted
    }

    /// Drops every queue entry and its reference tags.
    pub(crate) fn clear_queue(&mut self, store: &mut BufferStore) {
        for entry in self.queue.drain(..) {
            store.remove_ref(entry.bid, self.id, entry.kind);
        }
        self.read_index = 0;
        self.cursor = 0.0;
        self.reset_stream_window();
    }

    fn reset_stream_window(&mut self) {
        self.stream_carry.clear();
        self.stream_frac = 0.0;
        self.stream_ended = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{self, PcmFormat, SampleFormat};

    fn store_with_buffers(count: usize, frames: usize) -> (BufferStore, Vec<BufferId>) {
        let pcm = PcmFormat::new(SampleFormat::F32, 1, 44_100);
        let mut store = BufferStore::new();
        let bids: Vec<BufferId> = (0..count)
            .map(|n| {
                let id = store.create();
                // Distinct content per buffer so dedup stays out of the way.
                let samples: Vec<f32> = (0..frames).map(|i| (n * frames + i) as f32).collect();
                let bytes = format::encode_mono_frames(&samples, &pcm);
                store.fill(id, &bytes, pcm).unwrap();
                id
            })
            .collect();
        (store, bids)
    }

    #[test]
    fn usage_state_follows_queue_and_play() {
        let (mut store, bids) = store_with_buffers(2, 4);
        let mut source = Source::new(SourceId(1));

        source.enqueue(&mut store, &bids).unwrap();
        assert_eq!(store.state(bids[0]).unwrap(), BufferState::Pending);
        assert_eq!(store.state(bids[1]).unwrap(), BufferState::Pending);

        source.play(&mut store);
        assert_eq!(store.state(bids[0]).unwrap(), BufferState::Processed);
        assert_eq!(store.state(bids[1]).unwrap(), BufferState::Pending);

        source.stop(&mut store);
        assert_eq!(store.state(bids[0]).unwrap(), BufferState::Processed);
        assert_eq!(store.state(bids[1]).unwrap(), BufferState::Processed);
    }

    #[test]
    fn pending_buffers_cannot_be_dequeued() {
        let (mut store, bids) = store_with_buffers(2, 4);
        let mut source = Source::new(SourceId(1));
        source.enqueue(&mut store, &bids).unwrap();
        source.play(&mut store);

        // Nothing consumed yet: dequeue of any count must fail atomically.
        let err = source.unqueue(&mut store, 1).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidOperation));
        assert_eq!(source.queued_count(), 2);

        // Consume the first buffer, then one entry is dequeueable.
        source.advance(&mut store, 0.0);
        assert_eq!(source.processed_count(), 1);
        let removed = source.unqueue(&mut store, 1).unwrap();
        assert_eq!(removed, vec![bids[0]]);
        assert_eq!(store.state(bids[0]).unwrap(), BufferState::Unused);
        store.delete(bids[0]).unwrap();
    }

    #[test]
    fn play_pause_play_keeps_queue_position() {
        let (mut store, bids) = store_with_buffers(3, 4);
        let mut source = Source::new(SourceId(1));
        source.enqueue(&mut store, &bids).unwrap();

        source.play(&mut store);
        source.advance(&mut store, 0.0);
        assert_eq!(source.current_buffer(), Some(bids[1]));

        source.pause();
        assert_eq!(source.state(), SourceState::Paused);
        source.play(&mut store);
        assert_eq!(source.state(), SourceState::Playing);
        assert_eq!(source.current_buffer(), Some(bids[1]));
    }

    #[test]
    fn stop_wins_over_looping() {
        let (mut store, bids) = store_with_buffers(1, 4);
        let mut source = Source::new(SourceId(1));
        source.enqueue(&mut store, &bids).unwrap();
        source.looping = true;
        source.play(&mut store);
        source.stop(&mut store);
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn looping_single_buffer_rearms_with_one_current_ref() {
        let (mut store, bids) = store_with_buffers(1, 4);
        let mut source = Source::new(SourceId(1));
        source.enqueue(&mut store, &bids).unwrap();
        source.looping = true;
        source.play(&mut store);

        for _ in 0..5 {
            assert_eq!(source.advance(&mut store, 0.25), Advance::Looped);
            assert_eq!(source.state(), SourceState::Playing);
            assert_eq!(store.current_ref_count(bids[0]), 1);
            assert_eq!(store.queue_ref_count(bids[0]), 0);
        }
    }

    #[test]
    fn exhausted_queue_stops_non_looping_source() {
        let (mut store, bids) = store_with_buffers(2, 4);
        let mut source = Source::new(SourceId(1));
        source.enqueue(&mut store, &bids).unwrap();
        source.play(&mut store);

        assert_eq!(source.advance(&mut store, 0.0), Advance::Promoted);
        assert_eq!(source.advance(&mut store, 0.0), Advance::Exhausted);
        assert_eq!(source.state(), SourceState::Stopped);
        // Everything consumed: the full queue is dequeueable.
        assert_eq!(source.unqueue(&mut store, 2).unwrap(), bids);
    }

    #[test]
    fn static_attach_excludes_queueing() {
        let (mut store, bids) = store_with_buffers(2, 4);
        let mut source = Source::new(SourceId(1));
        source.attach_buffer(&mut store, Some(bids[0])).unwrap();

        let err = source.unqueue(&mut store, 1).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidOperation));
        let err = source.enqueue(&mut store, &bids[1..]).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidOperation));

        source.attach_buffer(&mut store, None).unwrap();
        source.enqueue(&mut store, &bids).unwrap();
    }

    #[test]
    fn mixed_formats_are_rejected_atomically() {
        let pcm_a = PcmFormat::new(SampleFormat::F32, 1, 44_100);
        let pcm_b = PcmFormat::new(SampleFormat::F32, 1, 22_050);
        let mut store = BufferStore::new();
        let a = store.create();
        let b = store.create();
        store
            .fill(a, &format::encode_mono_frames(&[0.1], &pcm_a), pcm_a)
            .unwrap();
        store
            .fill(b, &format::encode_mono_frames(&[0.2], &pcm_b), pcm_b)
            .unwrap();

        let mut source = Source::new(SourceId(1));
        let err = source.enqueue(&mut store, &[a, b]).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::InvalidOperation));
        assert_eq!(source.queued_count(), 0);
        assert_eq!(store.state(a).unwrap(), BufferState::Unused);
    }
}
