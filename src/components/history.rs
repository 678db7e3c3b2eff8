use std::fmt;
use std::sync::Arc;

use crate::raster::{self, Image};

// ============================================================================
// UNDO RECORD - reversible description of one edit
// ============================================================================

/// Pure image → image function used by closed-form records.
pub type ImageFn = Arc<dyn Fn(&Image) -> Image + Send + Sync>;

/// One entry in the undo history.
pub enum UndoRecord {
    /// Complete copy of the other side of the edit.  `undo` swaps it in,
    /// `redo` swaps it back out.  Used when no cheaper inverse is known.
    FullSnapshot { description: String, image: Image },
    /// Edit with a known exact inverse (flip, rotate).
    /// `forward(backward(img)) == img` must hold bit for bit.
    ClosedForm {
        description: String,
        forward: ImageFn,
        backward: ImageFn,
    },
}

impl UndoRecord {
    /// Snapshot of `before`, the image as it was prior to the edit.
    pub fn full_snapshot(description: impl Into<String>, before: Image) -> Self {
        UndoRecord::FullSnapshot {
            description: description.into(),
            image: before,
        }
    }

    pub fn closed_form(
        description: impl Into<String>,
        forward: impl Fn(&Image) -> Image + Send + Sync + 'static,
        backward: impl Fn(&Image) -> Image + Send + Sync + 'static,
    ) -> Self {
        UndoRecord::ClosedForm {
            description: description.into(),
            forward: Arc::new(forward),
            backward: Arc::new(backward),
        }
    }

    /// Closed-form record for an involution (applying it twice is a no-op).
    pub fn self_inverse(
        description: impl Into<String>,
        f: impl Fn(&Image) -> Image + Send + Sync + 'static,
    ) -> Self {
        let f: ImageFn = Arc::new(f);
        UndoRecord::ClosedForm {
            description: description.into(),
            forward: Arc::clone(&f),
            backward: f,
        }
    }

    pub fn undo(&mut self, img: &mut Image) {
        match self {
            UndoRecord::FullSnapshot { image, .. } => std::mem::swap(img, image),
            UndoRecord::ClosedForm { backward, .. } => *img = backward(img),
        }
    }

    pub fn redo(&mut self, img: &mut Image) {
        match self {
            UndoRecord::FullSnapshot { image, .. } => std::mem::swap(img, image),
            UndoRecord::ClosedForm { forward, .. } => *img = forward(img),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            UndoRecord::FullSnapshot { description, .. }
            | UndoRecord::ClosedForm { description, .. } => description,
        }
    }

    /// Approximate bytes kept alive by this record.
    pub fn memory_size(&self) -> usize {
        match self {
            UndoRecord::FullSnapshot { image, description } => {
                raster::memory_bytes(image) + description.len()
            }
            UndoRecord::ClosedForm { description, .. } => {
                std::mem::size_of::<Self>() + description.len()
            }
        }
    }
}

impl fmt::Debug for UndoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoRecord::FullSnapshot { description, image } => f
                .debug_struct("FullSnapshot")
                .field("description", description)
                .field("size", &image.dimensions())
                .finish(),
            UndoRecord::ClosedForm { description, .. } => f
                .debug_struct("ClosedForm")
                .field("description", description)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// COMMAND HISTORY - cursor-addressed linear undo/redo stack
// ============================================================================

/// Caps applied after every `add_command`.  `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryLimits {
    pub max_steps: Option<usize>,
    pub max_bytes: Option<usize>,
}

/// Linear undo/redo history.
///
/// Think of `cursor` as pointing *between* entries: records `[0, cursor)` are
/// applied and can be undone, records `[cursor, len)` were undone and can be
/// redone.  `saved` is the cursor value at the last save, or `None` when the
/// saved state is unreachable (never saved, or pruned / truncated away).
/// A record plus the bytes it was charged when added.  A snapshot's size
/// changes as undo/redo swap images through it, so the charge is fixed.
#[derive(Debug)]
struct Entry {
    record: UndoRecord,
    bytes: usize,
}

#[derive(Debug, Default)]
pub struct CommandHistory {
    records: Vec<Entry>,
    cursor: usize,
    saved: Option<usize>,
    limits: HistoryLimits,
    total_memory: usize,
}

impl CommandHistory {
    /// Empty history matching what is on disk.
    pub fn new() -> Self {
        Self {
            saved: Some(0),
            ..Self::default()
        }
    }

    /// Empty history for an image that was never saved; stays modified until
    /// `mark_saved`.
    pub fn already_modified() -> Self {
        Self {
            saved: None,
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: HistoryLimits) -> Self {
        self.limits = limits;
        self.prune();
        self
    }

    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }

    pub fn is_modified(&self) -> bool {
        self.saved != Some(self.cursor)
    }

    pub fn mark_saved(&mut self) {
        self.saved = Some(self.cursor);
    }

    pub fn current_state(&self) -> usize {
        self.cursor
    }

    pub fn saved_state(&self) -> Option<usize> {
        self.saved
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn has_redo(&self) -> bool {
        self.cursor < self.records.len()
    }

    /// Push a new edit, discarding anything that could have been redone.
    pub fn add_command(&mut self, record: UndoRecord) {
        if self.cursor < self.records.len() {
            let dropped = self.records.len() - self.cursor;
            for old in self.records.drain(self.cursor..) {
                self.total_memory = self.total_memory.saturating_sub(old.bytes);
            }
            // The saved state lived in the discarded tail.
            if self.saved.is_some_and(|s| s > self.cursor) {
                self.saved = None;
            }
            crate::log_debug!("History: discarded {} redo record(s)", dropped);
        }

        let bytes = record.memory_size();
        self.total_memory += bytes;
        self.records.push(Entry { record, bytes });
        self.cursor += 1;

        self.prune();
    }

    pub fn undo(&mut self, img: &mut Image) -> bool {
        if !self.has_undo() {
            return false;
        }
        self.cursor -= 1;
        self.records[self.cursor].record.undo(img);
        true
    }

    pub fn redo(&mut self, img: &mut Image) -> bool {
        if !self.has_redo() {
            return false;
        }
        self.records[self.cursor].record.redo(img);
        self.cursor += 1;
        true
    }

    /// Undo up to `steps` times; returns how many actually happened.
    pub fn undo_to(&mut self, steps: usize, img: &mut Image) -> usize {
        (0..steps).take_while(|_| self.undo(img)).count()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.cursor
            .checked_sub(1)
            .map(|i| self.records[i].record.description())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.records.get(self.cursor).map(|e| e.record.description())
    }

    /// Descriptions of undoable records, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.records[..self.cursor]
            .iter()
            .rev()
            .map(|e| e.record.description().to_string())
            .collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    /// Drop the oldest applied records until the limits hold.
    fn prune(&mut self) {
        let mut pruned = 0usize;
        while self.cursor > 0 && self.records.len() > 1 && self.over_limit() {
            let removed = self.records.remove(0);
            self.total_memory = self.total_memory.saturating_sub(removed.bytes);
            self.cursor -= 1;
            self.saved = self.saved.and_then(|s| s.checked_sub(1));
            pruned += 1;
        }
        if pruned > 0 {
            crate::log_debug!(
                "History: pruned {} oldest record(s), {} left ({} bytes)",
                pruned,
                self.records.len(),
                self.total_memory
            );
        }
    }

    fn over_limit(&self) -> bool {
        self.limits
            .max_steps
            .is_some_and(|max| self.records.len() > max)
            || self
                .limits
                .max_bytes
                .is_some_and(|max| self.total_memory > max)
    }
}
