//! Undo/redo over a concurrently edited document
//!
//! Only the local participant's operations are undoable. Remote operations
//! are pushed through both stacks as they arrive, so every stored operation
//! always applies to the current document; undoing never reverts someone
//! else's edit.
//!
//! # Example
//!
//! ```rust
//! use wavesync_core::ot::OperationBuilder;
//! use wavesync_core::{Document, UndoManager};
//!
//! let mut doc = Document::new();
//! let mut undo = UndoManager::new();
//!
//! let mut b = OperationBuilder::new();
//! b.insert_characters("hi");
//! let op = b.build();
//! doc = doc.apply(&op).unwrap();
//! undo.record_local_op(&op).unwrap();
//!
//! let inverse = undo.undo().unwrap();
//! doc = doc.apply(&inverse).unwrap();
//! assert!(doc.is_empty());
//! ```

use crate::error::Result;
use crate::ot::{compose, invert, normalize, transform, Operation};
use crate::sync::HashedVersion;
use tracing::trace;

/// One undoable unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    /// Re-applies the unit
    pub forward: Operation,
    /// Reverts the unit
    pub inverse: Operation,
    /// Server version the unit was recorded at
    pub version_at_creation: HashedVersion,
}

#[derive(Debug, Clone)]
pub struct UndoManager {
    undo_stack: Vec<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
    /// Whether local operations still extend the top undo entry
    unit_open: bool,
    version: HashedVersion,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoManager {
    pub fn new() -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            unit_open: false,
            version: HashedVersion::unsigned(0),
        }
    }

    /// Close the current unit; the next local operation starts a new one
    pub fn checkpoint(&mut self) {
        self.unit_open = false;
    }

    /// Track the latest server version, stamped on new entries
    pub fn record_version(&mut self, version: HashedVersion) {
        self.version = version;
    }

    /// Record an operation the local participant just applied
    pub fn record_local_op(&mut self, op: &Operation) -> Result<()> {
        self.redo_stack.clear();

        match self.undo_stack.last_mut() {
            Some(top) if self.unit_open => {
                top.inverse = compose(&[invert(op), top.inverse.clone()])?;
                top.forward = compose(&[top.forward.clone(), op.clone()])?;
            }
            _ => {
                self.undo_stack.push(UndoEntry {
                    forward: normalize(op)?,
                    inverse: invert(op),
                    version_at_creation: self.version.clone(),
                });
                self.unit_open = true;
            }
        }
        Ok(())
    }

    /// The operation that reverts the most recent unit. The caller applies it.
    pub fn undo(&mut self) -> Option<Operation> {
        self.unit_open = false;
        let entry = self.undo_stack.pop()?;
        let inverse = entry.inverse.clone();
        self.redo_stack.push(entry);
        Some(inverse)
    }

    /// The operation that re-applies the most recently undone unit. The caller
    /// applies it.
    pub fn redo(&mut self) -> Option<Operation> {
        self.unit_open = false;
        let entry = self.redo_stack.pop()?;
        let forward = entry.forward.clone();
        self.undo_stack.push(entry);
        Some(forward)
    }

    /// Account for a remote operation applied to the document
    pub fn on_remote_op(&mut self, op: &Operation) -> Result<()> {
        let (undo_stack, top_kept) = rebase_stack(&self.undo_stack, op, Direction::Undo)?;
        let (redo_stack, _) = rebase_stack(&self.redo_stack, op, Direction::Redo)?;
        if !top_kept {
            // The open unit is gone; later edits must not extend the one below
            self.unit_open = false;
        }
        self.undo_stack = undo_stack;
        self.redo_stack = redo_stack;
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.unit_open = false;
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Undo,
    Redo,
}

/// Push `remote` down a stack, top entry first
///
/// The top entry's next operation applies to the current document; each
/// entry below applies to the document as the entries above it would leave
/// it. The remote operation is transformed past each entry on the way down.
///
/// Also returns whether the top entry survived.
fn rebase_stack(
    stack: &[UndoEntry],
    remote: &Operation,
    direction: Direction,
) -> Result<(Vec<UndoEntry>, bool)> {
    let mut remote = remote.clone();
    let mut rebased = Vec::with_capacity(stack.len());
    let mut top_kept = false;

    for (depth, entry) in stack.iter().rev().enumerate() {
        let next = match direction {
            Direction::Undo => &entry.inverse,
            Direction::Redo => &entry.forward,
        };
        let (next, remote_below) = transform(next, &remote)?.into_tuple();
        remote = remote_below;

        if next.is_noop() {
            trace!(?direction, depth, "dropping entry emptied by a remote operation");
            continue;
        }
        top_kept |= depth == 0;
        let other = invert(&next);
        let (forward, inverse) = match direction {
            Direction::Undo => (other, next),
            Direction::Redo => (next, other),
        };
        rebased.push(UndoEntry {
            forward,
            inverse,
            version_at_creation: entry.version_at_creation.clone(),
        });
    }

    rebased.reverse();
    Ok((rebased, top_kept))
}
