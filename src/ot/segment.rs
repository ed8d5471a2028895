//! Segment stream: an operation flattened into spans that each carry the
//! annotation changes in force over them.
//!
//! Annotation boundaries are stateful, which makes them awkward to reason
//! about pairwise. Transform, compose, invert and apply all work on segments
//! instead: a segment is one non-boundary component plus the full map of
//! annotation changes open at that point. [`Normalizer`](super::builder)
//! turns segments back into components.

use super::operation::{AnnotationChanges, Attributes, AttributesUpdate, Component, Operation};
use crate::error::{Result, SyncError};

/// The non-boundary part of a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Retain(usize),
    InsertCharacters(String),
    InsertElementStart(String, Attributes),
    InsertElementEnd,
    DeleteCharacters(String),
    DeleteElementStart(String, Attributes),
    DeleteElementEnd,
    UpdateAttributes(AttributesUpdate),
}

impl Piece {
    pub(crate) fn is_insertion(&self) -> bool {
        matches!(
            self,
            Piece::InsertCharacters(_) | Piece::InsertElementStart(..) | Piece::InsertElementEnd
        )
    }

    pub(crate) fn is_deletion(&self) -> bool {
        matches!(
            self,
            Piece::DeleteCharacters(_) | Piece::DeleteElementStart(..) | Piece::DeleteElementEnd
        )
    }

    /// Items consumed from the base document
    pub(crate) fn base_len(&self) -> usize {
        match self {
            Piece::Retain(n) => *n,
            Piece::DeleteCharacters(text) => char_len(text),
            Piece::DeleteElementStart(..) | Piece::DeleteElementEnd | Piece::UpdateAttributes(_) => 1,
            Piece::InsertCharacters(_) | Piece::InsertElementStart(..) | Piece::InsertElementEnd => 0,
        }
    }

    /// Items produced in the target document
    pub(crate) fn target_len(&self) -> usize {
        match self {
            Piece::Retain(n) => *n,
            Piece::InsertCharacters(text) => char_len(text),
            Piece::InsertElementStart(..) | Piece::InsertElementEnd | Piece::UpdateAttributes(_) => 1,
            Piece::DeleteCharacters(_) | Piece::DeleteElementStart(..) | Piece::DeleteElementEnd => 0,
        }
    }

    /// Length along whichever side this piece has extent on
    fn span(&self) -> usize {
        self.base_len().max(self.target_len())
    }

    /// The same content, removed instead of added
    pub(crate) fn as_deletion(&self) -> Piece {
        match self {
            Piece::InsertCharacters(text) => Piece::DeleteCharacters(text.clone()),
            Piece::InsertElementStart(tag, attrs) => Piece::DeleteElementStart(tag.clone(), attrs.clone()),
            Piece::InsertElementEnd => Piece::DeleteElementEnd,
            other => other.clone(),
        }
    }

    /// The same content, added instead of removed
    pub(crate) fn as_insertion(&self) -> Piece {
        match self {
            Piece::DeleteCharacters(text) => Piece::InsertCharacters(text.clone()),
            Piece::DeleteElementStart(tag, attrs) => Piece::InsertElementStart(tag.clone(), attrs.clone()),
            Piece::DeleteElementEnd => Piece::InsertElementEnd,
            other => other.clone(),
        }
    }

    /// Whether the piece touches a character, an element start or an element end
    pub(crate) fn item_class(&self) -> ItemClass {
        match self {
            Piece::Retain(_) => ItemClass::Any,
            Piece::InsertCharacters(_) | Piece::DeleteCharacters(_) => ItemClass::Characters,
            Piece::InsertElementStart(..) | Piece::DeleteElementStart(..) | Piece::UpdateAttributes(_) => {
                ItemClass::ElementStart
            }
            Piece::InsertElementEnd | Piece::DeleteElementEnd => ItemClass::ElementEnd,
        }
    }

    pub(crate) fn into_component(self) -> Component {
        match self {
            Piece::Retain(n) => Component::Retain(n),
            Piece::InsertCharacters(text) => Component::InsertCharacters(text),
            Piece::InsertElementStart(tag, attributes) => Component::InsertElementStart { tag, attributes },
            Piece::InsertElementEnd => Component::InsertElementEnd,
            Piece::DeleteCharacters(text) => Component::DeleteCharacters(text),
            Piece::DeleteElementStart(tag, attributes) => Component::DeleteElementStart { tag, attributes },
            Piece::DeleteElementEnd => Component::DeleteElementEnd,
            Piece::UpdateAttributes(update) => Component::UpdateAttributes(update),
        }
    }
}

/// Coarse kind of document item a piece walks over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemClass {
    Any,
    Characters,
    ElementStart,
    ElementEnd,
}

impl ItemClass {
    pub(crate) fn compatible(self, other: ItemClass) -> bool {
        self == ItemClass::Any || other == ItemClass::Any || self == other
    }
}

/// A piece plus the annotation changes in force over it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub piece: Piece,
    pub annotations: AnnotationChanges,
}

impl Segment {
    pub(crate) fn new(piece: Piece, annotations: AnnotationChanges) -> Self {
        Self { piece, annotations }
    }

    pub(crate) fn plain(piece: Piece) -> Self {
        Self {
            piece,
            annotations: AnnotationChanges::new(),
        }
    }

    /// Split off the first `n` units of this segment, leaving the rest in place.
    ///
    /// Only retains and character runs are ever longer than one unit.
    pub(crate) fn split_off_front(&mut self, n: usize) -> Segment {
        let front = match &mut self.piece {
            Piece::Retain(len) => {
                debug_assert!(n <= *len);
                *len -= n;
                Piece::Retain(n)
            }
            Piece::InsertCharacters(text) => {
                let (head, tail) = split_chars(text, n);
                *text = tail;
                Piece::InsertCharacters(head)
            }
            Piece::DeleteCharacters(text) => {
                let (head, tail) = split_chars(text, n);
                *text = tail;
                Piece::DeleteCharacters(head)
            }
            _ => {
                debug_assert_eq!(n, 1);
                return self.clone();
            }
        };
        Segment::new(front, self.annotations.clone())
    }
}

/// Flatten an operation into segments, tracking annotation boundaries.
///
/// Zero-length components are dropped. Ending a key that is not open, or
/// ending and changing the same key in one boundary, is a schema violation.
pub(crate) fn segments(op: &Operation) -> Result<Vec<Segment>> {
    let mut open = AnnotationChanges::new();
    let mut out = Vec::with_capacity(op.components().len());

    for component in op.components() {
        let piece = match component {
            Component::AnnotationBoundary(boundary) => {
                for key in &boundary.ends {
                    if boundary.changes.contains_key(key) {
                        return Err(SyncError::SchemaViolation(format!(
                            "annotation key '{}' both ended and changed",
                            key
                        )));
                    }
                    if open.remove(key).is_none() {
                        return Err(SyncError::SchemaViolation(format!(
                            "annotation key '{}' ended but never opened",
                            key
                        )));
                    }
                }
                for (key, change) in &boundary.changes {
                    open.insert(key.clone(), change.clone());
                }
                continue;
            }
            Component::Retain(0) => continue,
            Component::InsertCharacters(text) | Component::DeleteCharacters(text) if text.is_empty() => {
                continue
            }
            Component::Retain(n) => Piece::Retain(*n),
            Component::InsertCharacters(text) => Piece::InsertCharacters(text.clone()),
            Component::InsertElementStart { tag, attributes } => {
                Piece::InsertElementStart(tag.clone(), attributes.clone())
            }
            Component::InsertElementEnd => Piece::InsertElementEnd,
            Component::DeleteCharacters(text) => Piece::DeleteCharacters(text.clone()),
            Component::DeleteElementStart { tag, attributes } => {
                Piece::DeleteElementStart(tag.clone(), attributes.clone())
            }
            Component::DeleteElementEnd => Piece::DeleteElementEnd,
            Component::UpdateAttributes(update) => Piece::UpdateAttributes(update.clone()),
        };
        out.push(Segment::new(piece, open.clone()));
    }

    Ok(out)
}

/// Cursor over a segment list that hands out segments in arbitrary-length
/// slices.
pub(crate) struct SegmentCursor {
    segments: std::vec::IntoIter<Segment>,
    head: Option<Segment>,
}

impl SegmentCursor {
    pub(crate) fn new(segments: Vec<Segment>) -> Self {
        let mut segments = segments.into_iter();
        let head = segments.next();
        Self { segments, head }
    }

    pub(crate) fn peek(&self) -> Option<&Segment> {
        self.head.as_ref()
    }

    /// Take the whole head segment
    pub(crate) fn next_segment(&mut self) -> Option<Segment> {
        let head = self.head.take();
        self.head = self.segments.next();
        head
    }

    /// Take `n` units from the head segment, splitting it if needed
    pub(crate) fn take(&mut self, n: usize) -> Option<Segment> {
        let span = self.head.as_ref()?.piece.span();
        if n >= span {
            return self.next_segment();
        }
        self.head.as_mut().map(|head| head.split_off_front(n))
    }
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split a string after `n` characters
pub(crate) fn split_chars(text: &str, n: usize) -> (String, String) {
    let byte = text
        .char_indices()
        .nth(n)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    (text[..byte].to_string(), text[byte..].to_string())
}
