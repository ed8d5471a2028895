//! Normalized operation construction
//!
//! Every operation the crate hands out goes through [`Normalizer`], so
//! operations with the same effect have the same components:
//!
//! - zero-length components are dropped
//! - adjacent retains, character insertions and character deletions with the
//!   same annotation changes are merged
//! - within a gap, insertions come before deletions
//! - attribute updates that change nothing become retains
//! - annotation boundaries are minimal and every key is closed at the end

use super::operation::{
    AnnotationBoundary, AnnotationChanges, Attributes, AttributesUpdate, Component, Operation,
    ValueChange,
};
use super::segment::{Piece, Segment};

/// Builds a normalized [`Operation`] component by component
///
/// # Example
///
/// ```rust
/// use wavesync_core::ot::OperationBuilder;
///
/// // "ab" -> "aXb" with "X" bold
/// let mut builder = OperationBuilder::new();
/// builder
///     .retain(1)
///     .start_annotation("style/bold", None, Some("true"))
///     .insert_characters("X")
///     .end_annotation("style/bold")
///     .retain(1);
/// let op = builder.build();
///
/// assert_eq!(op.base_len(), 2);
/// assert_eq!(op.target_len(), 3);
/// ```
#[derive(Debug, Default)]
pub struct OperationBuilder {
    normalizer: Normalizer,
    open: AnnotationChanges,
}

impl OperationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, n: usize) -> &mut Self {
        self.push(Piece::Retain(n))
    }

    pub fn insert_characters(&mut self, text: &str) -> &mut Self {
        self.push(Piece::InsertCharacters(text.to_string()))
    }

    pub fn insert_element_start(&mut self, tag: &str, attributes: Attributes) -> &mut Self {
        self.push(Piece::InsertElementStart(tag.to_string(), attributes))
    }

    pub fn insert_element_end(&mut self) -> &mut Self {
        self.push(Piece::InsertElementEnd)
    }

    pub fn delete_characters(&mut self, text: &str) -> &mut Self {
        self.push(Piece::DeleteCharacters(text.to_string()))
    }

    pub fn delete_element_start(&mut self, tag: &str, attributes: Attributes) -> &mut Self {
        self.push(Piece::DeleteElementStart(tag.to_string(), attributes))
    }

    pub fn delete_element_end(&mut self) -> &mut Self {
        self.push(Piece::DeleteElementEnd)
    }

    /// Change attributes of the element start under the cursor
    pub fn update_attributes(&mut self, update: AttributesUpdate) -> &mut Self {
        self.push(Piece::UpdateAttributes(update))
    }

    /// Set a single attribute, asserting its current value
    pub fn update_attribute(&mut self, name: &str, old: Option<&str>, new: Option<&str>) -> &mut Self {
        let mut update = AttributesUpdate::new();
        update.insert(name.to_string(), ValueChange::new(old, new));
        self.update_attributes(update)
    }

    /// Start changing annotation `key` from `old` to `new` for the following
    /// components
    pub fn start_annotation(&mut self, key: &str, old: Option<&str>, new: Option<&str>) -> &mut Self {
        self.open.insert(key.to_string(), ValueChange::new(old, new));
        self
    }

    pub fn end_annotation(&mut self, key: &str) -> &mut Self {
        self.open.remove(key);
        self
    }

    pub fn build(self) -> Operation {
        self.normalizer.finish()
    }

    fn push(&mut self, piece: Piece) -> &mut Self {
        self.normalizer.push(Segment::new(piece, self.open.clone()));
        self
    }
}

/// Collects segments and emits a canonical component list
#[derive(Debug, Default)]
pub(crate) struct Normalizer {
    out: Vec<Segment>,
    deletions: Vec<Segment>,
    /// Element nesting of the buffered deletions
    deletion_depth: i64,
    /// Element nesting of insertions already emitted
    insertion_depth: i64,
}

impl Normalizer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, segment: Segment) {
        let Segment { piece, annotations } = segment;
        let piece = match piece {
            Piece::Retain(0) => return,
            Piece::InsertCharacters(text) | Piece::DeleteCharacters(text) if text.is_empty() => return,
            Piece::UpdateAttributes(update) => {
                let update: AttributesUpdate =
                    update.into_iter().filter(|(_, change)| change.old != change.new).collect();
                if update.is_empty() {
                    Piece::Retain(1)
                } else {
                    Piece::UpdateAttributes(update)
                }
            }
            other => other,
        };
        let annotations = normalize_annotations(&piece, annotations);
        let segment = Segment::new(piece, annotations);

        if segment.piece.is_deletion() {
            if self.insertion_depth != 0 {
                // Malformed input; keep the order so apply rejects it.
                self.flush_deletions();
                self.emit(segment);
                return;
            }
            match segment.piece {
                Piece::DeleteElementStart(..) => self.deletion_depth += 1,
                Piece::DeleteElementEnd => self.deletion_depth -= 1,
                _ => {}
            }
            push_merged(&mut self.deletions, segment);
        } else if segment.piece.is_insertion() {
            if self.deletion_depth != 0 {
                self.flush_deletions();
            }
            match segment.piece {
                Piece::InsertElementStart(..) => self.insertion_depth += 1,
                Piece::InsertElementEnd => self.insertion_depth -= 1,
                _ => {}
            }
            self.emit(segment);
        } else {
            self.flush_deletions();
            self.emit(segment);
        }
    }

    pub(crate) fn finish(mut self) -> Operation {
        self.flush_deletions();

        let mut components = Vec::with_capacity(self.out.len());
        let mut open = AnnotationChanges::new();
        for segment in self.out {
            if segment.annotations != open {
                let boundary = boundary_between(&open, &segment.annotations);
                if !boundary.is_empty() {
                    components.push(Component::AnnotationBoundary(boundary));
                }
                open = segment.annotations;
            }
            components.push(segment.piece.into_component());
        }
        if !open.is_empty() {
            components.push(Component::AnnotationBoundary(AnnotationBoundary::end(
                open.into_keys(),
            )));
        }

        Operation::from_components(components)
    }

    fn emit(&mut self, segment: Segment) {
        push_merged(&mut self.out, segment);
    }

    fn flush_deletions(&mut self) {
        for segment in std::mem::take(&mut self.deletions) {
            push_merged(&mut self.out, segment);
        }
        self.deletion_depth = 0;
    }
}

/// Drop annotation entries that cannot affect the piece they cover
fn normalize_annotations(piece: &Piece, annotations: AnnotationChanges) -> AnnotationChanges {
    if piece.is_insertion() {
        annotations
            .into_iter()
            .filter_map(|(key, change)| {
                change.new.map(|new| {
                    (key, ValueChange { old: None, new: Some(new) })
                })
            })
            .collect()
    } else if piece.is_deletion() {
        annotations
            .into_iter()
            .filter_map(|(key, change)| {
                change.old.map(|old| {
                    (key, ValueChange { old: Some(old), new: None })
                })
            })
            .collect()
    } else {
        annotations
            .into_iter()
            .filter(|(_, change)| change.old != change.new)
            .collect()
    }
}

fn push_merged(out: &mut Vec<Segment>, segment: Segment) {
    if let Some(last) = out.last_mut() {
        if last.annotations == segment.annotations {
            match (&mut last.piece, &segment.piece) {
                (Piece::Retain(a), Piece::Retain(b)) => {
                    *a += b;
                    return;
                }
                (Piece::InsertCharacters(a), Piece::InsertCharacters(b))
                | (Piece::DeleteCharacters(a), Piece::DeleteCharacters(b)) => {
                    a.push_str(b);
                    return;
                }
                _ => {}
            }
        }
    }
    out.push(segment);
}

/// Minimal boundary that turns the `from` open set into `to`
fn boundary_between(from: &AnnotationChanges, to: &AnnotationChanges) -> AnnotationBoundary {
    AnnotationBoundary {
        ends: from
            .keys()
            .filter(|key| !to.contains_key(*key))
            .cloned()
            .collect(),
        changes: to
            .iter()
            .filter(|(key, change)| from.get(*key) != Some(*change))
            .map(|(key, change)| (key.clone(), change.clone()))
            .collect(),
    }
}
