//! Composition of sequential operations

use super::builder::Normalizer;
use super::operation::{AnnotationChanges, Operation, ValueChange};
use super::segment::{segments, Piece, Segment, SegmentCursor};
use crate::error::{Result, SyncError};

/// Compose a chain of operations into one with the same effect
///
/// Each operation must be defined over the document the previous one
/// produces. The result is normalized, so composition is associative under
/// structural equality.
///
/// # Errors
///
/// [`SyncError::ComposeIncompatible`] for an empty chain, when extents do not
/// line up, or when adjacent operations disagree about content.
pub fn compose(ops: &[Operation]) -> Result<Operation> {
    let (first, rest) = ops
        .split_first()
        .ok_or_else(|| SyncError::ComposeIncompatible("nothing to compose".into()))?;

    let mut acc = super::normalize(first)?;
    for op in rest {
        acc = compose_pair(&acc, op)?;
    }
    Ok(acc)
}

/// Compose `first` followed by `second`
///
/// # Example
///
/// ```rust
/// use wavesync_core::ot::{compose_pair, OperationBuilder};
/// use wavesync_core::Document;
///
/// let doc = {
///     let mut b = OperationBuilder::new();
///     b.insert_characters("ab");
///     Document::from_operation(&b.build()).unwrap()
/// };
/// let first = { let mut b = OperationBuilder::new(); b.retain(1).insert_characters("X").retain(1); b.build() };
/// let second = { let mut b = OperationBuilder::new(); b.retain(3).insert_characters("Y"); b.build() };
///
/// let both = compose_pair(&first, &second).unwrap();
/// assert_eq!(doc.apply(&both).unwrap().text(), "aXbY");
/// ```
pub fn compose_pair(first: &Operation, second: &Operation) -> Result<Operation> {
    if first.target_len() != second.base_len() {
        return Err(SyncError::ComposeIncompatible(format!(
            "first produces {} items, second expects {}",
            first.target_len(),
            second.base_len()
        )));
    }

    let mut a = SegmentCursor::new(segments(first)?);
    let mut b = SegmentCursor::new(segments(second)?);
    let mut out = Normalizer::new();

    loop {
        let a_deletes = a.peek().map(|s| s.piece.is_deletion());
        let b_inserts = b.peek().map(|s| s.piece.is_insertion());

        match (a_deletes, b_inserts) {
            (Some(true), _) => {
                if let Some(segment) = a.next_segment() {
                    out.push(segment);
                }
            }
            (_, Some(true)) => {
                if let Some(segment) = b.next_segment() {
                    out.push(segment);
                }
            }
            (Some(false), Some(false)) => {
                let n = match (a.peek(), b.peek()) {
                    (Some(x), Some(y)) => x.piece.target_len().min(y.piece.base_len()),
                    _ => 0,
                };
                match (a.take(n), b.take(n)) {
                    (Some(x), Some(y)) => {
                        if let Some(segment) = combine(x, y, n)? {
                            out.push(segment);
                        }
                    }
                    _ => return Err(ended_early()),
                }
            }
            (None, None) => break,
            _ => return Err(ended_early()),
        }
    }

    Ok(out.finish())
}

fn ended_early() -> SyncError {
    SyncError::ComposeIncompatible("one operation ends before the other".into())
}

/// Combine a piece of the first operation that produces `n` items with a
/// piece of the second that consumes the same items
fn combine(first: Segment, second: Segment, n: usize) -> Result<Option<Segment>> {
    if !first.piece.item_class().compatible(second.piece.item_class()) {
        return Err(SyncError::ComposeIncompatible(format!(
            "{:?} produces content that {:?} does not expect",
            first.piece, second.piece
        )));
    }

    let segment = match (first.piece, second.piece) {
        // Inserted then deleted: gone without a trace
        (inserted, deleted) if inserted.is_insertion() && deleted.is_deletion() => {
            if inserted.as_deletion() != deleted {
                return Err(SyncError::ComposeIncompatible(format!(
                    "{:?} deleted as {:?}",
                    inserted, deleted
                )));
            }
            return Ok(None);
        }
        (Piece::InsertElementStart(tag, mut attributes), Piece::UpdateAttributes(update)) => {
            for (name, change) in &update {
                set(&mut attributes, name, &change.new);
            }
            Segment::new(
                Piece::InsertElementStart(tag, attributes),
                inserted_annotations(&first.annotations, &second.annotations),
            )
        }
        (inserted, _) if inserted.is_insertion() => Segment::new(
            inserted,
            inserted_annotations(&first.annotations, &second.annotations),
        ),
        (Piece::UpdateAttributes(update), Piece::DeleteElementStart(tag, mut attributes)) => {
            for (name, change) in &update {
                set(&mut attributes, name, &change.old);
            }
            Segment::new(
                Piece::DeleteElementStart(tag, attributes),
                deleted_annotations(&first.annotations, &second.annotations),
            )
        }
        (_, deleted) if deleted.is_deletion() => Segment::new(
            deleted,
            deleted_annotations(&first.annotations, &second.annotations),
        ),
        (Piece::UpdateAttributes(a), Piece::UpdateAttributes(b)) => Segment::new(
            Piece::UpdateAttributes(compose_changes(&a, &b)),
            compose_changes(&first.annotations, &second.annotations),
        ),
        (update @ Piece::UpdateAttributes(_), _) | (_, update @ Piece::UpdateAttributes(_)) => {
            Segment::new(update, compose_changes(&first.annotations, &second.annotations))
        }
        _ => Segment::new(
            Piece::Retain(n),
            compose_changes(&first.annotations, &second.annotations),
        ),
    };

    Ok(Some(segment))
}

/// Two successive changes to the same keys as one change
pub(crate) fn compose_changes(first: &AnnotationChanges, second: &AnnotationChanges) -> AnnotationChanges {
    let mut out = first.clone();
    for (key, change) in second {
        let old = match first.get(key) {
            Some(earlier) => earlier.old.clone(),
            None => change.old.clone(),
        };
        out.insert(
            key.clone(),
            ValueChange {
                old,
                new: change.new.clone(),
            },
        );
    }
    out
}

/// Annotations of an item inserted by the first operation after the second
/// one retained it
fn inserted_annotations(first: &AnnotationChanges, second: &AnnotationChanges) -> AnnotationChanges {
    let mut out: AnnotationChanges = first
        .iter()
        .map(|(key, change)| (key.clone(), ValueChange { old: None, new: change.new.clone() }))
        .collect();
    for (key, change) in second {
        out.insert(key.clone(), ValueChange { old: None, new: change.new.clone() });
    }
    out
}

/// Annotations of an item deleted by the second operation, described as it
/// was before the first one changed it
fn deleted_annotations(first: &AnnotationChanges, second: &AnnotationChanges) -> AnnotationChanges {
    let mut out: AnnotationChanges = second
        .iter()
        .map(|(key, change)| (key.clone(), ValueChange { old: change.old.clone(), new: None }))
        .collect();
    for (key, change) in first {
        out.insert(key.clone(), ValueChange { old: change.old.clone(), new: None });
    }
    out
}

fn set(map: &mut std::collections::BTreeMap<String, String>, key: &str, value: &Option<String>) {
    match value {
        Some(value) => {
            map.insert(key.to_string(), value.clone());
        }
        None => {
            map.remove(key);
        }
    }
}
