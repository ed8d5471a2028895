//! Inversion of operations

use super::operation::{AnnotationBoundary, Component, Operation, ValueChange};
use super::segment::segments;
use std::collections::BTreeMap;

/// The operation that undoes `op`
///
/// Applying `op` and then `invert(op)` restores the original document.
/// Insertions become deletions and vice versa; attribute and annotation
/// changes swap their old and new values.
///
/// # Example
///
/// ```rust
/// use wavesync_core::ot::{invert, OperationBuilder};
/// use wavesync_core::Document;
///
/// let doc = {
///     let mut b = OperationBuilder::new();
///     b.insert_characters("abc");
///     Document::from_operation(&b.build()).unwrap()
/// };
/// let mut b = OperationBuilder::new();
/// b.retain(1).delete_characters("b").insert_characters("X").retain(1);
/// let op = b.build();
///
/// let edited = doc.apply(&op).unwrap();
/// assert_eq!(edited.text(), "aXc");
/// assert_eq!(edited.apply(&invert(&op)).unwrap(), doc);
/// ```
pub fn invert(op: &Operation) -> Operation {
    let inverted = Operation::from_components(op.components().iter().map(invert_component).collect());

    // Malformed boundaries stay as they are for apply to reject.
    match segments(&inverted) {
        Ok(segments) => {
            let mut normalizer = super::builder::Normalizer::new();
            segments.into_iter().for_each(|segment| normalizer.push(segment));
            normalizer.finish()
        }
        Err(_) => inverted,
    }
}

fn invert_component(component: &Component) -> Component {
    match component {
        Component::Retain(n) => Component::Retain(*n),
        Component::InsertCharacters(text) => Component::DeleteCharacters(text.clone()),
        Component::InsertElementStart { tag, attributes } => Component::DeleteElementStart {
            tag: tag.clone(),
            attributes: attributes.clone(),
        },
        Component::InsertElementEnd => Component::DeleteElementEnd,
        Component::DeleteCharacters(text) => Component::InsertCharacters(text.clone()),
        Component::DeleteElementStart { tag, attributes } => Component::InsertElementStart {
            tag: tag.clone(),
            attributes: attributes.clone(),
        },
        Component::DeleteElementEnd => Component::InsertElementEnd,
        Component::UpdateAttributes(update) => Component::UpdateAttributes(reversed(update)),
        Component::AnnotationBoundary(boundary) => Component::AnnotationBoundary(AnnotationBoundary {
            ends: boundary.ends.clone(),
            changes: reversed(&boundary.changes),
        }),
    }
}

fn reversed(changes: &BTreeMap<String, ValueChange>) -> BTreeMap<String, ValueChange> {
    changes
        .iter()
        .map(|(key, change)| (key.clone(), change.reversed()))
        .collect()
}
