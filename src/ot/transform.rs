//! Transformation of concurrent operations
//!
//! Given two operations over the same document, [`transform`] produces a pair
//! `(client', server')` such that applying `server` then `client'` reaches the
//! same document as applying `client` then `server'`.
//!
//! Conflicts resolve in favour of the left operand: its insertions at a
//! shared position come first, and its values win when both sides change the
//! same attribute or annotation key.

use super::builder::Normalizer;
use super::operation::{AnnotationChanges, Operation, OperationPair, ValueChange};
use super::segment::{segments, Piece, Segment, SegmentCursor};
use crate::error::{Result, SyncError};
use std::collections::BTreeMap;
use tracing::trace;

/// Transform two concurrent operations against each other
///
/// # Errors
///
/// [`SyncError::TransformIncompatible`] when the operations have different
/// base extents or disagree about the content they walk over.
///
/// # Example
///
/// ```rust
/// use wavesync_core::ot::{transform, OperationBuilder};
/// use wavesync_core::Document;
///
/// let doc = {
///     let mut b = OperationBuilder::new();
///     b.insert_characters("AB");
///     Document::from_operation(&b.build()).unwrap()
/// };
/// let client = { let mut b = OperationBuilder::new(); b.retain(1).insert_characters("X").retain(1); b.build() };
/// let server = { let mut b = OperationBuilder::new(); b.retain(1).insert_characters("Y").retain(1); b.build() };
///
/// let pair = transform(&client, &server).unwrap();
/// let left = doc.apply(&server).unwrap().apply(&pair.client).unwrap();
/// let right = doc.apply(&client).unwrap().apply(&pair.server).unwrap();
///
/// assert_eq!(left, right);
/// assert_eq!(left.text(), "AXYB");
/// ```
pub fn transform(client: &Operation, server: &Operation) -> Result<OperationPair> {
    if client.base_len() != server.base_len() {
        return Err(SyncError::TransformIncompatible(format!(
            "base extents differ: {} vs {}",
            client.base_len(),
            server.base_len()
        )));
    }

    let mut transformer = Transformer {
        client: SegmentCursor::new(segments(client)?),
        server: SegmentCursor::new(segments(server)?),
        client_out: Normalizer::new(),
        server_out: Normalizer::new(),
        client_deleting: 0,
        server_deleting: 0,
    };
    transformer.run()?;

    Ok(OperationPair::new(
        transformer.client_out.finish(),
        transformer.server_out.finish(),
    ))
}

/// Which operand a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

struct Transformer {
    client: SegmentCursor,
    server: SegmentCursor,
    /// Applies after the server operation
    client_out: Normalizer,
    /// Applies after the client operation
    server_out: Normalizer,
    /// Element nesting of the client's deletions at the cursor
    client_deleting: usize,
    server_deleting: usize,
}

impl Transformer {
    fn run(&mut self) -> Result<()> {
        loop {
            let client_inserts = self.client.peek().map(|s| s.piece.is_insertion());
            let server_inserts = self.server.peek().map(|s| s.piece.is_insertion());

            match (client_inserts, server_inserts) {
                (Some(true), _) => {
                    if let Some(segment) = self.client.next_segment() {
                        self.insertion(Side::Client, segment);
                    }
                }
                (_, Some(true)) => {
                    if let Some(segment) = self.server.next_segment() {
                        self.insertion(Side::Server, segment);
                    }
                }
                (Some(false), Some(false)) => self.consume_both()?,
                (None, None) => return Ok(()),
                _ => {
                    return Err(SyncError::TransformIncompatible(
                        "one operation ends before the other".into(),
                    ))
                }
            }
        }
    }

    /// An insertion by one side: the other side either skips over it, or
    /// deletes it when it lands inside an element the other side removes
    fn insertion(&mut self, side: Side, segment: Segment) {
        let (own_out, other_out, other_deleting) = match side {
            Side::Client => (&mut self.client_out, &mut self.server_out, self.server_deleting),
            Side::Server => (&mut self.server_out, &mut self.client_out, self.client_deleting),
        };

        if other_deleting > 0 {
            trace!(?side, "insertion inside a concurrently deleted element");
            let annotations = segment
                .annotations
                .iter()
                .filter_map(|(key, change)| {
                    change.new.as_ref().map(|new| (key.clone(), ValueChange::new(Some(new), None)))
                })
                .collect();
            other_out.push(Segment::new(segment.piece.as_deletion(), annotations));
        } else {
            let len = segment.piece.target_len();
            own_out.push(segment);
            other_out.push(Segment::plain(Piece::Retain(len)));
        }
    }

    fn consume_both(&mut self) -> Result<()> {
        let (client_len, server_len) = match (self.client.peek(), self.server.peek()) {
            (Some(c), Some(s)) => (c.piece.base_len(), s.piece.base_len()),
            _ => return Ok(()),
        };
        let n = client_len.min(server_len);
        let (c, s) = match (self.client.take(n), self.server.take(n)) {
            (Some(c), Some(s)) => (c, s),
            _ => {
                return Err(SyncError::TransformIncompatible(
                    "one operation ends before the other".into(),
                ))
            }
        };

        if !c.piece.item_class().compatible(s.piece.item_class()) {
            return Err(SyncError::TransformIncompatible(format!(
                "operations disagree on content: {:?} vs {:?}",
                c.piece, s.piece
            )));
        }
        self.client_deleting = track_deletion(self.client_deleting, &c.piece);
        self.server_deleting = track_deletion(self.server_deleting, &s.piece);

        match (c.piece.is_deletion(), s.piece.is_deletion()) {
            (true, true) => {
                if c.piece != s.piece {
                    return Err(SyncError::TransformIncompatible(format!(
                        "both sides delete different content: {:?} vs {:?}",
                        c.piece, s.piece
                    )));
                }
            }
            (true, false) => self.client_out.push(deletion_after(c, &s)),
            (false, true) => self.server_out.push(deletion_after(s, &c)),
            (false, false) => {
                let (client_annotations, server_annotations) =
                    transform_changes(&c.annotations, &s.annotations);
                let (client_piece, server_piece) = match (c.piece, s.piece) {
                    (Piece::UpdateAttributes(cu), Piece::UpdateAttributes(su)) => {
                        let (cu, su) = transform_changes(&cu, &su);
                        (Piece::UpdateAttributes(cu), Piece::UpdateAttributes(su))
                    }
                    (Piece::UpdateAttributes(cu), _) => (Piece::UpdateAttributes(cu), Piece::Retain(1)),
                    (_, Piece::UpdateAttributes(su)) => (Piece::Retain(1), Piece::UpdateAttributes(su)),
                    _ => (Piece::Retain(n), Piece::Retain(n)),
                };
                self.client_out.push(Segment::new(client_piece, client_annotations));
                self.server_out.push(Segment::new(server_piece, server_annotations));
            }
        }

        Ok(())
    }
}

fn track_deletion(depth: usize, piece: &Piece) -> usize {
    match piece {
        Piece::DeleteElementStart(..) => depth + 1,
        Piece::DeleteElementEnd => depth.saturating_sub(1),
        _ => depth,
    }
}

/// Rewrite a deletion so it describes the content as left by `other`, a
/// concurrent retain or attribute update over the same items
fn deletion_after(deletion: Segment, other: &Segment) -> Segment {
    let mut annotations: BTreeMap<String, ValueChange> = BTreeMap::new();
    for (key, change) in &deletion.annotations {
        if let Some(old) = &change.old {
            annotations.insert(key.clone(), ValueChange::new(Some(old), None));
        }
    }
    for (key, change) in &other.annotations {
        match &change.new {
            Some(new) => {
                annotations.insert(key.clone(), ValueChange::new(Some(new), None));
            }
            None => {
                annotations.remove(key);
            }
        }
    }

    let piece = match (deletion.piece, &other.piece) {
        (Piece::DeleteElementStart(tag, mut attributes), Piece::UpdateAttributes(update)) => {
            for (name, change) in update {
                match &change.new {
                    Some(value) => {
                        attributes.insert(name.clone(), value.clone());
                    }
                    None => {
                        attributes.remove(name);
                    }
                }
            }
            Piece::DeleteElementStart(tag, attributes)
        }
        (piece, _) => piece,
    };

    Segment::new(piece, annotations)
}

/// Transform two concurrent key/value change maps over the same item
///
/// Keys changed by only one side pass through. For keys both sides change
/// the left side wins: its change is rebased onto the right side's value and
/// the right side's change is dropped.
pub(crate) fn transform_changes(
    left: &AnnotationChanges,
    right: &AnnotationChanges,
) -> (AnnotationChanges, AnnotationChanges) {
    let left_out = left
        .iter()
        .map(|(key, change)| match right.get(key) {
            Some(theirs) => (
                key.clone(),
                ValueChange {
                    old: theirs.new.clone(),
                    new: change.new.clone(),
                },
            ),
            None => (key.clone(), change.clone()),
        })
        .collect();
    let right_out = right
        .iter()
        .filter(|(key, _)| !left.contains_key(*key))
        .map(|(key, change)| (key.clone(), change.clone()))
        .collect();
    (left_out, right_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::ot::operation::Attributes;
    use crate::ot::OperationBuilder;

    fn doc(text: &str) -> Document {
        let mut builder = OperationBuilder::new();
        builder.insert_characters(text);
        Document::from_operation(&builder.build()).unwrap()
    }

    fn converge(doc: &Document, client: &Operation, server: &Operation) -> Document {
        let pair = transform(client, server).unwrap();
        let left = doc.apply(server).unwrap().apply(&pair.client).unwrap();
        let right = doc.apply(client).unwrap().apply(&pair.server).unwrap();
        assert_eq!(left, right);
        left
    }

    #[test]
    fn test_concurrent_inserts_left_wins() {
        let base = doc("AB");
        let mut c = OperationBuilder::new();
        c.retain(1).insert_characters("X").retain(1);
        let mut s = OperationBuilder::new();
        s.retain(1).insert_characters("Y").retain(1);

        assert_eq!(converge(&base, &c.build(), &s.build()).text(), "AXYB");
    }

    #[test]
    fn test_insert_against_delete() {
        let base = doc("abcd");
        let mut c = OperationBuilder::new();
        c.retain(2).insert_characters("X").retain(2);
        let mut s = OperationBuilder::new();
        s.retain(1).delete_characters("bc").retain(1);

        assert_eq!(converge(&base, &c.build(), &s.build()).text(), "aXd");
    }

    #[test]
    fn test_overlapping_deletes() {
        let base = doc("abcdef");
        let mut c = OperationBuilder::new();
        c.retain(1).delete_characters("bcd").retain(2);
        let mut s = OperationBuilder::new();
        s.retain(2).delete_characters("cde").retain(1);

        assert_eq!(converge(&base, &c.build(), &s.build()).text(), "af");
    }

    #[test]
    fn test_insert_inside_deleted_element() {
        let mut b = OperationBuilder::new();
        b.insert_element_start("p", Attributes::new())
            .insert_characters("ab")
            .insert_element_end()
            .insert_characters("z");
        let base = Document::from_operation(&b.build()).unwrap();

        let mut c = OperationBuilder::new();
        c.retain(2).insert_characters("X").retain(3);
        let mut s = OperationBuilder::new();
        s.delete_element_start("p", Attributes::new())
            .delete_characters("ab")
            .delete_element_end()
            .retain(1);

        assert_eq!(converge(&base, &c.build(), &s.build()).text(), "z");
    }

    #[test]
    fn test_conflicting_annotations_left_wins() {
        let base = doc("abc");
        let mut c = OperationBuilder::new();
        c.start_annotation("color", None, Some("red"))
            .retain(2)
            .end_annotation("color")
            .retain(1);
        let mut s = OperationBuilder::new();
        s.retain(1)
            .start_annotation("color", None, Some("blue"))
            .retain(2)
            .end_annotation("color");

        let result = converge(&base, &c.build(), &s.build());
        let colors: Vec<_> = result
            .items()
            .iter()
            .map(|item| item.annotations.get("color").cloned())
            .collect();
        assert_eq!(
            colors,
            vec![Some("red".into()), Some("red".into()), Some("blue".into())]
        );
    }

    #[test]
    fn test_conflicting_attribute_updates() {
        let mut b = OperationBuilder::new();
        b.insert_element_start("p", Attributes::new()).insert_element_end();
        let base = Document::from_operation(&b.build()).unwrap();

        let mut c = OperationBuilder::new();
        c.update_attribute("align", None, Some("left")).retain(1);
        let mut s = OperationBuilder::new();
        s.update_attribute("align", None, Some("right")).retain(1);

        let result = converge(&base, &c.build(), &s.build());
        assert_eq!(result.to_xml(), "<p align=\"left\"></p>");
    }

    #[test]
    fn test_delete_against_annotation_change() {
        let base = doc("abc");
        let mut c = OperationBuilder::new();
        c.retain(1).delete_characters("b").retain(1);
        let mut s = OperationBuilder::new();
        s.start_annotation("bold", None, Some("t"))
            .retain(3)
            .end_annotation("bold");

        let result = converge(&base, &c.build(), &s.build());
        assert_eq!(result.text(), "ac");
    }

    #[test]
    fn test_identity_transform() {
        let base = doc("abc");
        let mut c = OperationBuilder::new();
        c.retain(1).insert_characters("X").delete_characters("b").retain(1);
        let client = c.build();

        let pair = transform(&client, &Operation::identity(3)).unwrap();
        assert_eq!(pair.client, client);
        assert!(pair.server.is_noop());
        assert_eq!(
            base.apply(&client).unwrap(),
            base.apply(&pair.client).unwrap()
        );
    }

    #[test]
    fn test_mismatched_extents() {
        let err = transform(&Operation::identity(2), &Operation::identity(3)).unwrap_err();
        assert!(matches!(err, SyncError::TransformIncompatible(_)));
    }

    #[test]
    fn test_content_disagreement() {
        let mut c = OperationBuilder::new();
        c.delete_characters("a");
        let mut s = OperationBuilder::new();
        s.delete_element_start("p", Attributes::new());

        assert!(matches!(
            transform(&c.build(), &s.build()),
            Err(SyncError::TransformIncompatible(_))
        ));
    }
}
