//! Tree-structured document model
//!
//! A document is a flat sequence of [`Item`]s: characters, element starts and
//! element ends. Element starts and ends nest like XML tags. Every item carries
//! an annotation map (style, link, ...), which is how formatting is stored.
//!
//! Documents are values. [`Document::apply`] returns a new document and
//! leaves the receiver untouched, so a failed apply never leaves a half-edited
//! replica behind.

use crate::error::{Result, SyncError};
use crate::ot::builder::Normalizer;
use crate::ot::operation::{AnnotationChanges, Attributes, Operation, ValueChange};
use crate::ot::segment::{segments, Piece, Segment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Annotation key to value for a single item
pub type Annotations = BTreeMap<String, String>;

/// What an item is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    Character(char),
    ElementStart { tag: String, attributes: Attributes },
    ElementEnd,
}

/// A single document position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: Annotations,
}

impl Item {
    pub fn character(ch: char) -> Self {
        Self {
            kind: ItemKind::Character(ch),
            annotations: Annotations::new(),
        }
    }

    pub fn element_start(tag: &str, attributes: Attributes) -> Self {
        Self {
            kind: ItemKind::ElementStart {
                tag: tag.to_string(),
                attributes,
            },
            annotations: Annotations::new(),
        }
    }

    pub fn element_end() -> Self {
        Self {
            kind: ItemKind::ElementEnd,
            annotations: Annotations::new(),
        }
    }
}

/// Something that consumes operations and keeps document state
///
/// Implemented by [`Document`]; editors that keep their own representation
/// implement it to receive the operations the sync layer produces.
pub trait DocumentSink {
    /// Apply an operation in place. On error the state is unchanged.
    fn consume(&mut self, op: &Operation) -> Result<()>;

    /// Number of items
    fn size(&self) -> usize;
}

/// A well-formed sequence of items
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    items: Vec<Item>,
}

impl Document {
    /// The empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from its items, checking element balance
    pub fn from_items(items: Vec<Item>) -> Result<Self> {
        check_balanced(&items)?;
        Ok(Self { items })
    }

    /// Build a document by applying an insert-only operation to the empty
    /// document
    pub fn from_operation(op: &Operation) -> Result<Self> {
        Self::new().apply(op)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The document as a single insert-only operation over the empty document
    pub fn to_operation(&self) -> Operation {
        let mut normalizer = Normalizer::new();
        for item in &self.items {
            let piece = match &item.kind {
                ItemKind::Character(ch) => Piece::InsertCharacters(ch.to_string()),
                ItemKind::ElementStart { tag, attributes } => {
                    Piece::InsertElementStart(tag.clone(), attributes.clone())
                }
                ItemKind::ElementEnd => Piece::InsertElementEnd,
            };
            let annotations = item
                .annotations
                .iter()
                .map(|(key, value)| (key.clone(), ValueChange::new(None, Some(value))))
                .collect();
            normalizer.push(Segment::new(piece, annotations));
        }
        normalizer.finish()
    }

    /// Concatenated character content, ignoring markup
    pub fn text(&self) -> String {
        self.items
            .iter()
            .filter_map(|item| match item.kind {
                ItemKind::Character(ch) => Some(ch),
                _ => None,
            })
            .collect()
    }

    /// XML rendering of the element structure. Annotations are not rendered.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let mut open = Vec::new();
        for item in &self.items {
            match &item.kind {
                ItemKind::Character(ch) => push_escaped(&mut out, *ch),
                ItemKind::ElementStart { tag, attributes } => {
                    out.push('<');
                    out.push_str(tag);
                    for (name, value) in attributes {
                        let _ = write!(out, " {}=\"", name);
                        value.chars().for_each(|ch| push_escaped(&mut out, ch));
                        out.push('"');
                    }
                    out.push('>');
                    open.push(tag.as_str());
                }
                ItemKind::ElementEnd => {
                    if let Some(tag) = open.pop() {
                        let _ = write!(out, "</{}>", tag);
                    }
                }
            }
        }
        out
    }

    /// Apply `op`, returning the resulting document
    ///
    /// # Errors
    ///
    /// - [`SyncError::SizeMismatch`] if the operation's base extent differs
    ///   from the document size
    /// - [`SyncError::SchemaViolation`] if the operation disagrees with the
    ///   content it walks over or would leave the document ill-formed
    ///
    /// # Example
    ///
    /// ```rust
    /// use wavesync_core::ot::OperationBuilder;
    /// use wavesync_core::Document;
    ///
    /// let mut builder = OperationBuilder::new();
    /// builder.insert_characters("hello");
    /// let doc = Document::new().apply(&builder.build()).unwrap();
    ///
    /// let mut builder = OperationBuilder::new();
    /// builder.retain(5).insert_characters("!");
    /// let doc = doc.apply(&builder.build()).unwrap();
    ///
    /// assert_eq!(doc.text(), "hello!");
    /// ```
    pub fn apply(&self, op: &Operation) -> Result<Document> {
        let expected = op.base_len();
        if expected != self.items.len() {
            return Err(SyncError::SizeMismatch {
                expected,
                actual: self.items.len(),
            });
        }

        let mut out = Vec::with_capacity(op.target_len());
        let mut source = self.items.iter();
        let mut insert_depth = 0usize;
        let mut delete_depth = 0usize;

        for Segment { piece, annotations } in segments(op)? {
            match piece {
                Piece::Retain(n) => {
                    check_outside(insert_depth, delete_depth, "retain")?;
                    for _ in 0..n {
                        let mut item = next_item(&mut source)?.clone();
                        change_annotations(&mut item, &annotations)?;
                        out.push(item);
                    }
                }
                Piece::InsertCharacters(text) => {
                    check_not_deleting(delete_depth, "insert")?;
                    for ch in text.chars() {
                        out.push(inserted(ItemKind::Character(ch), &annotations));
                    }
                }
                Piece::InsertElementStart(tag, attributes) => {
                    check_not_deleting(delete_depth, "insert")?;
                    insert_depth += 1;
                    out.push(inserted(ItemKind::ElementStart { tag, attributes }, &annotations));
                }
                Piece::InsertElementEnd => {
                    check_not_deleting(delete_depth, "insert")?;
                    if insert_depth == 0 {
                        return Err(SyncError::SchemaViolation(
                            "element end inserted without a matching inserted start".into(),
                        ));
                    }
                    insert_depth -= 1;
                    out.push(inserted(ItemKind::ElementEnd, &annotations));
                }
                Piece::DeleteCharacters(text) => {
                    check_not_inserting(insert_depth, "delete")?;
                    for ch in text.chars() {
                        let item = next_item(&mut source)?;
                        if item.kind != ItemKind::Character(ch) {
                            return Err(SyncError::SchemaViolation(format!(
                                "deleting '{}' but document has {:?}",
                                ch, item.kind
                            )));
                        }
                        check_deleted_annotations(item, &annotations)?;
                    }
                }
                Piece::DeleteElementStart(tag, attributes) => {
                    check_not_inserting(insert_depth, "delete")?;
                    let item = next_item(&mut source)?;
                    match &item.kind {
                        ItemKind::ElementStart {
                            tag: doc_tag,
                            attributes: doc_attributes,
                        } if *doc_tag == tag && *doc_attributes == attributes => {}
                        other => {
                            return Err(SyncError::SchemaViolation(format!(
                                "deleting element start <{}> but document has {:?}",
                                tag, other
                            )))
                        }
                    }
                    check_deleted_annotations(item, &annotations)?;
                    delete_depth += 1;
                }
                Piece::DeleteElementEnd => {
                    check_not_inserting(insert_depth, "delete")?;
                    if delete_depth == 0 {
                        return Err(SyncError::SchemaViolation(
                            "element end deleted without its start".into(),
                        ));
                    }
                    let item = next_item(&mut source)?;
                    if item.kind != ItemKind::ElementEnd {
                        return Err(SyncError::SchemaViolation(format!(
                            "deleting element end but document has {:?}",
                            item.kind
                        )));
                    }
                    check_deleted_annotations(item, &annotations)?;
                    delete_depth -= 1;
                }
                Piece::UpdateAttributes(update) => {
                    check_outside(insert_depth, delete_depth, "update attributes")?;
                    let mut item = next_item(&mut source)?.clone();
                    match &mut item.kind {
                        ItemKind::ElementStart { attributes, .. } => {
                            for (name, change) in &update {
                                if attributes.get(name) != change.old.as_ref() {
                                    return Err(SyncError::SchemaViolation(format!(
                                        "attribute '{}' expected {:?}, found {:?}",
                                        name,
                                        change.old,
                                        attributes.get(name)
                                    )));
                                }
                                set_value(attributes, name, change.new.as_ref());
                            }
                        }
                        other => {
                            return Err(SyncError::SchemaViolation(format!(
                                "attribute update on {:?}",
                                other
                            )))
                        }
                    }
                    change_annotations(&mut item, &annotations)?;
                    out.push(item);
                }
            }
        }

        if insert_depth != 0 || delete_depth != 0 {
            return Err(SyncError::SchemaViolation(
                "operation leaves an element insertion or deletion open".into(),
            ));
        }
        check_balanced(&out)?;

        Ok(Document { items: out })
    }
}

impl DocumentSink for Document {
    fn consume(&mut self, op: &Operation) -> Result<()> {
        *self = self.apply(op)?;
        Ok(())
    }

    fn size(&self) -> usize {
        self.len()
    }
}

fn next_item<'a>(source: &mut std::slice::Iter<'a, Item>) -> Result<&'a Item> {
    source
        .next()
        .ok_or_else(|| SyncError::SchemaViolation("operation walks past the end of the document".into()))
}

fn check_outside(insert_depth: usize, delete_depth: usize, what: &str) -> Result<()> {
    check_not_inserting(insert_depth, what)?;
    check_not_deleting(delete_depth, what)
}

fn check_not_inserting(insert_depth: usize, what: &str) -> Result<()> {
    if insert_depth > 0 {
        return Err(SyncError::SchemaViolation(format!(
            "{} inside an element being inserted",
            what
        )));
    }
    Ok(())
}

fn check_not_deleting(delete_depth: usize, what: &str) -> Result<()> {
    if delete_depth > 0 {
        return Err(SyncError::SchemaViolation(format!(
            "{} inside an element being deleted",
            what
        )));
    }
    Ok(())
}

fn inserted(kind: ItemKind, annotations: &AnnotationChanges) -> Item {
    Item {
        kind,
        annotations: annotations
            .iter()
            .filter_map(|(key, change)| change.new.clone().map(|value| (key.clone(), value)))
            .collect(),
    }
}

fn change_annotations(item: &mut Item, annotations: &AnnotationChanges) -> Result<()> {
    for (key, change) in annotations {
        if item.annotations.get(key) != change.old.as_ref() {
            return Err(SyncError::SchemaViolation(format!(
                "annotation '{}' expected {:?}, found {:?}",
                key,
                change.old,
                item.annotations.get(key)
            )));
        }
        set_value(&mut item.annotations, key, change.new.as_ref());
    }
    Ok(())
}

/// A deleted item must be described completely so the deletion can be undone
fn check_deleted_annotations(item: &Item, annotations: &AnnotationChanges) -> Result<()> {
    let described: Annotations = annotations
        .iter()
        .filter_map(|(key, change)| change.old.clone().map(|value| (key.clone(), value)))
        .collect();
    if described != item.annotations {
        return Err(SyncError::SchemaViolation(format!(
            "deleted item has annotations {:?}, operation describes {:?}",
            item.annotations, described
        )));
    }
    Ok(())
}

fn set_value(map: &mut BTreeMap<String, String>, key: &str, value: Option<&String>) {
    match value {
        Some(value) => {
            map.insert(key.to_string(), value.clone());
        }
        None => {
            map.remove(key);
        }
    }
}

fn check_balanced(items: &[Item]) -> Result<()> {
    let mut depth = 0usize;
    for item in items {
        match item.kind {
            ItemKind::ElementStart { .. } => depth += 1,
            ItemKind::ElementEnd => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    SyncError::SchemaViolation("element end without a start".into())
                })?;
            }
            ItemKind::Character(_) => {}
        }
    }
    if depth != 0 {
        return Err(SyncError::SchemaViolation(format!(
            "{} element(s) left open",
            depth
        )));
    }
    Ok(())
}

fn push_escaped(out: &mut String, ch: char) {
    match ch {
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '&' => out.push_str("&amp;"),
        '"' => out.push_str("&quot;"),
        other => out.push(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::OperationBuilder;

    fn paragraph(text: &str) -> Document {
        let mut builder = OperationBuilder::new();
        builder
            .insert_element_start("p", Attributes::new())
            .insert_characters(text)
            .insert_element_end();
        Document::from_operation(&builder.build()).unwrap()
    }

    #[test]
    fn test_from_operation() {
        let doc = paragraph("hi");
        assert_eq!(doc.len(), 4);
        assert_eq!(doc.text(), "hi");
        assert_eq!(doc.to_xml(), "<p>hi</p>");
    }

    #[test]
    fn test_to_operation_round_trip() {
        let mut builder = OperationBuilder::new();
        builder
            .insert_element_start("p", Attributes::from([("id".to_string(), "7".to_string())]))
            .start_annotation("bold", None, Some("true"))
            .insert_characters("ab")
            .end_annotation("bold")
            .insert_characters("c")
            .insert_element_end();
        let doc = Document::from_operation(&builder.build()).unwrap();

        assert_eq!(Document::from_operation(&doc.to_operation()).unwrap(), doc);
        assert_eq!(doc.items()[1].annotations.get("bold").map(String::as_str), Some("true"));
        assert!(doc.items()[3].annotations.is_empty());
    }

    #[test]
    fn test_size_mismatch() {
        let doc = paragraph("hi");
        let err = doc.apply(&Operation::identity(3)).unwrap_err();
        assert_eq!(
            err,
            SyncError::SizeMismatch {
                expected: 3,
                actual: 4
            }
        );
    }

    #[test]
    fn test_delete_content_must_match() {
        let doc = paragraph("hi");
        let mut builder = OperationBuilder::new();
        builder.retain(1).delete_characters("hx").retain(1);

        assert!(matches!(
            doc.apply(&builder.build()),
            Err(SyncError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_delete_whole_element() {
        let doc = paragraph("hi");
        let mut builder = OperationBuilder::new();
        builder
            .delete_element_start("p", Attributes::new())
            .delete_characters("hi")
            .delete_element_end();

        assert!(doc.apply(&builder.build()).unwrap().is_empty());
    }

    #[test]
    fn test_unbalanced_delete_rejected() {
        let doc = paragraph("hi");
        let mut builder = OperationBuilder::new();
        builder
            .delete_element_start("p", Attributes::new())
            .retain(3);

        assert!(matches!(
            doc.apply(&builder.build()),
            Err(SyncError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_insert_element_end_without_start() {
        let doc = paragraph("");
        let mut builder = OperationBuilder::new();
        builder.retain(1).insert_element_end().retain(1);

        assert!(matches!(
            doc.apply(&builder.build()),
            Err(SyncError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_update_attributes() {
        let doc = paragraph("x");
        let mut builder = OperationBuilder::new();
        builder.update_attribute("align", None, Some("left")).retain(2);
        let doc = doc.apply(&builder.build()).unwrap();
        assert_eq!(doc.to_xml(), "<p align=\"left\">x</p>");

        // Stale old value
        let mut builder = OperationBuilder::new();
        builder.update_attribute("align", Some("right"), None).retain(2);
        assert!(matches!(
            doc.apply(&builder.build()),
            Err(SyncError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_annotation_changes() {
        let doc = paragraph("abc");
        let mut builder = OperationBuilder::new();
        builder
            .retain(2)
            .start_annotation("link", None, Some("http://a"))
            .retain(1)
            .end_annotation("link")
            .retain(2);
        let doc = doc.apply(&builder.build()).unwrap();
        assert_eq!(
            doc.items()[2].annotations.get("link").map(String::as_str),
            Some("http://a")
        );

        // Deleting an annotated character must describe the annotation
        let mut builder = OperationBuilder::new();
        builder.retain(2).delete_characters("b").retain(2);
        assert!(doc.apply(&builder.build()).is_err());

        let mut builder = OperationBuilder::new();
        builder
            .retain(2)
            .start_annotation("link", Some("http://a"), None)
            .delete_characters("b")
            .end_annotation("link")
            .retain(2);
        assert_eq!(doc.apply(&builder.build()).unwrap().text(), "ac");
    }

    #[test]
    fn test_failed_apply_leaves_sink_untouched() {
        let mut doc = paragraph("ab");
        let before = doc.clone();
        let mut builder = OperationBuilder::new();
        builder.retain(1).delete_characters("zz").retain(1);

        assert!(doc.consume(&builder.build()).is_err());
        assert_eq!(doc, before);
    }

    #[test]
    fn test_xml_escaping() {
        let doc = paragraph("a<b");
        assert_eq!(doc.to_xml(), "<p>a&lt;b</p>");
    }
}
