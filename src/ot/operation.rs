//! Operation: the value type for a document mutation
//!
//! An [`Operation`] is an immutable sequence of [`Component`]s walked left to
//! right over a document. Retains and deletions consume items of the document
//! the operation is defined over (its *base extent*); retains and insertions
//! produce items of the resulting document (its *target extent*).
//!
//! # Example
//!
//! ```rust
//! use wavesync_core::ot::{Component, Operation};
//!
//! // "AB" -> "AXB"
//! let op = Operation::from_components(vec![
//!     Component::Retain(1),
//!     Component::InsertCharacters("X".to_string()),
//!     Component::Retain(1),
//! ]);
//!
//! assert_eq!(op.base_len(), 2);
//! assert_eq!(op.target_len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attributes of an element start
pub type Attributes = BTreeMap<String, String>;

/// Attribute name to old/new value, applied to a single element start
pub type AttributesUpdate = BTreeMap<String, ValueChange>;

/// Annotation key to old/new value, as carried by an annotation boundary
pub type AnnotationChanges = BTreeMap<String, ValueChange>;

/// A change of a single keyed value. `None` means "absent".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

impl ValueChange {
    pub fn new(old: Option<&str>, new: Option<&str>) -> Self {
        Self {
            old: old.map(str::to_string),
            new: new.map(str::to_string),
        }
    }

    /// The change that undoes this one
    pub fn reversed(&self) -> Self {
        Self {
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }
}

/// Opens, changes or closes annotation keys for the components that follow it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationBoundary {
    /// Keys whose changes stop applying at this point
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ends: BTreeSet<String>,

    /// Keys whose changes start (or are replaced) at this point
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: AnnotationChanges,
}

impl AnnotationBoundary {
    pub fn is_empty(&self) -> bool {
        self.ends.is_empty() && self.changes.is_empty()
    }

    /// Boundary that opens a single key
    pub fn change(key: &str, old: Option<&str>, new: Option<&str>) -> Self {
        let mut changes = AnnotationChanges::new();
        changes.insert(key.to_string(), ValueChange::new(old, new));
        Self {
            ends: BTreeSet::new(),
            changes,
        }
    }

    /// Boundary that closes the given keys
    pub fn end<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ends: keys.into_iter().map(Into::into).collect(),
            changes: AnnotationChanges::new(),
        }
    }
}

/// One step of an operation
///
/// This is a closed sum type: every algorithm over operations matches it
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Component {
    /// Skip over `n` items, keeping them
    Retain(usize),

    /// Insert characters at the cursor
    InsertCharacters(String),

    /// Insert an element start at the cursor
    InsertElementStart { tag: String, attributes: Attributes },

    /// Insert the end of the most recently inserted open element
    InsertElementEnd,

    /// Delete characters; the text must match the document
    DeleteCharacters(String),

    /// Delete an element start; tag and attributes must match the document
    DeleteElementStart { tag: String, attributes: Attributes },

    /// Delete the end of the element whose start this operation deleted
    DeleteElementEnd,

    /// Change attributes of the element start under the cursor
    UpdateAttributes(AttributesUpdate),

    /// Change which annotation updates apply to subsequent items
    AnnotationBoundary(AnnotationBoundary),
}

impl Component {
    /// Number of document items this component consumes
    pub fn base_len(&self) -> usize {
        match self {
            Component::Retain(n) => *n,
            Component::DeleteCharacters(text) => text.chars().count(),
            Component::DeleteElementStart { .. }
            | Component::DeleteElementEnd
            | Component::UpdateAttributes(_) => 1,
            Component::InsertCharacters(_)
            | Component::InsertElementStart { .. }
            | Component::InsertElementEnd
            | Component::AnnotationBoundary(_) => 0,
        }
    }

    /// Number of document items this component produces
    pub fn target_len(&self) -> usize {
        match self {
            Component::Retain(n) => *n,
            Component::InsertCharacters(text) => text.chars().count(),
            Component::InsertElementStart { .. }
            | Component::InsertElementEnd
            | Component::UpdateAttributes(_) => 1,
            Component::DeleteCharacters(_)
            | Component::DeleteElementStart { .. }
            | Component::DeleteElementEnd
            | Component::AnnotationBoundary(_) => 0,
        }
    }
}

/// An immutable document mutation
///
/// Equality is structural (component by component). Operations produced by
/// [`transform`](crate::ot::transform), [`compose`](crate::ot::compose),
/// [`invert`](crate::ot::invert) and
/// [`OperationBuilder`](crate::ot::OperationBuilder) are normalized, so two
/// such operations with the same effect compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation {
    components: Vec<Component>,
}

impl Operation {
    /// Wrap a raw component list. No normalization or validation happens here;
    /// malformed operations are rejected when applied or transformed.
    pub fn from_components(components: Vec<Component>) -> Self {
        Self { components }
    }

    /// The operation that keeps a document of `len` items unchanged
    pub fn identity(len: usize) -> Self {
        if len == 0 {
            return Self::default();
        }
        Self {
            components: vec![Component::Retain(len)],
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Component> {
        self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Size of the document region this operation is defined over
    pub fn base_len(&self) -> usize {
        self.components.iter().map(Component::base_len).sum()
    }

    /// Size of the document this operation produces
    pub fn target_len(&self) -> usize {
        self.components.iter().map(Component::target_len).sum()
    }

    /// True when the operation only retains (annotation boundaries that change
    /// nothing included)
    pub fn is_noop(&self) -> bool {
        self.components.iter().all(|component| match component {
            Component::Retain(_) => true,
            Component::AnnotationBoundary(boundary) => {
                boundary.changes.values().all(|change| change.old == change.new)
            }
            Component::UpdateAttributes(update) => {
                update.values().all(|change| change.old == change.new)
            }
            _ => false,
        })
    }
}

/// Output of [`transform`](crate::ot::transform)
///
/// `client` applies after the server operation; `server` applies after the
/// client operation. Both orders reach the same document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPair {
    pub client: Operation,
    pub server: Operation,
}

impl OperationPair {
    pub fn new(client: Operation, server: Operation) -> Self {
        Self { client, server }
    }

    pub fn into_tuple(self) -> (Operation, Operation) {
        (self.client, self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extents() {
        let mut attrs = Attributes::new();
        attrs.insert("id".into(), "1".into());

        let op = Operation::from_components(vec![
            Component::Retain(2),
            Component::InsertElementStart {
                tag: "p".into(),
                attributes: attrs.clone(),
            },
            Component::InsertCharacters("héllo".into()),
            Component::InsertElementEnd,
            Component::DeleteCharacters("ab".into()),
            Component::DeleteElementStart {
                tag: "b".into(),
                attributes: Attributes::new(),
            },
            Component::DeleteElementEnd,
        ]);

        assert_eq!(op.base_len(), 6);
        assert_eq!(op.target_len(), 9);
    }

    #[test]
    fn test_is_noop() {
        assert!(Operation::identity(5).is_noop());
        assert!(Operation::default().is_noop());

        let op = Operation::from_components(vec![
            Component::AnnotationBoundary(AnnotationBoundary::change("bold", None, Some("true"))),
            Component::Retain(3),
            Component::AnnotationBoundary(AnnotationBoundary::end(["bold"])),
        ]);
        assert!(!op.is_noop());
    }

    #[test]
    fn test_component_serialization() {
        let op = Operation::from_components(vec![
            Component::Retain(1),
            Component::InsertCharacters("X".into()),
            Component::InsertElementEnd,
        ]);

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"retain": 1}, {"insertCharacters": "X"}, "insertElementEnd"])
        );

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_value_change_reversed() {
        let change = ValueChange::new(Some("a"), None);
        assert_eq!(change.reversed(), ValueChange::new(None, Some("a")));
    }
}
