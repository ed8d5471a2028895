//! Operational transformation over tree-structured documents
//!
//! - [`Operation`] / [`Component`]: the mutation value type
//! - [`OperationBuilder`]: normalized construction
//! - [`transform`]: reconcile two concurrent operations
//! - [`compose`] / [`compose_pair`]: merge sequential operations
//! - [`invert`]: undo an operation
//!
//! All functions are pure over immutable values and safe to call from any
//! thread.

pub(crate) mod builder;
mod compose;
mod invert;
pub mod operation;
pub(crate) mod segment;
mod transform;


pub use builder::OperationBuilder;
pub use compose::{compose, compose_pair};
pub use invert::invert;
pub use operation::{
    AnnotationBoundary, AnnotationChanges, Attributes, AttributesUpdate, Component, Operation,
    OperationPair, ValueChange,
};
pub use transform::transform;

use crate::error::Result;

/// Rewrite `op` in canonical form
///
/// # Errors
///
/// [`SchemaViolation`](crate::SyncError::SchemaViolation) if an annotation
/// boundary ends a key that is not open.
pub fn normalize(op: &Operation) -> Result<Operation> {
    let mut normalizer = builder::Normalizer::new();
    for segment in segment::segments(op)? {
        normalizer.push(segment);
    }
    Ok(normalizer.finish())
}
