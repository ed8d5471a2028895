//! Append-only delta history

use super::delta::Delta;
use super::version::HashedVersion;
use crate::error::{Result, SyncError};
use std::collections::HashMap;

/// Storage for the committed deltas of one document
///
/// Implementations must be append-only: once a delta is stored at a version
/// it never changes.
pub trait DeltaHistory {
    /// Version after the last committed delta
    fn current_version(&self) -> HashedVersion;

    /// The delta whose base is version number `version`, if committed
    fn delta_starting_at(&self, version: u64) -> Option<Delta>;

    /// Whether `version` (number and hash) is a point in this history
    fn has_signature(&self, version: &HashedVersion) -> bool;

    /// Append a delta whose base is the current version
    fn append(&mut self, delta: Delta) -> Result<()>;

    /// All deltas after `version`, oldest first
    fn deltas_since(&self, version: &HashedVersion) -> Result<Vec<Delta>> {
        if !self.has_signature(version) {
            return Err(SyncError::StaleOrUnknownVersion(version.clone()));
        }
        let current = self.current_version().version();
        let mut out = Vec::new();
        for v in version.version()..current {
            let delta = self
                .delta_starting_at(v)
                .ok_or_else(|| SyncError::StaleOrUnknownVersion(HashedVersion::unsigned(v)))?;
            out.push(delta);
        }
        Ok(out)
    }
}

/// History kept in memory
#[derive(Debug, Clone)]
pub struct InMemoryDeltaHistory {
    initial: HashedVersion,
    deltas: Vec<Delta>,
    /// Version number to hash for every version in the history
    signatures: HashMap<u64, Vec<u8>>,
}

impl InMemoryDeltaHistory {
    /// An empty history starting at `initial`
    pub fn new(initial: HashedVersion) -> Self {
        let mut signatures = HashMap::new();
        signatures.insert(initial.version(), initial.hash().to_vec());
        Self {
            initial,
            deltas: Vec::new(),
            signatures,
        }
    }

    /// An empty history for a new document, starting at its version zero
    pub fn for_document(document_id: &str) -> Self {
        Self::new(HashedVersion::version_zero(document_id))
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

impl DeltaHistory for InMemoryDeltaHistory {
    fn current_version(&self) -> HashedVersion {
        self.deltas
            .last()
            .map(|delta| delta.resulting_version.clone())
            .unwrap_or_else(|| self.initial.clone())
    }

    fn delta_starting_at(&self, version: u64) -> Option<Delta> {
        let index = version.checked_sub(self.initial.version())?;
        self.deltas.get(usize::try_from(index).ok()?).cloned()
    }

    fn has_signature(&self, version: &HashedVersion) -> bool {
        self.signatures
            .get(&version.version())
            .is_some_and(|hash| hash.as_slice() == version.hash())
    }

    fn append(&mut self, delta: Delta) -> Result<()> {
        let current = self.current_version();
        if delta.base_version != current {
            return Err(SyncError::StaleOrUnknownVersion(delta.base_version.clone()));
        }
        if delta.resulting_version.version() != current.version() + 1 {
            return Err(SyncError::InvalidVersion(format!(
                "delta at {} claims to produce {}",
                current, delta.resulting_version
            )));
        }
        self.signatures.insert(
            delta.resulting_version.version(),
            delta.resulting_version.hash().to_vec(),
        );
        self.deltas.push(delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Operation;
    use crate::sync::delta::DeltaId;

    fn delta_on(base: HashedVersion) -> Delta {
        Delta::commit(DeltaId::new(), "a".into(), 0, base, Operation::identity(0)).unwrap()
    }

    #[test]
    fn test_append_and_catch_up() {
        let mut history = InMemoryDeltaHistory::for_document("doc");
        let v0 = history.current_version();

        let first = delta_on(v0.clone());
        history.append(first.clone()).unwrap();
        let second = delta_on(history.current_version());
        history.append(second.clone()).unwrap();

        assert_eq!(history.current_version().version(), 2);
        assert_eq!(history.delta_starting_at(1), Some(second.clone()));
        assert_eq!(history.deltas_since(&v0).unwrap(), vec![first.clone(), second]);
        assert!(history.deltas_since(&history.current_version()).unwrap().is_empty());
        assert!(history.has_signature(&first.resulting_version));
    }

    #[test]
    fn test_rejects_non_current_base() {
        let mut history = InMemoryDeltaHistory::for_document("doc");
        let v0 = history.current_version();
        history.append(delta_on(v0.clone())).unwrap();

        assert!(matches!(
            history.append(delta_on(v0)),
            Err(SyncError::StaleOrUnknownVersion(_))
        ));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_unknown_signature() {
        let history = InMemoryDeltaHistory::for_document("doc");
        let forged = HashedVersion::new(0, vec![0; 20]);

        assert!(!history.has_signature(&forged));
        assert!(matches!(
            history.deltas_since(&forged),
            Err(SyncError::StaleOrUnknownVersion(_))
        ));
    }
}
