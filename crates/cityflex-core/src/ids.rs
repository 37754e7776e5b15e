use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_ENTITY_ID: AtomicUsize = AtomicUsize::new(1);

/// Identifier of an entity in a district hierarchy.
///
/// Ids handed out by [`EntityId::allocate`] are unique for the lifetime of the
/// process, so entities built independently can be combined later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(usize);

impl EntityId {
    #[inline]
    pub fn new(value: usize) -> Self {
        EntityId(value)
    }

    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }

    /// Take the next free id from the process-wide counter.
    pub fn allocate() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_are_distinct() {
        let a = EntityId::allocate();
        let b = EntityId::allocate();
        assert_ne!(a, b);
        assert!(b.value() > a.value());
    }

    #[test]
    fn display_is_zero_padded() {
        assert_eq!(EntityId::new(42).to_string(), "00042");
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&EntityId::new(3)).unwrap();
        assert_eq!(json, "3");
    }
}
