//! Entity identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dense slot index of an entity inside the registry.
pub type EntityId = u32;

/// Search key id reserved for the built-in simple count detector.
pub const SIMPLE_COUNT_KEY_ID: u32 = 0;

/// Identifies one modelled time series: the detector that produced it and
/// the partition value it was split on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub search_key_id: u32,
    pub partition: String,
}

impl EntityKey {
    pub fn new(search_key_id: u32, partition: impl Into<String>) -> Self {
        Self {
            search_key_id,
            partition: partition.into(),
        }
    }

    pub fn simple_count() -> Self {
        Self::new(SIMPLE_COUNT_KEY_ID, "")
    }

    pub fn is_simple_count(&self) -> bool {
        self.search_key_id == SIMPLE_COUNT_KEY_ID
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.partition.len()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.partition.is_empty() {
            write!(f, "{}", self.search_key_id)
        } else {
            write!(f, "{}/{}", self.search_key_id, self.partition)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_order() {
        let a = EntityKey::new(1, "x");
        let b = EntityKey::new(1, "y");
        assert!(a < b);
        assert_eq!(a.to_string(), "1/x");
        assert_eq!(EntityKey::simple_count().to_string(), "0");
        assert!(EntityKey::simple_count().is_simple_count());
    }
}
