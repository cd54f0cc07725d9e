//! Stable handle type for arena-resident objects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle of a node in an [`ObjectGraph`](crate::ObjectGraph).
///
/// Two values referencing the same `ObjectId` reference the same instance.
/// The storage layer uses the handle as its per-transaction correlation tag,
/// so identity is decided by handle equality rather than by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_display() {
        assert_eq!(format!("{}", ObjectId(7)), "7");
    }

    #[test]
    fn serde_roundtrip() {
        let id = ObjectId(42);
        let json = serde_json::to_string(&id).unwrap();
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
