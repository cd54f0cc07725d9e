//! Storage-layer addressing.
//!
//! A stored object is identified by the table of its concrete class and its
//! surrogate id. Arrays live in the array entity table. Ids are drawn from the
//! root table's identity column, so they are unique across all tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::ARRAY_TABLE;

/// Address of a stored object or array: `(table, surrogate id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredRef {
    pub table: String,
    pub id: i64,
}

impl StoredRef {
    pub fn new(table: impl Into<String>, id: i64) -> Self {
        StoredRef {
            table: table.into(),
            id,
        }
    }

    pub fn array(id: i64) -> Self {
        StoredRef::new(ARRAY_TABLE, id)
    }

    pub fn is_array(&self) -> bool {
        self.table == ARRAY_TABLE
    }
}

impl fmt::Display for StoredRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}
