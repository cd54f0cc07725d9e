//! Row predicates for bulk operations.
//!
//! A [`Filter`] is a `WHERE` clause fragment over the columns of one class
//! table plus its bound values. Clause compilation from a query language is
//! left to callers; this is the shape bulk deletes consume.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use relstash_core::Value;

use crate::dialect::Dialect;
use crate::error::StorageError;
use crate::values::encode_untyped;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    clause: String,
    params: Vec<Value>,
}

impl Filter {
    /// Matches every row.
    pub fn all() -> Self {
        Filter {
            clause: "1 = 1".to_string(),
            params: Vec::new(),
        }
    }

    /// `column = value`, or `column IS NULL` for a null value.
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let quoted = format!("\"{}\"", column.replace('"', "\"\""));
        if value.is_null() {
            return Filter {
                clause: format!("{quoted} IS NULL"),
                params: Vec::new(),
            };
        }
        Filter {
            clause: format!("{quoted} = ?"),
            params: vec![value],
        }
    }

    /// A raw clause with `?` placeholders bound to `params` in order.
    pub fn raw(clause: impl Into<String>, params: Vec<Value>) -> Self {
        Filter {
            clause: clause.into(),
            params,
        }
    }

    /// Both filters must match.
    pub fn and(self, other: Filter) -> Self {
        let mut params = self.params;
        params.extend(other.params);
        Filter {
            clause: format!("({}) AND ({})", self.clause, other.clause),
            params,
        }
    }

    pub fn clause(&self) -> &str {
        &self.clause
    }

    pub(crate) fn sql_params(&self) -> Result<Vec<SqlValue>, StorageError> {
        self.params.iter().map(encode_untyped).collect()
    }

    /// `SELECT ID FROM table WHERE clause ORDER BY ID`.
    pub(crate) fn select_ids_sql(&self, dialect: &dyn Dialect, table: &str) -> String {
        format!(
            "SELECT {id} FROM {table} WHERE {clause} ORDER BY {id}",
            id = dialect.quote("ID"),
            table = dialect.quote(table),
            clause = self.clause
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;

    #[test]
    fn eq_binds_value_and_handles_null() {
        let f = Filter::eq("age", 30);
        assert_eq!(f.clause(), "\"age\" = ?");
        assert_eq!(f.sql_params().unwrap(), vec![SqlValue::Integer(30)]);

        let f = Filter::eq("name", Value::Null);
        assert_eq!(f.clause(), "\"name\" IS NULL");
        assert!(f.sql_params().unwrap().is_empty());
    }

    #[test]
    fn and_concatenates_params() {
        let f = Filter::eq("age", 30).and(Filter::raw("\"name\" LIKE ?", vec!["A%".into()]));
        assert_eq!(f.clause(), "(\"age\" = ?) AND (\"name\" LIKE ?)");
        assert_eq!(f.sql_params().unwrap().len(), 2);
    }

    #[test]
    fn select_sql_orders_by_id() {
        assert_eq!(
            Filter::all().select_ids_sql(&SqliteDialect, "Person"),
            "SELECT \"ID\" FROM \"Person\" WHERE 1 = 1 ORDER BY \"ID\""
        );
    }
}
