//! Per-database SQL keywords.
//!
//! The orchestrators assemble their own SQL; the [`Dialect`] only supplies
//! the handful of fragments that differ between engines.

/// SQL fragments that vary by database engine.
pub trait Dialect {
    /// Short engine name, for logging.
    fn name(&self) -> &'static str;

    /// Column definition for the root table's identity column.
    fn identity_column(&self) -> &'static str;

    /// Largest number of values allowed in one `IN (...)` list.
    fn max_in_list(&self) -> usize;

    /// Quotes an identifier.
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Row-window clause appended to a `SELECT`.
    fn limit_offset(&self, limit: usize, offset: usize) -> String {
        format!("LIMIT {limit} OFFSET {offset}")
    }
}

/// SQLite dialect: native `AUTOINCREMENT` identity, 999 bound parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn identity_column(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }

    fn max_in_list(&self) -> usize {
        999
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(SqliteDialect.quote("Person"), "\"Person\"");
        assert_eq!(SqliteDialect.quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn limit_offset_clause() {
        assert_eq!(SqliteDialect.limit_offset(10, 20), "LIMIT 10 OFFSET 20");
    }
}
