//! Object-graph persistence over SQLite.
//!
//! Stores arbitrary, possibly cyclic, polymorphic graphs of
//! [`relstash_core`] objects in normalized tables (one table per class level,
//! joined by a shared surrogate id), rebuilds equivalent graphs on load, and
//! reclaims rows that are no longer reachable from any externally saved root.
//!
//! # Architecture
//!
//! - **Low-level bookkeeping**: name interning ([`names`]), the ownership
//!   edge table that replaces garbage collection ([`ownership`]), and the
//!   persisted class hierarchy ([`hierarchy`]).
//! - **Per-call state**: the identity map ([`cache`]) and the deferred-write
//!   buffer that breaks save-time cycles ([`delayed`]).
//! - **Orchestrators**: save, load, and delete walk the object graph
//!   depth-first inside one transaction, delegating arrays to the codec in
//!   [`array`].
//! - **Public surface**: [`Session`] implements the [`ObjectStore`] trait.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: StoredRef, the (table, id) address of a stored row
//! - [`config`]: StoreConfig and its environment loader
//! - [`dialect`]: per-database SQL keywords
//! - [`schema`]: migrations for bookkeeping tables and lazy class tables
//! - [`session`]: Session, the transactional entry point

pub mod array;
pub mod cache;
pub mod config;
mod context;
pub mod delayed;
pub mod delete;
pub mod dialect;
pub mod error;
pub mod filter;
pub mod hash;
pub mod hierarchy;
pub mod load;
pub mod names;
pub mod ownership;
pub mod save;
pub mod schema;
pub mod session;
pub mod traits;
pub mod types;
mod values;

// Re-export key types for ergonomic use.
pub use cache::SessionCache;
pub use config::StoreConfig;
pub use dialect::{Dialect, SqliteDialect};
pub use error::StorageError;
pub use filter::Filter;
pub use hash::fingerprint;
pub use hierarchy::ClassHierarchy;
pub use names::{NameMaps, Namespace};
pub use ownership::OwnershipEdge;
pub use session::Session;
pub use traits::ObjectStore;
pub use types::StoredRef;
