//! relstash store inspection CLI.
//!
//! Provides the `relstash` binary for looking inside a store file written by
//! [`relstash_storage::Session`]: bookkeeping row counts, the persisted class
//! hierarchy, ownership edges, JSON dumps of stored object graphs, and a
//! garbage sweep.
//!
//! Commands that materialize objects (`show`, `gc`) need the class
//! descriptors the store was written with, passed as a JSON-serialized
//! [`ClassRegistry`] via `--registry`.
//!
//! Store options come from the environment, see
//! [`StoreConfig::from_env`](relstash_storage::StoreConfig::from_env).

use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relstash_core::ClassRegistry;
use relstash_storage::{ObjectStore, Session, StorageError, StoreConfig};

/// Inspect and maintain relstash object stores.
#[derive(Parser)]
#[command(name = "relstash", about = "Inspect and maintain relstash object stores")]
struct Cli {
    /// Path to the store database file.
    #[arg(short, long, env = "RELSTASH_DB_PATH", default_value = "relstash.db")]
    db: String,

    /// JSON file holding the class registry the store was written with.
    #[arg(short, long, env = "RELSTASH_REGISTRY")]
    registry: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Row counts of the bookkeeping tables and the root table.
    Stats,

    /// The persisted class hierarchy as superclass -> subclass edges.
    Classes,

    /// Ownership edges as JSON.
    Edges {
        /// Only edges whose owner or property has this id.
        #[arg(long)]
        id: Option<i64>,
    },

    /// Load an object and print everything reachable from it as JSON.
    Show {
        /// Class to load through (any supertype of the stored class works).
        class: String,

        /// Surrogate id of the object.
        id: i64,
    },

    /// Destroy every stored object no external anchor reaches.
    Gc,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = run(&cli);
    process::exit(exit_code);
}

/// Executes one subcommand. Returns the process exit code: 0 = success,
/// 1 = any error.
fn run(cli: &Cli) -> i32 {
    let registry = match load_registry(cli.registry.as_deref()) {
        Ok(registry) => registry,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return 1;
        }
    };

    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let mut session = match Session::open(&cli.db, registry, config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: failed to open store '{}': {}", cli.db, e);
            return 1;
        }
    };
    tracing::debug!(
        db = %cli.db,
        allow_schema_creation = session.config().allow_schema_creation,
        max_in_list = ?session.config().max_in_list,
        "store opened"
    );

    let result = match &cli.command {
        Commands::Stats => print_stats(&mut session),
        Commands::Classes => print_classes(&session),
        Commands::Edges { id } => print_edges(&mut session, *id),
        Commands::Show { class, id } => show(&mut session, class, *id),
        Commands::Gc => session.collect_garbage().map(|swept| {
            println!("{} object(s) collected", swept);
        }),
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Reads a JSON class registry, or returns an empty one when no file is
/// given.
fn load_registry(path: Option<&str>) -> Result<ClassRegistry, String> {
    let Some(path) = path else {
        return Ok(ClassRegistry::new());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read registry '{}': {}", path, e))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid registry '{}': {}", path, e))
}

fn print_stats(session: &mut Session) -> Result<(), StorageError> {
    for (table, count) in session.stats()? {
        println!("{:<16} {}", table, count);
    }
    Ok(())
}

fn print_classes(session: &Session) -> Result<(), StorageError> {
    for (superclass, subclass) in session.hierarchy()?.edges() {
        println!("{} -> {}", superclass, subclass);
    }
    Ok(())
}

fn print_edges(session: &mut Session, id: Option<i64>) -> Result<(), StorageError> {
    let edges = session.edges(id)?;
    println!("{}", serde_json::to_string_pretty(&edges)?);
    Ok(())
}

fn show(session: &mut Session, class: &str, id: i64) -> Result<(), StorageError> {
    let root = session.load(class, id)?.ok_or_else(|| StorageError::NotFound {
        what: format!("{}#{}", class, id),
    })?;
    let mut nodes = Vec::new();
    for handle in session.graph().reachable(root)? {
        let stored = session.stored_ref(handle).map(|key| key.to_string());
        nodes.push(serde_json::json!({
            "handle": handle,
            "stored": stored,
            "node": session.graph().node(handle)?,
        }));
    }
    let dump = serde_json::json!({ "root": root, "nodes": nodes });
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
