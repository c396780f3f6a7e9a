//! Apply Postgres schema migrations, then check the live catalog against what
//! should be there.
//!
//! A run has two halves:
//!
//! 1. **Apply.** Each [`MigrationUnit`] (an opaque blob of SQL, typically one
//!    file) runs in its own transaction via [`MigrationExecutor`]. The first
//!    failure is rolled back and stops the sequence.
//! 2. **Verify.** [`SchemaCatalogReader`] takes a [`SchemaSnapshot`] of the
//!    schema namespace and [`reconcile`] compares it with an
//!    [`ExpectedSchemaSpec`], producing a [`ReconciliationReport`].
//!
//! [`MigrationOrchestrator`] ties both together over a single connection
//! obtained from a [`ConnectionProvider`]:
//!
//! ```ignore
//! let spec = ExpectedSchemaSpec::from_file("schema.toml")?;
//! let units = vec![MigrationUnit::from_file("migrations/001_orders.sql")?];
//!
//! let orchestrator = MigrationOrchestrator::new(DirectConnector::new(&url)?);
//! let outcome = orchestrator.run(&units, &spec).await;
//! match outcome.verdict() {
//!     Verdict::Passed => {}
//!     other => eprintln!("run did not pass: {:?}", other),
//! }
//! ```
//!
//! The reconciliation step is a pure function and can be used on its own
//! against snapshots built in memory.

mod catalog;
mod error;
mod executor;
mod expected;
mod introspect;
mod orchestrator;
mod pool;
mod reconcile;
mod tls;
mod traced;
mod unit;

#[cfg(test)]
mod scripted;

pub use catalog::{
    CatalogObject, Column, ForeignKey, Function, Index, ObjectKey, ObjectKind, PolicyCommand,
    RowSecurityPolicy, RowSecurityState, SchemaSnapshot, Table, Trigger,
};
pub use error::{Error, SnapshotError, SpecError};
pub use executor::MigrationExecutor;
pub use expected::{
    DEFAULT_SCHEMA, Declaration, ExpectedSchemaSpec, ExpectedTable, GroupDeclaration, SpecBuilder,
    TableRequirements, matches_pattern,
};
pub use introspect::{RowCounts, SchemaCatalogReader, SnapshotFilter};
pub use orchestrator::{MigrationOrchestrator, RunOptions, RunOutcome, Verdict, Verification};
pub use pool::{ConnectionProvider, DirectConnector};
pub use reconcile::{
    FunctionReport, GroupSummary, MissingObject, ReconciliationReport, TableReport, TableStatus,
    Totals, reconcile,
};
pub use traced::{Connection, TracedConn};
pub use unit::{ErrorDetail, ExecutionResult, ExecutionStatus, MigrationUnit};

/// Result type for plumb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value quoted with double quotes, doubling any embedded
/// quotes.
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Quote a PostgreSQL identifier.
///
/// Always quotes, so reserved words like `user` or `order` and mixed-case
/// names survive.
pub fn quote_ident(name: &str) -> String {
    Ident(name).to_string()
}
