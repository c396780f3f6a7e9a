//! Applying a single migration unit.
//!
//! Each unit runs in its own explicit transaction:
//!
//! ```text
//! BEGIN;
//! <unit SQL, sent as one batch>
//! COMMIT;      -- or ROLLBACK on any failure
//! ```
//!
//! ## Caveats
//!
//! Postgres rolls back DDL with the rest of a transaction, so a rolled-back
//! unit leaves no trace. Statements that refuse to run inside a transaction
//! block (`CREATE INDEX CONCURRENTLY`, `VACUUM`, ...) therefore always fail
//! here and roll the unit back.
//!
//! The unit text must not manage its own transaction. A `COMMIT;` inside a
//! unit commits everything before it, and the statements after it run outside
//! the executor's transaction, so a later failure can no longer undo them. A
//! `BEGIN;` only draws a server warning, but a `ROLLBACK;` or `COMMIT;` after
//! it ends the executor's transaction just the same.
//!
//! On an engine without transactional DDL the guarantee would shrink to "no
//! further statements of the unit run"; this executor only targets Postgres.

use crate::traced::{Connection, TracedConn};
use crate::unit::{ErrorDetail, ExecutionResult, MigrationUnit};
use std::time::Instant;
use tracing::Instrument;

/// Applies [`MigrationUnit`]s over one connection.
pub struct MigrationExecutor<'a, C: Connection + ?Sized> {
    conn: TracedConn<'a, C>,
}

impl<'a, C: Connection + ?Sized> MigrationExecutor<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self {
            conn: TracedConn::new(conn),
        }
    }

    /// Apply `unit` inside a single transaction.
    ///
    /// Never returns an error: failures come back as a `RolledBack` result
    /// carrying the server's error, and the rollback has already been issued.
    pub async fn apply(&self, unit: &MigrationUnit) -> ExecutionResult {
        let span = tracing::info_span!(
            "plumb.apply",
            unit = %unit.name(),
            checksum = %unit.short_checksum(),
            bytes = unit.len(),
        );
        self.apply_unit(unit).instrument(span).await
    }

    async fn apply_unit(&self, unit: &MigrationUnit) -> ExecutionResult {
        let started = Instant::now();
        match self.run_in_transaction(unit).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "migration committed");
                ExecutionResult::committed(unit, elapsed)
            }
            Err(err) => {
                let mut detail = ErrorDetail::from_postgres(&err);
                tracing::warn!(
                    code = detail.code.as_deref().unwrap_or("-"),
                    "migration failed, rolling back: {}",
                    detail.message
                );

                if let Err(rollback_err) = self.conn.control("ROLLBACK").await {
                    tracing::error!("rollback failed: {}", rollback_err);
                    detail.rollback = Some(rollback_err.to_string());
                }

                ExecutionResult::rolled_back(unit, detail, started.elapsed())
            }
        }
    }

    async fn run_in_transaction(&self, unit: &MigrationUnit) -> Result<(), tokio_postgres::Error> {
        self.conn.control("BEGIN").await?;
        self.conn.batch_execute(unit.sql()).await?;
        self.conn.control("COMMIT").await
    }
}
