//! One apply-then-verify run.
//!
//! ```text
//! connect ─▶ apply unit 1 ─▶ ... ─▶ apply unit n ─▶ snapshot ─▶ reconcile ─▶ release
//!                 │ rolled back
//!                 └──────────────── (rest not attempted) ─▶ snapshot ─▶ ...
//! ```
//!
//! Units are applied strictly in order on a single connection. The first
//! unit that rolls back stops the sequence; earlier commits stay committed.
//! The catalog is read afterwards whatever happened, so the report always
//! describes the database as it is now. Nothing is raised past
//! [`MigrationOrchestrator::run`]: every failure ends up in the
//! [`RunOutcome`].

use crate::executor::MigrationExecutor;
use crate::expected::ExpectedSchemaSpec;
use crate::introspect::{RowCounts, SchemaCatalogReader, SnapshotFilter};
use crate::pool::ConnectionProvider;
use crate::reconcile::{ReconciliationReport, reconcile};
use crate::traced::Connection;
use crate::unit::{ExecutionResult, ExecutionStatus, MigrationUnit};
use crate::{Error, Result};
use serde::Serialize;
use serde::ser::SerializeStruct;
use tracing::Instrument;

/// Knobs for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// How the verification snapshot counts rows.
    pub row_counts: RowCounts,
}

/// The verification half of a run.
#[derive(Debug)]
pub enum Verification {
    Reconciled(ReconciliationReport),
    /// No snapshot could be taken (connection refused, catalog unreadable).
    Unavailable(Error),
}

impl Serialize for Verification {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Verification", 2)?;
        match self {
            Verification::Reconciled(report) => {
                state.serialize_field("status", "reconciled")?;
                state.serialize_field("report", report)?;
            }
            Verification::Unavailable(err) => {
                state.serialize_field("status", "unavailable")?;
                state.serialize_field(
                    "error",
                    &ErrorSummary {
                        kind: err.kind(),
                        message: err.to_string(),
                    },
                )?;
            }
        }
        state.end()
    }
}

#[derive(Serialize)]
struct ErrorSummary {
    kind: &'static str,
    message: String,
}

/// Overall classification of a run, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every unit committed and every expected object is present.
    Passed,
    /// A unit rolled back.
    ExecutionFailed,
    /// All units committed but expected objects are missing.
    Incomplete,
    /// The catalog could not be read, so nothing can be claimed.
    VerificationUnavailable,
}

/// Everything a run produced.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    /// One entry per unit, in input order.
    pub results: Vec<ExecutionResult>,
    pub verification: Verification,
}

impl RunOutcome {
    pub fn report(&self) -> Option<&ReconciliationReport> {
        match &self.verification {
            Verification::Reconciled(report) => Some(report),
            Verification::Unavailable(_) => None,
        }
    }

    /// The unit that stopped the run, if any.
    pub fn failure(&self) -> Option<&ExecutionResult> {
        self.results
            .iter()
            .find(|r| r.status == ExecutionStatus::RolledBack)
    }

    pub fn verdict(&self) -> Verdict {
        if self.failure().is_some() {
            return Verdict::ExecutionFailed;
        }
        match &self.verification {
            Verification::Unavailable(_) => Verdict::VerificationUnavailable,
            Verification::Reconciled(report) if report.fully_satisfied => Verdict::Passed,
            Verification::Reconciled(_) => Verdict::Incomplete,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict() == Verdict::Passed
    }
}

/// Drives [`MigrationExecutor`], [`SchemaCatalogReader`] and [`reconcile`]
/// over one connection from `P`.
pub struct MigrationOrchestrator<P> {
    provider: P,
    options: RunOptions,
}

impl<P: ConnectionProvider> MigrationOrchestrator<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Apply `units` in order, then reconcile the schema against `spec`.
    ///
    /// With no units this is a pure verification run.
    pub async fn run(&self, units: &[MigrationUnit], spec: &ExpectedSchemaSpec) -> RunOutcome {
        let span = tracing::info_span!("plumb.run", schema = %spec.schema(), units = units.len());
        self.run_inner(units, spec).instrument(span).await
    }

    async fn run_inner(&self, units: &[MigrationUnit], spec: &ExpectedSchemaSpec) -> RunOutcome {
        let conn = match self.provider.connect().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!("{}", err);
                return RunOutcome {
                    results: units.iter().map(ExecutionResult::not_attempted).collect(),
                    verification: Verification::Unavailable(err),
                };
            }
        };

        let results = apply_all(&conn, units).await;
        let verification = match self.verify(&conn, spec).await {
            Ok(report) => {
                let totals = report.totals();
                tracing::info!(
                    present = totals.present,
                    incomplete = totals.incomplete,
                    missing = totals.missing,
                    fully_satisfied = report.fully_satisfied,
                    "reconciled"
                );
                Verification::Reconciled(report)
            }
            Err(err) => {
                tracing::error!("verification unavailable: {}", err);
                Verification::Unavailable(err)
            }
        };

        drop(conn);
        tracing::debug!("connection released");

        RunOutcome {
            results,
            verification,
        }
    }

    async fn verify(
        &self,
        conn: &P::Conn,
        spec: &ExpectedSchemaSpec,
    ) -> Result<ReconciliationReport> {
        let filter = SnapshotFilter::only_tables(spec.table_names())
            .with_functions(!spec.functions().is_empty())
            .with_row_counts(self.options.row_counts);
        let snapshot = SchemaCatalogReader::new(conn)
            .snapshot(spec.schema(), &filter)
            .await?;
        Ok(reconcile(&snapshot, spec))
    }
}

/// Apply units in order, stopping at the first rollback.
async fn apply_all<C: Connection + ?Sized>(conn: &C, units: &[MigrationUnit]) -> Vec<ExecutionResult> {
    let executor = MigrationExecutor::new(conn);
    let mut results = Vec::with_capacity(units.len());
    let mut stopped = false;

    for unit in units {
        if stopped {
            tracing::debug!(unit = %unit.name(), "not attempted after earlier failure");
            results.push(ExecutionResult::not_attempted(unit));
            continue;
        }
        let result = executor.apply(unit).await;
        stopped = !result.is_committed();
        results.push(result);
    }

    results
}
