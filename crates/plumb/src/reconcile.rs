//! Reconciliation - compare a live [`SchemaSnapshot`] against an
//! [`ExpectedSchemaSpec`].
//!
//! This is a pure function of its two inputs: no I/O, no clock, no hashing
//! with random state. Reconciling the same pair twice yields identical
//! reports, down to the serialized bytes.
//!
//! Every expected table is classified as one of:
//!
//! - **present** - the table exists and satisfies all its requirements
//! - **present, incomplete** - the table exists but lacks one or more required
//!   columns, indexes, policies, triggers, or row-level security
//! - **missing** - no base table of that name exists in the schema
//!
//! The report is satisfied only when every expected table is fully present
//! and every expected function exists. Tables the expected schema does not
//! mention are ignored.

use crate::catalog::{PolicyCommand, SchemaSnapshot};
use crate::expected::{ExpectedSchemaSpec, ExpectedTable, matches_pattern};
use serde::Serialize;
use std::fmt;

/// A required sub-object that the snapshot does not contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum MissingObject {
    Column(String),
    /// The unmatched index pattern.
    Index(String),
    /// No policy for this command (or `ALL`) exists.
    Policy(PolicyCommand),
    Trigger(String),
    /// Row-level security is required but disabled.
    RowSecurity,
}

impl fmt::Display for MissingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingObject::Column(name) => write!(f, "column {}", name),
            MissingObject::Index(pattern) => write!(f, "index {}", pattern),
            MissingObject::Policy(command) => write!(f, "policy for {}", command),
            MissingObject::Trigger(name) => write!(f, "trigger {}", name),
            MissingObject::RowSecurity => write!(f, "row level security"),
        }
    }
}

/// Classification of one expected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    Present {
        row_count: Option<u64>,
    },
    PresentIncomplete {
        row_count: Option<u64>,
        missing: Vec<MissingObject>,
    },
    Missing,
}

impl TableStatus {
    pub fn is_present(&self) -> bool {
        matches!(self, TableStatus::Present { .. })
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, TableStatus::Missing)
    }

    pub fn row_count(&self) -> Option<u64> {
        match self {
            TableStatus::Present { row_count } | TableStatus::PresentIncomplete { row_count, .. } => {
                *row_count
            }
            TableStatus::Missing => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TableStatus::Present { .. } => "present",
            TableStatus::PresentIncomplete { .. } => "incomplete",
            TableStatus::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub name: String,
    pub group: Option<String>,
    pub status: TableStatus,
}

/// Per-group tallies, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub expected: usize,
    pub present: usize,
    pub incomplete: usize,
    pub missing: usize,
}

impl GroupSummary {
    pub fn is_satisfied(&self) -> bool {
        self.present == self.expected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub present: bool,
}

/// Tallies across every expected table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub expected: usize,
    pub present: usize,
    pub incomplete: usize,
    pub missing: usize,
}

/// The outcome of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub schema: String,
    /// One entry per expected table, in spec order.
    pub tables: Vec<TableReport>,
    pub groups: Vec<GroupSummary>,
    pub functions: Vec<FunctionReport>,
    pub fully_satisfied: bool,
}

impl ReconciliationReport {
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn totals(&self) -> Totals {
        let mut totals = Totals {
            expected: self.tables.len(),
            ..Totals::default()
        };
        for table in &self.tables {
            match table.status {
                TableStatus::Present { .. } => totals.present += 1,
                TableStatus::PresentIncomplete { .. } => totals.incomplete += 1,
                TableStatus::Missing => totals.missing += 1,
            }
        }
        totals
    }

    /// Names of expected tables that do not exist at all.
    pub fn missing_tables(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|t| t.status.is_missing())
            .map(|t| t.name.as_str())
    }

    pub fn missing_functions(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .filter(|f| !f.present)
            .map(|f| f.name.as_str())
    }
}

/// Diff `snapshot` against `spec`.
pub fn reconcile(snapshot: &SchemaSnapshot, spec: &ExpectedSchemaSpec) -> ReconciliationReport {
    let tables: Vec<TableReport> = spec
        .tables()
        .map(|expected| TableReport {
            name: expected.name.clone(),
            group: expected.group.clone(),
            status: classify(snapshot, spec.schema(), expected),
        })
        .collect();

    let groups = spec
        .groups()
        .iter()
        .map(|group| {
            let mut summary = GroupSummary {
                name: group.clone(),
                expected: 0,
                present: 0,
                incomplete: 0,
                missing: 0,
            };
            for table in tables.iter().filter(|t| t.group.as_ref() == Some(group)) {
                summary.expected += 1;
                match table.status {
                    TableStatus::Present { .. } => summary.present += 1,
                    TableStatus::PresentIncomplete { .. } => summary.incomplete += 1,
                    TableStatus::Missing => summary.missing += 1,
                }
            }
            summary
        })
        .collect();

    let functions: Vec<FunctionReport> = spec
        .functions()
        .iter()
        .map(|name| FunctionReport {
            name: name.clone(),
            present: snapshot.functions().any(|f| &f.name == name),
        })
        .collect();

    let fully_satisfied =
        tables.iter().all(|t| t.status.is_present()) && functions.iter().all(|f| f.present);

    ReconciliationReport {
        schema: snapshot.schema().to_string(),
        tables,
        groups,
        functions,
        fully_satisfied,
    }
}

fn classify(snapshot: &SchemaSnapshot, schema: &str, expected: &ExpectedTable) -> TableStatus {
    let Some(table) = snapshot
        .table(&expected.name)
        .filter(|t| t.schema == schema)
    else {
        return TableStatus::Missing;
    };

    let name = expected.name.as_str();
    let requirements = &expected.requirements;
    let mut missing = Vec::new();

    for column in &requirements.columns {
        if !snapshot.columns(name).any(|c| &c.name == column) {
            missing.push(MissingObject::Column(column.clone()));
        }
    }
    for pattern in &requirements.indexes {
        if !snapshot
            .indexes(name)
            .any(|i| matches_pattern(pattern, &i.name))
        {
            missing.push(MissingObject::Index(pattern.clone()));
        }
    }
    for &command in &requirements.policies {
        if !snapshot.policies(name).any(|p| p.command.covers(command)) {
            missing.push(MissingObject::Policy(command));
        }
    }
    for trigger in &requirements.triggers {
        if !snapshot.triggers(name).any(|t| &t.name == trigger) {
            missing.push(MissingObject::Trigger(trigger.clone()));
        }
    }
    if requirements.row_security && snapshot.row_security(name) != Some(true) {
        missing.push(MissingObject::RowSecurity);
    }

    if missing.is_empty() {
        TableStatus::Present {
            row_count: table.row_count,
        }
    } else {
        TableStatus::PresentIncomplete {
            row_count: table.row_count,
            missing,
        }
    }
}
