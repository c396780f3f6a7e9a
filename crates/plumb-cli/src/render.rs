//! Human-readable and JSON output.

use owo_colors::OwoColorize;
use plumb::{
    ExecutionStatus, MigrationUnit, ReconciliationReport, RunOutcome, SchemaSnapshot, TableStatus,
    Verdict, Verification,
};
use serde::Serialize;
use std::fmt;

/// Colors, or none.
#[derive(Debug, Clone, Copy)]
pub struct Palette {
    color: bool,
}

impl Palette {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn good(self, s: &str) -> String {
        if self.color { s.green().to_string() } else { s.to_string() }
    }

    fn bad(self, s: &str) -> String {
        if self.color { s.red().to_string() } else { s.to_string() }
    }

    fn warn(self, s: &str) -> String {
        if self.color { s.yellow().to_string() } else { s.to_string() }
    }

    fn dim(self, s: &str) -> String {
        if self.color { s.dimmed().to_string() } else { s.to_string() }
    }

    fn bold(self, s: &str) -> String {
        if self.color { s.bold().to_string() } else { s.to_string() }
    }
}

pub fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Passed => "passed",
        Verdict::ExecutionFailed => "execution failed",
        Verdict::Incomplete => "incomplete",
        Verdict::VerificationUnavailable => "verification unavailable",
    }
}

fn rows(count: Option<u64>) -> Option<String> {
    match count {
        Some(1) => Some("1 row".to_string()),
        Some(n) => Some(format!("{} rows", n)),
        None => None,
    }
}

/// Text view of a whole run. `units` supplies the SQL for error locations.
pub struct OutcomeView<'a> {
    pub outcome: &'a RunOutcome,
    pub units: &'a [MigrationUnit],
    pub palette: Palette,
}

impl fmt::Display for OutcomeView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.palette;

        if !self.outcome.results.is_empty() {
            writeln!(f, "{}", p.bold("Migrations"))?;
            for (i, result) in self.outcome.results.iter().enumerate() {
                match result.status {
                    ExecutionStatus::Committed => writeln!(
                        f,
                        "  {} {}  {}",
                        p.good(&format!("{:<13}", "committed")),
                        result.unit_name,
                        p.dim(&format!("({}, {} ms)", result.checksum, result.elapsed.as_millis()))
                    )?,
                    ExecutionStatus::RolledBack => {
                        writeln!(
                            f,
                            "  {} {}",
                            p.bad(&format!("{:<13}", "rolled back")),
                            result.unit_name
                        )?;
                        if let Some(error) = &result.error {
                            writeln!(f, "      error: {}", error)?;
                            // Results are index-aligned with units; names need not be unique.
                            let sql = self.units.get(i).map(|u| u.sql());
                            if let Some((line, column)) = sql.and_then(|sql| error.location(sql)) {
                                writeln!(f, "      at line {}, column {}", line, column)?;
                            }
                            if let Some(detail) = &error.detail {
                                writeln!(f, "      detail: {}", detail)?;
                            }
                            if let Some(hint) = &error.hint {
                                writeln!(f, "      hint: {}", hint)?;
                            }
                        }
                    }
                    ExecutionStatus::NotAttempted => writeln!(
                        f,
                        "  {} {}",
                        p.dim(&format!("{:<13}", "not attempted")),
                        result.unit_name
                    )?,
                }
            }
            writeln!(f)?;
        }

        match &self.outcome.verification {
            Verification::Reconciled(report) => {
                write!(f, "{}", ReportView { report, palette: p })?;
            }
            Verification::Unavailable(err) => {
                writeln!(f, "{} {}", p.bad("Verification unavailable:"), err)?;
                writeln!(f)?;
            }
        }

        let verdict = self.outcome.verdict();
        let label = verdict_label(verdict);
        let label = if verdict == Verdict::Passed { p.good(label) } else { p.bad(label) };
        writeln!(f, "Result: {}", label)
    }
}

/// Text view of a reconciliation report.
pub struct ReportView<'a> {
    pub report: &'a ReconciliationReport,
    pub palette: Palette,
}

impl fmt::Display for ReportView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.palette;
        let report = self.report;
        let totals = report.totals();

        let mut summary = format!("{}/{} tables present", totals.present, totals.expected);
        if totals.incomplete > 0 {
            summary.push_str(&format!(", {} incomplete", totals.incomplete));
        }
        if totals.missing > 0 {
            summary.push_str(&format!(", {} missing", totals.missing));
        }
        writeln!(f, "{}: {}", p.bold(&format!("Schema {}", report.schema)), summary)?;

        let width = report.tables.iter().map(|t| t.name.len()).max().unwrap_or(0);
        for table in &report.tables {
            let status = match &table.status {
                TableStatus::Present { row_count } => match rows(*row_count) {
                    Some(rows) => format!("{} ({})", p.good("present"), rows),
                    None => p.good("present"),
                },
                TableStatus::PresentIncomplete { row_count, .. } => match rows(*row_count) {
                    Some(rows) => format!("{} ({})", p.warn("incomplete"), rows),
                    None => p.warn("incomplete"),
                },
                TableStatus::Missing => p.bad("missing"),
            };
            writeln!(f, "  {:<width$}  {}", table.name, status)?;
            if let TableStatus::PresentIncomplete { missing, .. } = &table.status {
                for object in missing {
                    writeln!(f, "      missing {}", object)?;
                }
            }
        }

        if !report.groups.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", p.bold("Groups"))?;
            let width = report.groups.iter().map(|g| g.name.len()).max().unwrap_or(0);
            for group in &report.groups {
                let mut line = format!("{}/{} present", group.present, group.expected);
                if group.incomplete > 0 {
                    line.push_str(&format!(", {} incomplete", group.incomplete));
                }
                if group.missing > 0 {
                    line.push_str(&format!(", {} missing", group.missing));
                }
                let line = if group.is_satisfied() { p.good(&line) } else { p.warn(&line) };
                writeln!(f, "  {:<width$}  {}", group.name, line)?;
            }
        }

        if !report.functions.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", p.bold("Functions"))?;
            let width = report.functions.iter().map(|r| r.name.len()).max().unwrap_or(0);
            for function in &report.functions {
                let status = if function.present { p.good("present") } else { p.bad("missing") };
                writeln!(f, "  {:<width$}  {}", function.name, status)?;
            }
        }

        writeln!(f)
    }
}

/// Text view of a catalog snapshot.
pub struct SnapshotView<'a> {
    pub snapshot: &'a SchemaSnapshot,
    pub palette: Palette,
}

impl fmt::Display for SnapshotView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.palette;
        let snapshot = self.snapshot;
        let tables = snapshot.tables().count();
        let functions = snapshot.functions().count();

        writeln!(
            f,
            "{}: {} {}, {} {}",
            p.bold(&format!("Schema {}", snapshot.schema())),
            tables,
            if tables == 1 { "table" } else { "tables" },
            functions,
            if functions == 1 { "function" } else { "functions" },
        )?;

        for table in snapshot.tables() {
            let name = table.name.as_str();
            writeln!(f)?;

            let mut notes = Vec::new();
            notes.extend(rows(table.row_count));
            if snapshot.row_security(name) == Some(true) {
                notes.push("row security enabled".to_string());
            }
            if notes.is_empty() {
                writeln!(f, "{}", p.bold(name))?;
            } else {
                writeln!(f, "{} {}", p.bold(name), p.dim(&format!("({})", notes.join(", "))))?;
            }

            let columns: Vec<_> = snapshot.columns(name).collect();
            if !columns.is_empty() {
                writeln!(f, "  columns")?;
                let width = columns.iter().map(|c| c.name.len()).max().unwrap_or(0);
                for column in columns {
                    let mut ty = column.data_type.clone();
                    if let Some(len) = column.max_length {
                        ty.push_str(&format!("({})", len));
                    }
                    if !column.nullable {
                        ty.push_str(" not null");
                    }
                    if let Some(default) = &column.default {
                        ty.push_str(&format!(" default {}", default));
                    }
                    writeln!(f, "    {:<width$}  {}", column.name, ty)?;
                }
            }

            let indexes: Vec<_> = snapshot.indexes(name).collect();
            if !indexes.is_empty() {
                writeln!(f, "  indexes")?;
                for index in indexes {
                    writeln!(f, "    {}  {}", index.name, p.dim(&index.definition))?;
                }
            }

            // Composite keys arrive as consecutive rows of one constraint.
            let mut constraints: Vec<(&str, Vec<&str>, &str, Vec<&str>)> = Vec::new();
            for fk in snapshot.foreign_keys(name) {
                match constraints.last_mut() {
                    Some((constraint, columns, _, refs)) if *constraint == fk.constraint => {
                        columns.push(fk.column.as_str());
                        refs.push(fk.ref_column.as_str());
                    }
                    _ => constraints.push((
                        fk.constraint.as_str(),
                        vec![fk.column.as_str()],
                        fk.ref_table.as_str(),
                        vec![fk.ref_column.as_str()],
                    )),
                }
            }
            if !constraints.is_empty() {
                writeln!(f, "  foreign keys")?;
                for (constraint, columns, ref_table, refs) in constraints {
                    writeln!(
                        f,
                        "    {}  ({}) -> {}({})",
                        constraint,
                        columns.join(", "),
                        ref_table,
                        refs.join(", ")
                    )?;
                }
            }

            let triggers: Vec<_> = snapshot.triggers(name).collect();
            if !triggers.is_empty() {
                writeln!(f, "  triggers")?;
                for trigger in triggers {
                    writeln!(f, "    {} -> {}()", trigger.name, trigger.function_name)?;
                }
            }

            let policies: Vec<_> = snapshot.policies(name).collect();
            if !policies.is_empty() {
                writeln!(f, "  policies")?;
                for policy in policies {
                    writeln!(f, "    {}  {}", policy.name, policy.command)?;
                }
            }
        }

        if functions > 0 {
            writeln!(f)?;
            writeln!(f, "{}", p.bold("Functions"))?;
            for function in snapshot.functions() {
                writeln!(
                    f,
                    "  {}({}) -> {}",
                    function.name, function.arguments, function.return_type
                )?;
            }
        }
        Ok(())
    }
}

/// JSON form of a run: the verdict next to the raw outcome.
#[derive(Serialize)]
pub struct RunJson<'a> {
    pub verdict: Verdict,
    #[serde(flatten)]
    pub outcome: &'a RunOutcome,
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}
