//! Migration units and the outcome of applying them.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One named batch of schema-change statements.
///
/// The SQL text is opaque: it is never parsed, only sent to the server as a
/// single batch inside one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    name: Arc<str>,
    sql: Arc<str>,
}

impl MigrationUnit {
    pub fn new(name: impl Into<Arc<str>>, sql: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Read a unit from disk, naming it after the file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let sql = std::fs::read_to_string(path).map_err(|source| crate::Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, sql))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Size of the SQL text in bytes.
    pub fn len(&self) -> usize {
        self.sql.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }

    /// Content checksum, for display. No record of applied units is kept.
    pub fn checksum(&self) -> blake3::Hash {
        blake3::hash(self.sql.as_bytes())
    }

    /// First 12 hex digits of [`checksum`](Self::checksum).
    pub fn short_checksum(&self) -> String {
        let mut hex = self.checksum().to_hex().to_string();
        hex.truncate(12);
        hex
    }
}

/// What happened to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every statement succeeded and the transaction committed.
    Committed,
    /// Something failed; the transaction was rolled back.
    RolledBack,
    /// An earlier unit failed, so this one was never sent.
    NotAttempted,
}

/// Outcome of applying one [`MigrationUnit`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub unit_name: String,
    pub checksum: String,
    pub status: ExecutionStatus,
    pub error: Option<ErrorDetail>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub(crate) fn committed(unit: &MigrationUnit, elapsed: Duration) -> Self {
        Self {
            unit_name: unit.name().to_string(),
            checksum: unit.short_checksum(),
            status: ExecutionStatus::Committed,
            error: None,
            elapsed,
        }
    }

    pub(crate) fn rolled_back(unit: &MigrationUnit, error: ErrorDetail, elapsed: Duration) -> Self {
        Self {
            unit_name: unit.name().to_string(),
            checksum: unit.short_checksum(),
            status: ExecutionStatus::RolledBack,
            error: Some(error),
            elapsed,
        }
    }

    pub(crate) fn not_attempted(unit: &MigrationUnit) -> Self {
        Self {
            unit_name: unit.name().to_string(),
            checksum: unit.short_checksum(),
            status: ExecutionStatus::NotAttempted,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == ExecutionStatus::Committed
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Why a unit was rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    /// SQLSTATE, when the server reported one.
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into the unit's SQL text.
    pub position: Option<u32>,
    /// Set when the rollback itself failed too.
    pub rollback: Option<String>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn from_postgres(err: &tokio_postgres::Error) -> Self {
        let Some(db) = err.as_db_error() else {
            return Self::new(err.to_string());
        };

        let position = match db.position() {
            Some(tokio_postgres::error::ErrorPosition::Original(pos)) => Some(*pos),
            _ => None,
        };

        Self {
            code: Some(db.code().code().to_string()),
            message: db.message().to_string(),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
            position,
            rollback: None,
        }
    }

    /// Resolve [`position`](Self::position) to a 1-based `(line, column)` in `sql`.
    pub fn location(&self, sql: &str) -> Option<(usize, usize)> {
        let pos = usize::try_from(self.position?).ok()?;
        if pos == 0 {
            return None;
        }

        let mut line = 1;
        let mut column = 1;
        for (i, c) in sql.chars().enumerate() {
            if i + 1 == pos {
                return Some((line, column));
            }
            if c == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        None
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(rollback) = &self.rollback {
            write!(f, " (rollback also failed: {})", rollback)?;
        }
        Ok(())
    }
}
