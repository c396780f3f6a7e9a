use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not acquire a database connection: {0}")]
    Connect(String),

    #[error("catalog unavailable while reading {stage}: {source}")]
    CatalogUnavailable {
        stage: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("invalid expected schema: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("inconsistent snapshot: {0}")]
    InvalidSnapshot(#[from] SnapshotError),

    #[error("could not parse schema declaration: {0}")]
    Declaration(#[from] toml::de::Error),

    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Short machine-friendly name for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connect(_) => "connect",
            Error::CatalogUnavailable { .. } => "catalog_unavailable",
            Error::InvalidSpec(_) => "invalid_spec",
            Error::InvalidSnapshot(_) => "invalid_snapshot",
            Error::Declaration(_) => "declaration",
            Error::Io { .. } => "io",
        }
    }
}

/// Reasons an [`ExpectedSchemaSpec`](crate::ExpectedSchemaSpec) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("schema namespace must not be empty")]
    EmptySchema,

    #[error("empty {what} name")]
    EmptyName { what: &'static str },

    #[error("table `{table}` is listed twice (in {first} and in {second})")]
    DuplicateTable {
        table: String,
        first: String,
        second: String,
    },

    #[error("group `{0}` is declared twice")]
    DuplicateGroup(String),

    #[error("requirements given for `{table}`, which is not an expected table")]
    OrphanRequirement { table: String },

    #[error("function `{0}` is listed twice")]
    DuplicateFunction(String),
}

/// Violations of the snapshot invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("{kind} `{name}` references table `{table}`, which is not in the snapshot")]
    OrphanObject {
        kind: &'static str,
        name: String,
        table: String,
    },

    #[error("duplicate {kind} `{name}`")]
    Duplicate { kind: &'static str, name: String },
}
