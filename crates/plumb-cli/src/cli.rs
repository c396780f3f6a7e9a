//! Command-line arguments.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use plumb::RowCounts;

/// Apply Postgres migrations, then verify the schema they produce.
#[derive(Parser, Debug)]
#[command(name = "plumb", version)]
#[command(about = "Apply Postgres migrations and verify the resulting schema", long_about = None)]
pub struct Cli {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Schema namespace to verify (overrides the declaration)
    #[arg(long, env = "PLUMB_SCHEMA", global = true)]
    pub schema: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text, global = true)]
    pub format: Format,

    /// How to count table rows (exact, estimated, skip)
    #[arg(long, default_value = "exact", global = true)]
    pub row_counts: RowCounts,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply SQL files in order, then verify the schema
    Apply(ApplyArgs),
    /// Verify the schema without applying anything
    Verify(VerifyArgs),
    /// Print what the catalog currently contains
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
pub struct ApplyArgs {
    /// SQL files or directories of `*.sql` files, applied in the given order
    #[arg(value_name = "PATH")]
    pub paths: Vec<Utf8PathBuf>,

    /// Expected-schema declaration (TOML)
    #[arg(long, value_name = "FILE")]
    pub expect: Option<Utf8PathBuf>,
}

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Expected-schema declaration (TOML)
    #[arg(long, value_name = "FILE")]
    pub expect: Option<Utf8PathBuf>,
}

#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Only these tables (repeatable)
    #[arg(long = "table", value_name = "TABLE")]
    pub tables: Vec<String>,

    /// Skip user-defined functions
    #[arg(long)]
    pub no_functions: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_apply() {
        let cli = Cli::try_parse_from([
            "plumb",
            "apply",
            "db/001_orders.sql",
            "db/later",
            "--expect",
            "expected.toml",
            "--database-url",
            "postgres://localhost/app",
            "--row-counts",
            "estimated",
        ])
        .unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(cli.row_counts, RowCounts::Estimated);
        assert_eq!(cli.format, Format::Text);
        let Commands::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        let paths: Vec<&str> = args.paths.iter().map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["db/001_orders.sql", "db/later"]);
        assert_eq!(args.expect.as_ref().map(|p| p.as_str()), Some("expected.toml"));
    }

    #[test]
    fn parses_inspect_tables() {
        let cli = Cli::try_parse_from([
            "plumb", "--format", "json", "inspect", "--table", "orders", "--table", "ledger",
        ])
        .unwrap();
        assert_eq!(cli.format, Format::Json);
        let Commands::Inspect(args) = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(args.tables, vec!["orders", "ledger"]);
        assert!(!args.no_functions);
    }

    #[test]
    fn rejects_unknown_row_count_mode() {
        let err = Cli::try_parse_from(["plumb", "verify", "--row-counts", "guess"]).unwrap_err();
        assert!(err.to_string().contains("guess"));
    }
}
