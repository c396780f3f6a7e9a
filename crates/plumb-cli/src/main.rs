mod cli;
mod config;
mod render;
mod units;

use camino::Utf8Path;
use clap::Parser;
use cli::{Cli, Commands, Format};
use config::{ConfigError, mask_password};
use plumb::{
    ConnectionProvider, Declaration, DirectConnector, ExpectedSchemaSpec, MigrationOrchestrator,
    MigrationUnit, RunOptions, SchemaCatalogReader, SnapshotFilter, Verdict,
};
use render::{OutcomeView, Palette, RunJson, SnapshotView};
use std::io::IsTerminal;
use std::process::ExitCode;

/// Exit status when the run could not even start (bad arguments, unreadable
/// files, invalid declaration).
const EXIT_INVALID_INPUT: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plumb(#[from] plumb::Error),

    #[error("no database URL: pass --database-url or set DATABASE_URL")]
    MissingDatabaseUrl,

    #[error("no expected-schema declaration: pass --expect or set `expect` in .config/plumb.toml")]
    MissingDeclaration,

    #[error("no migrations to apply: pass paths or set `migrations` in .config/plumb.toml")]
    NoMigrations,

    #[error("could not read directory {path}: {source}")]
    ReadDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode output: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine; flags and the real environment still apply.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("plumb=info,plumb_cli=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::from(EXIT_INVALID_INPUT)
        }
    }
}

fn exit_code(verdict: Verdict) -> u8 {
    match verdict {
        Verdict::Passed => 0,
        Verdict::ExecutionFailed => 1,
        Verdict::Incomplete => 2,
        Verdict::VerificationUnavailable => 3,
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config = config::load()?;
    let palette = Palette::new(!cli.no_color && std::io::stdout().is_terminal());
    let schema = cli.schema.clone().or_else(|| config.schema.clone());

    match &cli.command {
        Commands::Apply(args) => {
            let expect = args.expect.as_deref().or(config.expect.as_deref());
            let spec = match expect {
                Some(path) => load_spec(path, schema)?,
                None => ExpectedSchemaSpec::builder()
                    .schema(schema.unwrap_or_else(|| plumb::DEFAULT_SCHEMA.to_string()))
                    .build()
                    .map_err(plumb::Error::from)?,
            };
            let paths = if args.paths.is_empty() {
                &config.migrations
            } else {
                &args.paths
            };
            if paths.is_empty() {
                return Err(CliError::NoMigrations);
            }
            let units = units::collect(paths)?;
            execute(&cli, &units, &spec, palette).await
        }
        Commands::Verify(args) => {
            let expect = args
                .expect
                .as_deref()
                .or(config.expect.as_deref())
                .ok_or(CliError::MissingDeclaration)?;
            let spec = load_spec(expect, schema)?;
            execute(&cli, &[], &spec, palette).await
        }
        Commands::Inspect(args) => {
            let schema = schema.unwrap_or_else(|| plumb::DEFAULT_SCHEMA.to_string());
            let provider = connector(&cli)?;
            let client = match provider.connect().await {
                Ok(client) => client,
                Err(err) => {
                    eprintln!("error: {}", err);
                    return Ok(ExitCode::from(exit_code(Verdict::VerificationUnavailable)));
                }
            };

            let filter = if args.tables.is_empty() {
                SnapshotFilter::all()
            } else {
                SnapshotFilter::only_tables(args.tables.iter().cloned())
            }
            .with_functions(!args.no_functions)
            .with_row_counts(cli.row_counts);

            let snapshot = match SchemaCatalogReader::new(&client).snapshot(&schema, &filter).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    eprintln!("error: {}", err);
                    return Ok(ExitCode::from(exit_code(Verdict::VerificationUnavailable)));
                }
            };

            match cli.format {
                Format::Text => print!("{}", SnapshotView { snapshot: &snapshot, palette }),
                Format::Json => println!("{}", render::to_json(&snapshot)?),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn execute(
    cli: &Cli,
    units: &[MigrationUnit],
    spec: &ExpectedSchemaSpec,
    palette: Palette,
) -> Result<ExitCode, CliError> {
    let orchestrator = MigrationOrchestrator::new(connector(cli)?).with_options(RunOptions {
        row_counts: cli.row_counts,
    });
    let outcome = orchestrator.run(units, spec).await;
    let verdict = outcome.verdict();

    match cli.format {
        Format::Text => print!(
            "{}",
            OutcomeView {
                outcome: &outcome,
                units,
                palette,
            }
        ),
        Format::Json => println!(
            "{}",
            render::to_json(&RunJson {
                verdict,
                outcome: &outcome,
            })?
        ),
    }

    Ok(ExitCode::from(exit_code(verdict)))
}

fn connector(cli: &Cli) -> Result<DirectConnector, CliError> {
    let url = cli.database_url.as_deref().ok_or(CliError::MissingDatabaseUrl)?;
    tracing::info!(database = %mask_password(url), "using database");
    Ok(DirectConnector::new(url)?)
}

/// Load a declaration, letting `schema` override the one it names.
fn load_spec(path: &Utf8Path, schema: Option<String>) -> Result<ExpectedSchemaSpec, CliError> {
    let mut declaration = Declaration::from_file(path)?;
    if let Some(schema) = schema {
        declaration.schema = schema;
    }
    Ok(declaration.into_spec().map_err(plumb::Error::from)?)
}
