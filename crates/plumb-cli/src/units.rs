//! Turning command-line paths into an ordered list of migration units.

use camino::{Utf8Path, Utf8PathBuf};
use plumb::MigrationUnit;

use crate::CliError;

/// Expand `paths` in order. A directory contributes its `*.sql` files sorted
/// by file name; a file is taken as-is whatever its extension.
pub fn collect(paths: &[Utf8PathBuf]) -> Result<Vec<MigrationUnit>, CliError> {
    let mut units = Vec::new();
    for path in paths {
        if path.is_dir() {
            for file in sql_files(path)? {
                units.push(load(&file)?);
            }
        } else {
            units.push(load(path)?);
        }
    }
    Ok(units)
}

fn sql_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CliError> {
    let read_dir_error = |source| CliError::ReadDir {
        path: dir.to_string(),
        source,
    };

    let mut files = Vec::new();
    for entry in dir.read_dir_utf8().map_err(read_dir_error)? {
        let entry = entry.map_err(read_dir_error)?;
        let path = entry.path();
        if path.extension() == Some("sql") && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    if files.is_empty() {
        tracing::warn!(dir = %dir, "no .sql files found");
    }
    Ok(files)
}

fn load(path: &Utf8Path) -> Result<MigrationUnit, CliError> {
    let unit = MigrationUnit::from_file(path)?;
    if unit.is_empty() {
        tracing::warn!(unit = unit.name(), "migration file is empty");
    }
    Ok(unit)
}
