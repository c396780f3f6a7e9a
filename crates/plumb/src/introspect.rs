//! Reading a [`SchemaSnapshot`] from the live catalog.
//!
//! All queries run inside one `REPEATABLE READ READ ONLY` transaction so they
//! observe the same catalog state. Nothing is locked beyond what the read
//! queries take on their own. Either the whole snapshot is returned or
//! [`Error::CatalogUnavailable`]; partial snapshots never escape.

use crate::catalog::{
    CatalogObject, Column, ForeignKey, Function, Index, PolicyCommand, RowSecurityPolicy,
    RowSecurityState, SchemaSnapshot, Table, Trigger,
};
use crate::traced::{Connection, TracedConn};
use crate::{Error, Result, quote_ident};
use std::collections::HashSet;
use tokio_postgres::Row;
use tracing::Instrument;

/// How row counts are obtained for each table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowCounts {
    /// `SELECT COUNT(*)` per table.
    #[default]
    Exact,
    /// Planner estimate from `pg_class.reltuples`; `None` if never analysed.
    Estimated,
    /// Leave `row_count` empty.
    Skip,
}

impl std::str::FromStr for RowCounts {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "estimated" | "estimate" => Ok(Self::Estimated),
            "skip" | "none" => Ok(Self::Skip),
            other => Err(format!(
                "unknown row count mode `{}` (expected exact, estimated or skip)",
                other
            )),
        }
    }
}

/// Which parts of the catalog to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFilter {
    /// Restrict to these tables; `None` reads every base table.
    pub tables: Option<Vec<String>>,
    /// Also enumerate user-defined functions.
    pub functions: bool,
    pub row_counts: RowCounts,
}

impl Default for SnapshotFilter {
    fn default() -> Self {
        Self {
            tables: None,
            functions: true,
            row_counts: RowCounts::Exact,
        }
    }
}

impl SnapshotFilter {
    /// Everything in the schema.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the named tables (and, if `functions`, the schema's functions).
    pub fn only_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: Some(tables.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_functions(mut self, functions: bool) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_row_counts(mut self, row_counts: RowCounts) -> Self {
        self.row_counts = row_counts;
        self
    }
}

const TABLES_SQL: &str = r#"
SELECT t.table_name::text
FROM information_schema.tables t
WHERE t.table_schema::text = $1::text
  AND t.table_type = 'BASE TABLE'
  AND ($2::text[] IS NULL OR t.table_name::text = ANY($2::text[]))
ORDER BY t.table_name
"#;

const COLUMNS_SQL: &str = r#"
SELECT c.table_name::text,
       c.column_name::text,
       c.data_type::text,
       c.is_nullable::text = 'YES',
       c.column_default::text,
       c.character_maximum_length::int4,
       c.ordinal_position::int4
FROM information_schema.columns c
WHERE c.table_schema::text = $1::text
ORDER BY c.table_name, c.ordinal_position
"#;

const INDEXES_SQL: &str = r#"
SELECT i.tablename::text, i.indexname::text, i.indexdef
FROM pg_indexes i
WHERE i.schemaname = $1::name
ORDER BY i.tablename, i.indexname
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT cls.relname::text,
       con.conname::text,
       att.attname::text,
       ref_cls.relname::text,
       ref_att.attname::text,
       k.ord::int4
FROM pg_constraint con
JOIN pg_class cls ON cls.oid = con.conrelid
JOIN pg_namespace ns ON ns.oid = cls.relnamespace
JOIN pg_class ref_cls ON ref_cls.oid = con.confrelid
CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, ref_attnum, ord)
JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum
JOIN pg_attribute ref_att ON ref_att.attrelid = con.confrelid AND ref_att.attnum = k.ref_attnum
WHERE con.contype = 'f' AND ns.nspname = $1::name
ORDER BY cls.relname, con.conname, k.ord
"#;

const TRIGGERS_SQL: &str = r#"
SELECT c.relname::text, t.tgname::text, p.proname::text
FROM pg_trigger t
JOIN pg_class c ON t.tgrelid = c.oid
JOIN pg_proc p ON t.tgfoid = p.oid
JOIN pg_namespace n ON c.relnamespace = n.oid
WHERE n.nspname = $1::name AND NOT t.tgisinternal
ORDER BY c.relname, t.tgname
"#;

const ROW_SECURITY_SQL: &str = r#"
SELECT c.relname::text, c.relrowsecurity
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1::name AND c.relkind IN ('r', 'p')
ORDER BY c.relname
"#;

const POLICIES_SQL: &str = r#"
SELECT p.tablename::text, p.policyname::text, p.cmd
FROM pg_policies p
WHERE p.schemaname = $1::name
ORDER BY p.tablename, p.policyname
"#;

const FUNCTIONS_SQL: &str = r#"
SELECT p.proname::text,
       COALESCE(pg_get_function_arguments(p.oid), ''),
       COALESCE(pg_get_function_result(p.oid), '')
FROM pg_proc p
JOIN pg_namespace n ON p.pronamespace = n.oid
WHERE n.nspname = $1::name AND p.prokind = 'f'
ORDER BY p.proname, 2
"#;

const ESTIMATES_SQL: &str = r#"
SELECT c.relname::text, c.reltuples::float8
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1::name AND c.relkind IN ('r', 'p')
"#;

/// Reads the catalog of one schema namespace.
pub struct SchemaCatalogReader<'a, C: Connection + ?Sized> {
    conn: TracedConn<'a, C>,
}

impl<'a, C: Connection + ?Sized> SchemaCatalogReader<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self {
            conn: TracedConn::new(conn),
        }
    }

    /// Take a snapshot of `schema`.
    pub async fn snapshot(&self, schema: &str, filter: &SnapshotFilter) -> Result<SchemaSnapshot> {
        let span = tracing::info_span!("plumb.snapshot", schema = %schema);
        self.read_snapshot(schema, filter).instrument(span).await
    }

    async fn read_snapshot(&self, schema: &str, filter: &SnapshotFilter) -> Result<SchemaSnapshot> {
        self.conn
            .control("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await
            .map_err(|source| Error::CatalogUnavailable {
                stage: "begin",
                source,
            })?;

        let read = self.read_all(schema, filter).await;

        // The read transaction is ended on every path; a failure to end it
        // only matters if the reads themselves succeeded.
        let end = self.conn.control("ROLLBACK").await;
        let objects = read?;
        end.map_err(|source| Error::CatalogUnavailable {
            stage: "end",
            source,
        })?;

        let snapshot = SchemaSnapshot::from_objects(schema, objects)?;
        tracing::info!(objects = snapshot.len(), "catalog snapshot taken");
        Ok(snapshot)
    }

    async fn read_all(&self, schema: &str, filter: &SnapshotFilter) -> Result<Vec<CatalogObject>> {
        let table_names = self.table_names(schema, filter).await?;
        let known: HashSet<&str> = table_names.iter().map(String::as_str).collect();
        let in_scope = |row: &Row| known.contains(row.get::<_, &str>(0));

        let row_counts = self.row_counts(schema, &table_names, filter.row_counts).await?;

        let mut objects: Vec<CatalogObject> = table_names
            .iter()
            .zip(row_counts)
            .map(|(name, row_count)| {
                CatalogObject::Table(Table {
                    schema: schema.to_string(),
                    name: name.clone(),
                    row_count,
                })
            })
            .collect();

        for row in self.fetch("columns", COLUMNS_SQL, schema).await? {
            if in_scope(&row) {
                objects.push(CatalogObject::Column(Column {
                    table: row.get(0),
                    name: row.get(1),
                    data_type: row.get(2),
                    nullable: row.get(3),
                    default: row.get(4),
                    max_length: row.get(5),
                    ordinal: row.get(6),
                }));
            }
        }

        for row in self.fetch("indexes", INDEXES_SQL, schema).await? {
            if in_scope(&row) {
                objects.push(CatalogObject::Index(Index {
                    table: row.get(0),
                    name: row.get(1),
                    definition: row.get(2),
                }));
            }
        }

        for row in self.fetch("foreign keys", FOREIGN_KEYS_SQL, schema).await? {
            if in_scope(&row) {
                objects.push(CatalogObject::ForeignKey(ForeignKey {
                    table: row.get(0),
                    constraint: row.get(1),
                    column: row.get(2),
                    ref_table: row.get(3),
                    ref_column: row.get(4),
                    position: row.get(5),
                }));
            }
        }

        for row in self.fetch("triggers", TRIGGERS_SQL, schema).await? {
            if in_scope(&row) {
                objects.push(CatalogObject::Trigger(Trigger {
                    table: row.get(0),
                    name: row.get(1),
                    function_name: row.get(2),
                }));
            }
        }

        for row in self.fetch("row security", ROW_SECURITY_SQL, schema).await? {
            if in_scope(&row) {
                objects.push(CatalogObject::RowSecurityState(RowSecurityState {
                    table: row.get(0),
                    enabled: row.get(1),
                }));
            }
        }

        for row in self.fetch("policies", POLICIES_SQL, schema).await? {
            if !in_scope(&row) {
                continue;
            }
            let cmd: Option<String> = row.get(2);
            let Some(command) = cmd.as_deref().and_then(PolicyCommand::parse) else {
                tracing::warn!(
                    table = row.get::<_, &str>(0),
                    policy = row.get::<_, &str>(1),
                    "skipping policy with unknown command {:?}",
                    cmd
                );
                continue;
            };
            objects.push(CatalogObject::RowSecurityPolicy(RowSecurityPolicy {
                table: row.get(0),
                name: row.get(1),
                command,
            }));
        }

        if filter.functions {
            for row in self.fetch("functions", FUNCTIONS_SQL, schema).await? {
                objects.push(CatalogObject::Function(Function {
                    name: row.get(0),
                    arguments: row.get(1),
                    return_type: row.get(2),
                }));
            }
        }

        Ok(objects)
    }

    async fn table_names(&self, schema: &str, filter: &SnapshotFilter) -> Result<Vec<String>> {
        let rows = self
            .conn
            .query(TABLES_SQL, &[&schema, &filter.tables])
            .await
            .map_err(|source| Error::CatalogUnavailable {
                stage: "tables",
                source,
            })?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// One entry per table, in the same order as `tables`.
    async fn row_counts(
        &self,
        schema: &str,
        tables: &[String],
        mode: RowCounts,
    ) -> Result<Vec<Option<u64>>> {
        match mode {
            RowCounts::Skip => Ok(vec![None; tables.len()]),
            RowCounts::Exact => {
                let mut counts = Vec::with_capacity(tables.len());
                for table in tables {
                    let sql = format!(
                        "SELECT COUNT(*) FROM {}.{}",
                        quote_ident(schema),
                        quote_ident(table)
                    );
                    let row = self.conn.query_one(&sql, &[]).await.map_err(|source| {
                        Error::CatalogUnavailable {
                            stage: "row counts",
                            source,
                        }
                    })?;
                    let count: i64 = row.get(0);
                    counts.push(u64::try_from(count).ok());
                }
                Ok(counts)
            }
            RowCounts::Estimated => {
                let rows = self.fetch("row estimates", ESTIMATES_SQL, schema).await?;
                let estimates: std::collections::HashMap<String, f64> = rows
                    .iter()
                    .map(|row| (row.get(0), row.get(1)))
                    .collect();
                Ok(tables
                    .iter()
                    .map(|t| {
                        estimates
                            .get(t)
                            .filter(|n| **n >= 0.0)
                            .map(|n| n.round() as u64)
                    })
                    .collect())
            }
        }
    }

    async fn fetch(&self, stage: &'static str, sql: &str, schema: &str) -> Result<Vec<Row>> {
        self.conn
            .query(sql, &[&schema])
            .await
            .map_err(|source| Error::CatalogUnavailable { stage, source })
    }
}
