//! Catalog objects and point-in-time schema snapshots.
//!
//! A [`SchemaSnapshot`] holds every [`CatalogObject`] read from one schema
//! namespace in a single pass. Snapshots are immutable and deterministically
//! ordered, so two snapshots of an unchanged schema compare equal:
//!
//! - tables in lexicographic order, each followed by its own objects
//! - columns by ordinal position
//! - indexes, triggers and policies by name
//! - foreign keys by constraint name, then key position
//! - functions last, by name and argument list

use crate::error::SnapshotError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub schema: String,
    pub name: String,
    /// `None` when row counting was skipped or no estimate exists.
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub max_length: Option<i32>,
    /// 1-based declared position.
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Index {
    pub table: String,
    pub name: String,
    /// `CREATE INDEX` statement as reported by the server.
    pub definition: String,
}

/// One column pair of a foreign-key constraint.
///
/// Composite keys show up as several entries sharing `constraint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub table: String,
    pub constraint: String,
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
    /// 1-based position within the constraint.
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub table: String,
    pub name: String,
    pub function_name: String,
}

/// A user-defined function in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Function {
    pub name: String,
    pub arguments: String,
    pub return_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSecurityPolicy {
    pub table: String,
    pub name: String,
    pub command: PolicyCommand,
}

/// Whether row-level security is enabled on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSecurityState {
    pub table: String,
    pub enabled: bool,
}

/// The command a row-security policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCommand {
    #[serde(alias = "SELECT")]
    Select,
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
    #[serde(alias = "ALL")]
    All,
}

impl PolicyCommand {
    /// Parse the `cmd` column of `pg_policies` (`SELECT`, ..., `ALL`), case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SELECT" => Some(Self::Select),
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }

    /// Does a policy for `self` also govern `required`?
    pub fn covers(self, required: PolicyCommand) -> bool {
        self == required || self == PolicyCommand::All
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::All => "ALL",
        }
    }
}

impl fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// One live database object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogObject {
    Table(Table),
    Column(Column),
    Index(Index),
    ForeignKey(ForeignKey),
    Trigger(Trigger),
    Function(Function),
    RowSecurityPolicy(RowSecurityPolicy),
    RowSecurityState(RowSecurityState),
}

/// Object kinds, in the order they appear under a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    Column,
    Index,
    ForeignKey,
    Trigger,
    RowSecurityPolicy,
    RowSecurityState,
    Function,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::Index => "index",
            Self::ForeignKey => "foreign key",
            Self::Trigger => "trigger",
            Self::RowSecurityPolicy => "policy",
            Self::RowSecurityState => "row security",
            Self::Function => "function",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an object within a snapshot's schema.
///
/// `table` is `None` for schema-level objects (tables and functions).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub table: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Table,
            table: None,
            name: name.into(),
        }
    }

    pub fn scoped(kind: ObjectKind, table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            table: Some(table.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{} {}.{}", self.kind, table, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

impl CatalogObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Table(_) => ObjectKind::Table,
            Self::Column(_) => ObjectKind::Column,
            Self::Index(_) => ObjectKind::Index,
            Self::ForeignKey(_) => ObjectKind::ForeignKey,
            Self::Trigger(_) => ObjectKind::Trigger,
            Self::Function(_) => ObjectKind::Function,
            Self::RowSecurityPolicy(_) => ObjectKind::RowSecurityPolicy,
            Self::RowSecurityState(_) => ObjectKind::RowSecurityState,
        }
    }

    /// The table this object belongs to, if it is table-scoped.
    pub fn owning_table(&self) -> Option<&str> {
        match self {
            Self::Table(_) | Self::Function(_) => None,
            Self::Column(c) => Some(c.table.as_str()),
            Self::Index(i) => Some(i.table.as_str()),
            Self::ForeignKey(fk) => Some(fk.table.as_str()),
            Self::Trigger(t) => Some(t.table.as_str()),
            Self::RowSecurityPolicy(p) => Some(p.table.as_str()),
            Self::RowSecurityState(s) => Some(s.table.as_str()),
        }
    }

    pub fn key(&self) -> ObjectKey {
        let kind = self.kind();
        match self {
            Self::Table(t) => ObjectKey::table(&t.name),
            Self::Function(f) => ObjectKey {
                kind,
                table: None,
                name: format!("{}({})", f.name, f.arguments),
            },
            Self::Column(c) => ObjectKey::scoped(kind, &c.table, &c.name),
            Self::Index(i) => ObjectKey::scoped(kind, &i.table, &i.name),
            Self::ForeignKey(fk) => {
                ObjectKey::scoped(kind, &fk.table, format!("{}({})", fk.constraint, fk.column))
            }
            Self::Trigger(t) => ObjectKey::scoped(kind, &t.table, &t.name),
            Self::RowSecurityPolicy(p) => ObjectKey::scoped(kind, &p.table, &p.name),
            Self::RowSecurityState(s) => ObjectKey::scoped(kind, &s.table, "row_security"),
        }
    }

    /// Position of this object in a snapshot; see the module docs.
    fn sort_key(&self) -> (u8, &str, ObjectKind, &str, i64, &str) {
        let kind = self.kind();
        match self {
            Self::Table(t) => (0, t.name.as_str(), kind, "", 0, ""),
            Self::Column(c) => (0, c.table.as_str(), kind, "", i64::from(c.ordinal), c.name.as_str()),
            Self::Index(i) => (0, i.table.as_str(), kind, i.name.as_str(), 0, ""),
            Self::ForeignKey(fk) => (
                0,
                fk.table.as_str(),
                kind,
                fk.constraint.as_str(),
                i64::from(fk.position),
                fk.column.as_str(),
            ),
            Self::Trigger(t) => (0, t.table.as_str(), kind, t.name.as_str(), 0, ""),
            Self::RowSecurityPolicy(p) => (0, p.table.as_str(), kind, p.name.as_str(), 0, ""),
            Self::RowSecurityState(s) => (0, s.table.as_str(), kind, "", 0, ""),
            Self::Function(f) => (1, "", kind, f.name.as_str(), 0, f.arguments.as_str()),
        }
    }
}

/// An immutable, ordered read of one schema namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    schema: String,
    objects: IndexMap<ObjectKey, CatalogObject>,
}

impl SchemaSnapshot {
    /// Build a snapshot, normalising order and checking that every
    /// table-scoped object references a table in the same set.
    pub fn from_objects(
        schema: impl Into<String>,
        objects: impl IntoIterator<Item = CatalogObject>,
    ) -> Result<Self, SnapshotError> {
        let mut objects: Vec<CatalogObject> = objects.into_iter().collect();

        let tables: HashSet<String> = objects
            .iter()
            .filter_map(|o| match o {
                CatalogObject::Table(t) => Some(t.name.clone()),
                _ => None,
            })
            .collect();

        for object in &objects {
            if let Some(table) = object.owning_table()
                && !tables.contains(table)
            {
                return Err(SnapshotError::OrphanObject {
                    kind: object.kind().as_str(),
                    name: object.key().name,
                    table: table.to_string(),
                });
            }
        }

        objects.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut map = IndexMap::with_capacity(objects.len());
        for object in objects {
            let key = object.key();
            if map.contains_key(&key) {
                return Err(SnapshotError::Duplicate {
                    kind: key.kind.as_str(),
                    name: key.to_string(),
                });
            }
            map.insert(key, object);
        }

        Ok(Self {
            schema: schema.into(),
            objects: map,
        })
    }

    /// An empty snapshot of `schema`.
    pub fn empty(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            objects: IndexMap::new(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects, in snapshot order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogObject> {
        self.objects.values()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&CatalogObject> {
        self.objects.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.iter().filter_map(|o| match o {
            CatalogObject::Table(t) => Some(t),
            _ => None,
        })
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        match self.objects.get(&ObjectKey::table(name)) {
            Some(CatalogObject::Table(t)) => Some(t),
            _ => None,
        }
    }

    fn scoped<'s>(&'s self, table: &'s str) -> impl Iterator<Item = &'s CatalogObject> + 's {
        self.iter().filter(move |o| o.owning_table() == Some(table))
    }

    pub fn columns<'s>(&'s self, table: &'s str) -> impl Iterator<Item = &'s Column> + 's {
        self.scoped(table).filter_map(|o| match o {
            CatalogObject::Column(c) => Some(c),
            _ => None,
        })
    }

    pub fn indexes<'s>(&'s self, table: &'s str) -> impl Iterator<Item = &'s Index> + 's {
        self.scoped(table).filter_map(|o| match o {
            CatalogObject::Index(i) => Some(i),
            _ => None,
        })
    }

    pub fn foreign_keys<'s>(&'s self, table: &'s str) -> impl Iterator<Item = &'s ForeignKey> + 's {
        self.scoped(table).filter_map(|o| match o {
            CatalogObject::ForeignKey(fk) => Some(fk),
            _ => None,
        })
    }

    pub fn triggers<'s>(&'s self, table: &'s str) -> impl Iterator<Item = &'s Trigger> + 's {
        self.scoped(table).filter_map(|o| match o {
            CatalogObject::Trigger(t) => Some(t),
            _ => None,
        })
    }

    pub fn policies<'s>(
        &'s self,
        table: &'s str,
    ) -> impl Iterator<Item = &'s RowSecurityPolicy> + 's {
        self.scoped(table).filter_map(|o| match o {
            CatalogObject::RowSecurityPolicy(p) => Some(p),
            _ => None,
        })
    }

    /// `None` if the row-security state of `table` was not read.
    pub fn row_security(&self, table: &str) -> Option<bool> {
        match self
            .objects
            .get(&ObjectKey::scoped(ObjectKind::RowSecurityState, table, "row_security"))
        {
            Some(CatalogObject::RowSecurityState(s)) => Some(s.enabled),
            _ => None,
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.iter().filter_map(|o| match o {
            CatalogObject::Function(f) => Some(f),
            _ => None,
        })
    }

    /// Count objects of each kind.
    pub fn kind_counts(&self) -> IndexMap<ObjectKind, usize> {
        let mut counts = IndexMap::new();
        for object in self.iter() {
            *counts.entry(object.kind()).or_insert(0) += 1;
        }
        counts.sort_keys();
        counts
    }
}

impl Serialize for SchemaSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr<'a> {
            schema: &'a str,
            objects: Vec<&'a CatalogObject>,
        }

        Repr {
            schema: &self.schema,
            objects: self.objects.values().collect(),
        }
        .serialize(serializer)
    }
}
