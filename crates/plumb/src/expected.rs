//! The declarative description of what a schema should contain.
//!
//! An [`ExpectedSchemaSpec`] is built once, validated eagerly, and then only
//! read. It can be assembled in code with [`SpecBuilder`] or loaded from a
//! TOML [`Declaration`]:
//!
//! ```toml
//! schema = "public"
//! tables = ["orders"]
//! functions = ["submit_report"]
//!
//! [[groups]]
//! name = "Manufacturing"
//! tables = ["suppliers", "materials"]
//!
//! [requirements.orders]
//! columns = ["id", "total"]
//! indexes = ["orders_pkey", "idx_orders_*"]
//! policies = ["select"]
//! triggers = ["orders_audit"]
//! row_security = true
//! ```

use crate::catalog::PolicyCommand;
use crate::error::SpecError;
use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_SCHEMA: &str = "public";

/// Sub-objects a present table must also have.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableRequirements {
    #[serde(default)]
    pub columns: Vec<String>,
    /// Index names; `*` matches any run of characters.
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub policies: Vec<PolicyCommand>,
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Row-level security must be enabled.
    #[serde(default)]
    pub row_security: bool,
}

impl TableRequirements {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
            && self.indexes.is_empty()
            && self.policies.is_empty()
            && self.triggers.is_empty()
            && !self.row_security
    }

    fn merge(&mut self, other: TableRequirements) {
        extend_unique(&mut self.columns, other.columns);
        extend_unique(&mut self.indexes, other.indexes);
        extend_unique(&mut self.policies, other.policies);
        extend_unique(&mut self.triggers, other.triggers);
        self.row_security |= other.row_security;
    }
}

fn extend_unique<T: PartialEq>(into: &mut Vec<T>, items: Vec<T>) {
    for item in items {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

/// One table the schema must contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedTable {
    pub name: String,
    /// Subsystem the table belongs to, if any.
    pub group: Option<String>,
    pub requirements: TableRequirements,
}

/// A validated expected-schema declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSchemaSpec {
    schema: String,
    groups: Vec<String>,
    tables: IndexMap<String, ExpectedTable>,
    functions: Vec<String>,
}

impl ExpectedSchemaSpec {
    pub fn builder() -> SpecBuilder {
        SpecBuilder::default()
    }

    /// Parse and validate a TOML declaration.
    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(Declaration::from_toml(source)?.into_spec()?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Declaration::from_file(path)?.into_spec()?)
    }

    /// Schema namespace the tables live in.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Group names, in declaration order.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Expected tables, in declaration order.
    pub fn tables(&self) -> impl Iterator<Item = &ExpectedTable> {
        self.tables.values()
    }

    pub fn table(&self, name: &str) -> Option<&ExpectedTable> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.functions.is_empty()
    }
}

/// Assembles an [`ExpectedSchemaSpec`]; all checks happen in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    schema: String,
    entries: Vec<(String, Option<String>)>,
    groups: Vec<String>,
    requirements: Vec<(String, TableRequirements)>,
    functions: Vec<String>,
}

impl Default for SpecBuilder {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            entries: Vec::new(),
            groups: Vec::new(),
            requirements: Vec::new(),
            functions: Vec::new(),
        }
    }
}

impl SpecBuilder {
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Expect an ungrouped table.
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.entries.push((name.into(), None));
        self
    }

    /// Expect several ungrouped tables.
    pub fn tables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .extend(names.into_iter().map(|n| (n.into(), None)));
        self
    }

    /// Expect a named subsystem of tables.
    pub fn group<I, S>(mut self, group: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group = group.into();
        self.entries
            .extend(names.into_iter().map(|n| (n.into(), Some(group.clone()))));
        self.groups.push(group);
        self
    }

    /// Attach requirements to an expected table. Repeated calls merge.
    pub fn require(mut self, table: impl Into<String>, requirements: TableRequirements) -> Self {
        self.requirements.push((table.into(), requirements));
        self
    }

    pub fn require_columns<I, S>(self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require(
            table,
            TableRequirements {
                columns: columns.into_iter().map(Into::into).collect(),
                ..Default::default()
            },
        )
    }

    pub fn require_indexes<I, S>(self, table: impl Into<String>, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require(
            table,
            TableRequirements {
                indexes: indexes.into_iter().map(Into::into).collect(),
                ..Default::default()
            },
        )
    }

    pub fn require_policies(
        self,
        table: impl Into<String>,
        policies: impl IntoIterator<Item = PolicyCommand>,
    ) -> Self {
        self.require(
            table,
            TableRequirements {
                policies: policies.into_iter().collect(),
                ..Default::default()
            },
        )
    }

    /// Expect a user-defined function (any overload).
    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.functions.push(name.into());
        self
    }

    pub fn build(self) -> std::result::Result<ExpectedSchemaSpec, SpecError> {
        if self.schema.trim().is_empty() {
            return Err(SpecError::EmptySchema);
        }

        let mut seen_groups = HashSet::new();
        for group in &self.groups {
            if group.trim().is_empty() {
                return Err(SpecError::EmptyName { what: "group" });
            }
            if !seen_groups.insert(group.as_str()) {
                return Err(SpecError::DuplicateGroup(group.clone()));
            }
        }

        let mut tables: IndexMap<String, ExpectedTable> = IndexMap::new();
        for (name, group) in self.entries {
            if name.trim().is_empty() {
                return Err(SpecError::EmptyName { what: "table" });
            }
            if let Some(existing) = tables.get(&name) {
                return Err(SpecError::DuplicateTable {
                    first: placement(existing.group.as_deref()),
                    second: placement(group.as_deref()),
                    table: name,
                });
            }
            tables.insert(
                name.clone(),
                ExpectedTable {
                    name,
                    group,
                    requirements: TableRequirements::default(),
                },
            );
        }

        for (table, requirements) in self.requirements {
            match tables.get_mut(&table) {
                Some(expected) => expected.requirements.merge(requirements),
                None => return Err(SpecError::OrphanRequirement { table }),
            }
        }

        let mut seen_functions = HashSet::new();
        for function in &self.functions {
            if function.trim().is_empty() {
                return Err(SpecError::EmptyName { what: "function" });
            }
            if !seen_functions.insert(function.as_str()) {
                return Err(SpecError::DuplicateFunction(function.clone()));
            }
        }

        Ok(ExpectedSchemaSpec {
            schema: self.schema,
            groups: self.groups,
            tables,
            functions: self.functions,
        })
    }
}

fn placement(group: Option<&str>) -> String {
    match group {
        Some(group) => format!("group `{}`", group),
        None => "the ungrouped tables".to_string(),
    }
}

/// The on-disk (TOML) form of an [`ExpectedSchemaSpec`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub groups: Vec<GroupDeclaration>,
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub requirements: IndexMap<String, TableRequirements>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDeclaration {
    pub name: String,
    pub tables: Vec<String>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl Declaration {
    /// Parse without validating; see [`into_spec`](Self::into_spec).
    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&source)
    }

    pub fn into_spec(self) -> std::result::Result<ExpectedSchemaSpec, SpecError> {
        let mut builder = ExpectedSchemaSpec::builder()
            .schema(self.schema)
            .tables(self.tables);
        for group in self.groups {
            builder = builder.group(group.name, group.tables);
        }
        for (table, requirements) in self.requirements {
            builder = builder.require(table, requirements);
        }
        for function in self.functions {
            builder = builder.function(function);
        }
        builder.build()
    }
}

/// Match an index name against a pattern where `*` stands for any run of
/// characters (including none). Without `*` the match is exact.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let [first, middle @ .., last] = parts.as_slice() else {
        return pattern == name;
    };

    let Some(mut remaining) = name.strip_prefix(first) else {
        return false;
    };
    for part in middle {
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}
