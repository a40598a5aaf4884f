//! Base model: UUID primary key plus `created`/`modified` timestamps.
//!
//! Every table built from a [`Model`] gets the three base columns and a
//! `BEFORE UPDATE` trigger that stamps `modified`. The trigger is installed
//! right after the table is created, once per table.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use regex::Regex;

use crate::error::{Error, Result};

/// Name of the trigger function shared by all base-model tables.
pub const MODIFIED_TRIGGER_FUNCTION: &str = "ModelBase_update_modified";

pub const UUID_EXTENSION_SQL: &str = r#"CREATE EXTENSION IF NOT EXISTS "uuid-ossp";"#;

const UTC_NOW_DEFAULT: &str = "DEFAULT TIMEZONE('utc', CURRENT_TIMESTAMP)";

static ACRONYM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap());
static CAMEL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([a-z\d])([A-Z])").unwrap());

/// Turn a CamelCase name into snake_case: `HTTPStatusCode` -> `http_status_code`.
pub fn underscore(word: &str) -> String {
    let word = ACRONYM_REGEX.replace_all(word, "${1}_${2}");
    let word = CAMEL_REGEX.replace_all(&word, "${1}_${2}");
    word.replace('-', "_").to_lowercase()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Type and constraints, e.g. `VARCHAR(255) NOT NULL`.
    pub definition: String,
}

impl Column {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
        }
    }

    pub fn sql(&self) -> String {
        format!("{} {}", self.name, self.definition)
    }
}

/// Columns every base model starts with.
pub fn base_columns() -> Vec<Column> {
    vec![
        Column::new("uuid", "UUID PRIMARY KEY DEFAULT uuid_generate_v4()"),
        Column::new("created", format!("TIMESTAMPTZ {UTC_NOW_DEFAULT}")),
        Column::new("modified", format!("TIMESTAMPTZ {UTC_NOW_DEFAULT}")),
    ]
}

/// A PostgreSQL ENUM type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub labels: Vec<String>,
}

impl EnumType {
    pub fn new<L: AsRef<str>>(name: impl Into<String>, labels: &[L]) -> Self {
        Self {
            name: name.into(),
            labels: labels.iter().map(|l| l.as_ref().to_string()).collect(),
        }
    }

    /// `CREATE TYPE`, skipped when the type already exists.
    pub fn create_sql(&self) -> String {
        let labels = self
            .labels
            .iter()
            .map(|l| format!("'{}'", l.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "DO $$ BEGIN\n    CREATE TYPE {} AS ENUM ({labels});\nEXCEPTION\n    WHEN duplicate_object THEN NULL;\nEND $$;",
            self.name
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TYPE IF EXISTS {};", self.name)
    }
}

/// A Rust enum stored as a PostgreSQL ENUM.
///
/// The type is named after the Rust type, underscored: `NoteStatus` maps to
/// `note_status`.
pub trait DbEnum {
    /// The Rust type name, CamelCase.
    const NAME: &'static str;
    const LABELS: &'static [&'static str];

    fn enum_type() -> EnumType {
        enum_type(Self::NAME, Self::LABELS)
    }
}

/// Build an ENUM type from a CamelCase type name and its labels.
pub fn enum_type<L: AsRef<str>>(type_name: &str, labels: &[L]) -> EnumType {
    EnumType::new(underscore(type_name), labels)
}

/// DDL for a table, plus the statements run after it is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<Column>,
    /// Table-level constraints such as `UNIQUE (name)`.
    pub constraints: Vec<String>,
    pub enums: Vec<EnumType>,
    after_create: Vec<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
            enums: Vec::new(),
            after_create: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, definition: impl Into<String>) -> Self {
        self.columns.push(Column::new(name, definition));
        self
    }

    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Queue DDL to run right after this table is created.
    pub fn listen_after_create(&mut self, ddl: impl Into<String>) {
        self.after_create.push(ddl.into());
    }

    pub fn after_create(&self) -> &[String] {
        &self.after_create
    }

    pub fn create_sql(&self) -> String {
        let body = self
            .columns
            .iter()
            .map(Column::sql)
            .chain(self.constraints.iter().cloned())
            .map(|line| format!("    {line}"))
            .collect::<Vec<_>>()
            .join(",\n");
        format!("CREATE TABLE {} (\n{body}\n);", self.name)
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", self.name)
    }
}

/// DDL creating the shared `modified` function and the trigger on `table`.
pub fn modified_trigger_sql(table: &str) -> String {
    let func_name = MODIFIED_TRIGGER_FUNCTION;
    format!(
        r#"
-- Create the global modified function

CREATE OR REPLACE FUNCTION {func_name}()
    RETURNS trigger AS $$
BEGIN
  NEW.modified := NOW();

  RETURN NEW;
END;
$$ LANGUAGE PLPGSQL;


-- Apply the trigger to the table
CREATE TRIGGER
    {func_name}
BEFORE UPDATE ON
    {table}
FOR EACH ROW EXECUTE PROCEDURE
  {func_name}();
"#
    )
}

/// Install the `modified` trigger on `table` once it has been created.
pub fn register_modified_update_trigger(table: &mut TableDef) {
    let ddl = modified_trigger_sql(&table.name);
    table.listen_after_create(ddl);
}

/// A table built on the base model.
pub trait Model {
    const TABLE: &'static str;

    /// Columns besides `uuid`, `created` and `modified`.
    fn columns() -> Vec<Column>;

    fn constraints() -> Vec<String> {
        Vec::new()
    }

    /// ENUM types the columns reference.
    fn enums() -> Vec<EnumType> {
        Vec::new()
    }

    fn table_def() -> TableDef {
        let mut columns = base_columns();
        columns.extend(Self::columns());

        let mut table = TableDef::new(Self::TABLE);
        table.columns = columns;
        table.constraints = Self::constraints();
        table.enums = Self::enums();
        register_modified_update_trigger(&mut table);
        table
    }
}

/// Registered tables, in creation order.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    tables: Vec<TableDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Model>(&mut self) {
        self.register_table(M::table_def());
    }

    /// Add a table; a table with the same name is replaced in place.
    pub fn register_table(&mut self, table: TableDef) {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// ENUM types referenced by the registered tables, first use wins.
    pub fn enums(&self) -> Vec<EnumType> {
        let mut enums: Vec<EnumType> = Vec::new();
        for e in self.tables.iter().flat_map(|t| t.enums.iter()) {
            if !enums.iter().any(|seen| seen.name == e.name) {
                enums.push(e.clone());
            }
        }
        enums
    }
}

#[derive(QueryableByName)]
struct Exists {
    #[diesel(sql_type = Bool)]
    present: bool,
}

pub async fn table_exists(conn: &mut AsyncPgConnection, table: &str) -> Result<bool> {
    let row: Exists = diesel::sql_query("SELECT to_regclass($1) IS NOT NULL AS present")
        .bind::<Text, _>(table)
        .get_result(conn)
        .await?;
    Ok(row.present)
}

pub async fn type_exists(conn: &mut AsyncPgConnection, type_name: &str) -> Result<bool> {
    let row: Exists = diesel::sql_query("SELECT to_regtype($1) IS NOT NULL AS present")
        .bind::<Text, _>(type_name)
        .get_result(conn)
        .await?;
    Ok(row.present)
}

/// DDL to run against the database, in order, and the tables it creates or drops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaPlan {
    pub tables: Vec<String>,
    pub statements: Vec<String>,
}

/// Statements creating the registered tables missing from `existing`.
///
/// The extension and ENUM types come first, then each missing table in
/// registration order followed by its after-create hooks. Tables already in
/// `existing` contribute nothing, so their hooks never run twice.
pub fn plan_create(registry: &ModelRegistry, existing: &HashSet<String>) -> SchemaPlan {
    let mut plan = SchemaPlan::default();
    plan.statements.push(UUID_EXTENSION_SQL.to_string());
    plan.statements
        .extend(registry.enums().iter().map(EnumType::create_sql));

    for table in registry.tables() {
        if existing.contains(&table.name) {
            continue;
        }
        plan.statements.push(table.create_sql());
        plan.statements.extend(table.after_create().iter().cloned());
        plan.tables.push(table.name.clone());
    }
    plan
}

/// Statements dropping the registered tables in `existing`, newest first,
/// then the trigger function and the ENUM types the tables used.
pub fn plan_drop(registry: &ModelRegistry, existing: &HashSet<String>) -> SchemaPlan {
    let mut plan = SchemaPlan::default();
    for table in registry.tables().iter().rev() {
        if !existing.contains(&table.name) {
            continue;
        }
        plan.statements.push(table.drop_sql());
        plan.tables.push(table.name.clone());
    }
    plan.statements.push(drop_trigger_function_sql());
    plan.statements
        .extend(registry.enums().iter().rev().map(EnumType::drop_sql));
    plan
}

/// Drop the shared trigger function once no trigger uses it any more.
pub fn drop_trigger_function_sql() -> String {
    let func_name = MODIFIED_TRIGGER_FUNCTION;
    let proname = func_name.to_lowercase();
    format!(
        r#"DO $$ BEGIN
    IF NOT EXISTS (
        SELECT 1 FROM pg_trigger t JOIN pg_proc p ON p.oid = t.tgfoid
        WHERE p.proname = '{proname}'
    ) THEN
        DROP FUNCTION IF EXISTS {func_name}();
    END IF;
END $$;"#
    )
}

/// Names of the registered tables present in the database.
pub async fn existing_tables(
    conn: &mut AsyncPgConnection,
    registry: &ModelRegistry,
) -> Result<HashSet<String>> {
    let mut existing = HashSet::new();
    for table in registry.tables() {
        if table_exists(conn, &table.name).await? {
            existing.insert(table.name.clone());
        }
    }
    Ok(existing)
}

async fn execute_plan(conn: &mut AsyncPgConnection, plan: &SchemaPlan) -> Result<()> {
    for statement in &plan.statements {
        conn.batch_execute(statement).await?;
    }
    Ok(())
}

/// Create every registered table that does not exist yet.
///
/// After-create hooks (the `modified` trigger) run only for tables created
/// by this call. Returns the names of the created tables.
pub async fn create_all(
    conn: &mut AsyncPgConnection,
    registry: &ModelRegistry,
) -> Result<Vec<String>> {
    conn.transaction::<_, Error, _>(|conn| {
        async move {
            let existing = existing_tables(conn, registry).await?;
            let plan = plan_create(registry, &existing);
            execute_plan(conn, &plan).await?;
            for table in &plan.tables {
                tracing::info!(table = %table, "Created table");
            }
            Ok(plan.tables)
        }
        .scope_boxed()
    })
    .await
}

/// Drop every registered table that exists, newest first, then the trigger
/// function and the ENUM types.
pub async fn drop_all(
    conn: &mut AsyncPgConnection,
    registry: &ModelRegistry,
) -> Result<Vec<String>> {
    conn.transaction::<_, Error, _>(|conn| {
        async move {
            let existing = existing_tables(conn, registry).await?;
            let plan = plan_drop(registry, &existing);
            execute_plan(conn, &plan).await?;
            for table in &plan.tables {
                tracing::info!(table = %table, "Dropped table");
            }
            Ok(plan.tables)
        }
        .scope_boxed()
    })
    .await
}

/// A model that can be looked up by, or created from, a set of field values.
#[async_trait]
pub trait GetOrCreate: Sized + Send {
    type Fields: Send + Sync;

    async fn find_by(conn: &mut AsyncPgConnection, fields: &Self::Fields)
        -> QueryResult<Option<Self>>;

    async fn create_from(conn: &mut AsyncPgConnection, fields: Self::Fields)
        -> QueryResult<Self>;
}

/// Fetch the row matching `fields`, or insert one. Returns `(row, created)`.
///
/// Runs on the caller's connection and neither opens nor commits a
/// transaction; wrap the call in one to keep the insert uncommitted.
pub async fn get_or_create<M: GetOrCreate>(
    conn: &mut AsyncPgConnection,
    fields: M::Fields,
) -> Result<(M, bool)> {
    if let Some(found) = M::find_by(conn, &fields).await? {
        return Ok((found, false));
    }
    let created = M::create_from(conn, fields).await?;
    Ok((created, true))
}
