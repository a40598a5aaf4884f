//! Extensions: the database pool, migrations and anything an application
//! plugs in alongside them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use diesel::migration::{Migration, MigrationSource};
use diesel::pg::Pg;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{FileBasedMigrations, MigrationHarness};

use crate::application::AppBuilder;
use crate::error::{Error, Result};
use crate::models::{self, EnumType, ModelRegistry, TableDef, UUID_EXTENSION_SQL};
use crate::settings::Settings;

/// Something initialized against the application while it is being built.
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    fn init_app(&self, app: &mut AppBuilder<'_>) -> Result<()>;
}

// ── db ──

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConn = Object<AsyncPgConnection>;

/// Pooled async PostgreSQL access.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Build the pool. Connections are opened lazily on first checkout.
    pub fn connect(database_url: &str, max_connections: usize) -> Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::connect(settings.database_url()?, settings.database_max_connections)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn conn(&self) -> Result<DbConn> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Pool(e.to_string()))
    }

    /// Create every registered table missing from the database.
    pub async fn create_all(&self, registry: &ModelRegistry) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let created = models::create_all(&mut conn, registry).await?;
        crate::metrics::tables_created(created.len());
        Ok(created)
    }

    /// Drop every registered table present in the database.
    pub async fn drop_all(&self, registry: &ModelRegistry) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        models::drop_all(&mut conn, registry).await
    }
}

pub struct DatabaseExtension;

impl Extension for DatabaseExtension {
    fn name(&self) -> &'static str {
        "db"
    }

    fn init_app(&self, app: &mut AppBuilder<'_>) -> Result<()> {
        let database = Database::from_settings(app.settings())?;
        app.set_database(database);
        Ok(())
    }
}

// ── migrate ──

/// `strftime` layout of the version prefix of a migration directory.
pub const MIGRATION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

const EMPTY_UP_SQL: &str = "-- Your SQL goes here\n";
const EMPTY_DOWN_SQL: &str = "-- This file should undo anything in `up.sql`\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationEntry {
    pub version: String,
    pub name: String,
    pub applied: bool,
}

/// File-based migrations, one `<version>_<slug>/{up,down}.sql` directory each.
#[derive(Clone, Debug)]
pub struct Migrate {
    directory: PathBuf,
    database_url: String,
}

impl Migrate {
    pub fn new(directory: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            database_url: database_url.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create the migrations directory. Refuses to touch a non-empty one.
    pub fn init(&self) -> Result<()> {
        let dir = &self.directory;
        if dir.exists() {
            let mut entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
            if entries.next().is_some() {
                return Err(Error::Migration(format!(
                    "directory {} already exists and is not empty",
                    dir.display()
                )));
            }
        }
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let keep = dir.join(".keep");
        std::fs::write(&keep, "").map_err(|e| Error::io(keep, e))?;
        tracing::info!(directory = %dir.display(), "Initialized migrations directory");
        Ok(())
    }

    /// Create an empty migration.
    pub fn revision(&self, message: &str) -> Result<PathBuf> {
        self.write_migration(message, EMPTY_UP_SQL, EMPTY_DOWN_SQL)
    }

    /// Write a migration with the given SQL and return its directory.
    pub fn write_migration(&self, message: &str, up_sql: &str, down_sql: &str) -> Result<PathBuf> {
        if !self.directory.is_dir() {
            return Err(Error::Migration(format!(
                "{} does not exist, run `db init` first",
                self.directory.display()
            )));
        }

        let prefix = self.next_version_prefix(Utc::now())?;
        let path = self.directory.join(format!("{prefix}_{}", slugify(message)));
        std::fs::create_dir(&path).map_err(|e| Error::io(&path, e))?;
        for (file, sql) in [("up.sql", up_sql), ("down.sql", down_sql)] {
            let file = path.join(file);
            std::fs::write(&file, sql).map_err(|e| Error::io(file, e))?;
        }

        tracing::info!(migration = %path.display(), "Generated migration");
        Ok(path)
    }

    /// First timestamp prefix at or after `now` not used by an existing migration.
    pub fn next_version_prefix(&self, now: DateTime<Utc>) -> Result<String> {
        let taken: HashSet<String> = std::fs::read_dir(&self.directory)
            .map_err(|e| Error::io(&self.directory, e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.split_once('_').map(|(prefix, _)| prefix.to_string())
            })
            .collect();

        let mut stamp = now;
        loop {
            let prefix = stamp.format(MIGRATION_TIMESTAMP_FORMAT).to_string();
            if !taken.contains(&prefix) {
                return Ok(prefix);
            }
            stamp += chrono::Duration::seconds(1);
        }
    }

    /// Write a migration creating the registered tables the database lacks.
    ///
    /// Returns `None` when every table already exists. The database must be
    /// up to date with the migrations directory first.
    pub async fn autogenerate(
        &self,
        db: &Database,
        registry: &ModelRegistry,
        message: &str,
    ) -> Result<Option<PathBuf>> {
        let pending = self.pending().await?;
        if !pending.is_empty() {
            return Err(Error::Migration(format!(
                "target database is not up to date ({} pending), run `db upgrade` first",
                pending.len()
            )));
        }

        let mut conn = db.conn().await?;
        let mut tables = Vec::new();
        for table in registry.tables() {
            if !models::table_exists(&mut conn, &table.name).await? {
                tables.push(table);
            }
        }
        if tables.is_empty() {
            return Ok(None);
        }

        let mut enums: Vec<EnumType> = Vec::new();
        for e in tables.iter().flat_map(|t| t.enums.iter()) {
            if enums.iter().any(|seen| seen.name == e.name) {
                continue;
            }
            if !models::type_exists(&mut conn, &e.name).await? {
                enums.push(e.clone());
            }
        }

        let (up, down) = render_autogenerated(&tables, &enums);
        self.write_migration(message, &up, &down).map(Some)
    }

    pub async fn pending(&self) -> Result<Vec<String>> {
        self.with_connection(|conn, dir| {
            let pending = conn
                .pending_migrations(source(dir)?)
                .map_err(migration_error)?;
            Ok(pending.iter().map(|m| m.name().to_string()).collect())
        })
        .await
    }

    /// Apply every pending migration. Returns the applied migration names.
    pub async fn upgrade(&self) -> Result<Vec<String>> {
        let applied = self
            .with_connection(|conn, dir| {
                let versions = conn
                    .run_pending_migrations(source(dir)?)
                    .map_err(migration_error)?;
                let versions: Vec<String> = versions.iter().map(ToString::to_string).collect();
                names_for(dir, &versions)
            })
            .await?;
        crate::metrics::migrations_applied(applied.len());
        Ok(applied)
    }

    /// Revert up to `steps` applied migrations, newest first.
    pub async fn downgrade(&self, steps: usize) -> Result<Vec<String>> {
        self.with_connection(move |conn, dir| {
            let applied = conn.applied_migrations().map_err(migration_error)?;
            let mut reverted = Vec::new();
            for _ in 0..steps.min(applied.len()) {
                let version = conn
                    .revert_last_migration(source(dir)?)
                    .map_err(migration_error)?;
                reverted.push(version.to_string());
            }
            names_for(dir, &reverted)
        })
        .await
    }

    /// Name of the newest applied migration.
    pub async fn current(&self) -> Result<Option<String>> {
        let history = self.history().await?;
        Ok(history
            .into_iter()
            .filter(|entry| entry.applied)
            .max_by(|a, b| a.version.cmp(&b.version))
            .map(|entry| entry.name))
    }

    /// Every migration in the directory, oldest first.
    pub async fn history(&self) -> Result<Vec<MigrationEntry>> {
        self.with_connection(|conn, dir| {
            let applied: HashSet<String> = conn
                .applied_migrations()
                .map_err(migration_error)?
                .iter()
                .map(ToString::to_string)
                .collect();
            Ok(list(dir)?
                .into_iter()
                .map(|(version, name)| MigrationEntry {
                    applied: applied.contains(&version),
                    version,
                    name,
                })
                .collect())
        })
        .await
    }

    /// Run `f` on a blocking connection; the migration harness is synchronous.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection, &Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let url = self.database_url.clone();
        let dir = self.directory.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&url)?;
            f(&mut conn, &dir)
        })
        .await
        .map_err(|e| Error::Migration(format!("migration task failed: {e}")))?
    }
}

pub struct MigrateExtension;

impl Extension for MigrateExtension {
    fn name(&self) -> &'static str {
        "migrate"
    }

    fn init_app(&self, app: &mut AppBuilder<'_>) -> Result<()> {
        let settings = app.settings();
        let migrate = Migrate::new(&settings.migrations_dir, settings.database_url()?);
        app.set_migrate(migrate);
        Ok(())
    }
}

fn source(dir: &Path) -> Result<FileBasedMigrations> {
    FileBasedMigrations::from_path(dir).map_err(|e| Error::Migration(e.to_string()))
}

fn migration_error(e: Box<dyn std::error::Error + Send + Sync>) -> Error {
    Error::Migration(e.to_string())
}

/// `(version, name)` of every migration in `dir`, ordered by version.
fn list(dir: &Path) -> Result<Vec<(String, String)>> {
    let migrations: Vec<Box<dyn Migration<Pg>>> =
        MigrationSource::<Pg>::migrations(&source(dir)?).map_err(migration_error)?;
    let mut entries: Vec<(String, String)> = migrations
        .iter()
        .map(|m| (m.name().version().to_string(), m.name().to_string()))
        .collect();
    entries.sort();
    Ok(entries)
}

fn names_for(dir: &Path, versions: &[String]) -> Result<Vec<String>> {
    let entries = list(dir)?;
    Ok(versions
        .iter()
        .map(|version| {
            entries
                .iter()
                .find(|(v, _)| v == version)
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| version.clone())
        })
        .collect())
}

/// `"Add notes table!"` -> `"add_notes_table"`.
pub fn slugify(message: &str) -> String {
    let slug = message
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() {
        "migration".to_string()
    } else {
        slug
    }
}

/// Up and down SQL for creating `tables` and the `enums` they introduce.
pub fn render_autogenerated(tables: &[&TableDef], enums: &[EnumType]) -> (String, String) {
    let mut up = String::from("-- Generated by `db migrate`\n\n");
    up.push_str(UUID_EXTENSION_SQL);
    up.push_str("\n\n");
    for e in enums {
        up.push_str(&e.create_sql());
        up.push_str("\n\n");
    }
    for table in tables {
        up.push_str(&table.create_sql());
        up.push('\n');
        for ddl in table.after_create() {
            up.push_str(ddl);
        }
        up.push('\n');
    }

    let mut down = String::from("-- Generated by `db migrate`\n\n");
    for table in tables.iter().rev() {
        down.push_str(&table.drop_sql());
        down.push('\n');
    }
    for e in enums.iter().rev() {
        down.push_str(&e.drop_sql());
        down.push('\n');
    }
    (up, down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{enum_type, Column, Model};

    struct Ticket;

    impl Model for Ticket {
        const TABLE: &'static str = "tickets";

        fn columns() -> Vec<Column> {
            vec![Column::new("state", "ticket_state NOT NULL")]
        }
    }

    fn migrate_in(dir: &Path) -> Migrate {
        Migrate::new(dir.join("migrations"), "postgres://localhost/unused")
    }

    #[test]
    fn slugify_messages() {
        assert_eq!(slugify("Add notes table!"), "add_notes_table");
        assert_eq!(slugify("  --  "), "migration");
        assert_eq!(slugify("v2: tags & notes"), "v2_tags_notes");
    }

    #[test]
    fn init_creates_directory_once() {
        let dir = tempfile::tempdir().unwrap();
        let migrate = migrate_in(dir.path());

        migrate.init().unwrap();
        assert!(migrate.directory().join(".keep").exists());
        assert!(matches!(migrate.init(), Err(Error::Migration(_))));
    }

    #[test]
    fn revision_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let migrate = migrate_in(dir.path());
        assert!(matches!(migrate.revision("first"), Err(Error::Migration(_))));
    }

    #[test]
    fn revision_writes_up_and_down() {
        let dir = tempfile::tempdir().unwrap();
        let migrate = migrate_in(dir.path());
        migrate.init().unwrap();

        let path = migrate.revision("Create tags").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_create_tags"));
        assert_eq!(name.len(), "2026-01-01-000000_create_tags".len());
        assert_eq!(std::fs::read_to_string(path.join("up.sql")).unwrap(), EMPTY_UP_SQL);
        assert!(path.join("down.sql").exists());
    }

    #[test]
    fn version_prefix_skips_taken_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let migrate = migrate_in(dir.path());
        migrate.init().unwrap();

        let now = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        std::fs::create_dir(migrate.directory().join("2026-03-04-050607_first")).unwrap();
        std::fs::create_dir(migrate.directory().join("2026-03-04-050608_second")).unwrap();

        assert_eq!(
            migrate.next_version_prefix(now).unwrap(),
            "2026-03-04-050609"
        );
    }

    #[test]
    fn autogenerated_sql_orders_statements() {
        let table = Ticket::table_def();
        let enums = vec![enum_type("TicketState", &["open", "closed"])];
        let (up, down) = render_autogenerated(&[&table], &enums);

        let ext = up.find("uuid-ossp").unwrap();
        let ty = up.find("CREATE TYPE ticket_state").unwrap();
        let create = up.find("CREATE TABLE tickets").unwrap();
        let trigger = up.find("BEFORE UPDATE ON\n    tickets").unwrap();
        assert!(ext < ty && ty < create && create < trigger);

        let drop_table = down.find("DROP TABLE IF EXISTS tickets;").unwrap();
        let drop_type = down.find("DROP TYPE IF EXISTS ticket_state;").unwrap();
        assert!(drop_table < drop_type);
    }

    fn dir_name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn database_url_must_be_set_for_migrate_extension() {
        let settings = Settings::from_toml_str("[development]\n", "development").unwrap();
        assert!(matches!(settings.database_url(), Err(Error::Settings(_))));
    }

    // Needs a PostgreSQL server; skipped unless DATABASE_URL is set.
    #[tokio::test]
    async fn upgrade_downgrade_and_history_round_trip() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let migrate = Migrate::new(dir.path().join("migrations"), url);
        migrate.init().unwrap();

        let table = format!("axumplus_round_trip_{}", uuid::Uuid::new_v4().simple());
        let first = migrate
            .write_migration(
                "create table",
                &format!("CREATE TABLE {table} (id INT);"),
                &format!("DROP TABLE {table};"),
            )
            .unwrap();
        let second = migrate
            .write_migration(
                "add name",
                &format!("ALTER TABLE {table} ADD COLUMN name TEXT;"),
                &format!("ALTER TABLE {table} DROP COLUMN name;"),
            )
            .unwrap();
        let (first, second) = (dir_name(&first), dir_name(&second));

        let history = migrate.history().await.unwrap();
        assert_eq!(
            history.iter().map(|e| (e.name.as_str(), e.applied)).collect::<Vec<_>>(),
            [(first.as_str(), false), (second.as_str(), false)]
        );
        assert_eq!(migrate.pending().await.unwrap(), [first.clone(), second.clone()]);

        assert_eq!(migrate.upgrade().await.unwrap(), [first.clone(), second.clone()]);
        assert_eq!(migrate.current().await.unwrap(), Some(second.clone()));
        assert!(migrate.upgrade().await.unwrap().is_empty());

        assert_eq!(migrate.downgrade(1).await.unwrap(), [second.clone()]);
        let history = migrate.history().await.unwrap();
        assert!(history[0].applied);
        assert!(!history[1].applied);
        assert_eq!(migrate.current().await.unwrap(), Some(first.clone()));

        assert_eq!(migrate.downgrade(1).await.unwrap(), [first]);
        assert_eq!(migrate.current().await.unwrap(), None);
    }
}
