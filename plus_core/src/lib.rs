//! AxumPlus: application scaffolding for axum + diesel services.
//!
//! Bundles the pieces every service on this stack ends up writing:
//! profile-based settings, extension wiring (database pool, migrations,
//! debug toolbar), logging with rotating files, error pages, blueprint
//! registration, a UUID/timestamp base model and management commands.

pub mod application;
pub mod blueprint;
pub mod error;
pub mod error_pages;
pub mod extensions;
pub mod logging;
pub mod management;
pub mod metrics;
pub mod models;
pub mod settings;
pub mod templates;
pub mod toolbar;

pub use application::{App, AppState, Application};
pub use blueprint::Blueprint;
pub use error::{Error, Result};
pub use error_pages::HttpError;
pub use extensions::{Database, Extension, Migrate};
pub use management::{get_manager, Manager};
pub use models::{get_or_create, DbEnum, GetOrCreate, Model, ModelRegistry, TableDef};
pub use settings::{Settings, SettingsPath};
