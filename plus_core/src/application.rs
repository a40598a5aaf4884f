//! Application bootstrap.
//!
//! An [`Application`] describes a service: its name, root folder,
//! blueprints, models and extra extensions. [`Application::create_app`]
//! turns that description into a running-ready [`App`]:
//!
//! 1. load settings (env var, override or `settings.toml:development`)
//! 2. configure logging
//! 3. initialize extensions (db, migrate, toolbar when enabled, extras)
//! 4. install error pages unless `debug` is set
//! 5. mount every blueprint at its URL prefix

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{middleware, Router};
use tower::Layer;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::trace::TraceLayer;

use crate::blueprint::{self, normalize_prefix, Blueprint};
use crate::error::{Error, Result};
use crate::error_pages::{self, ErrorPages};
use crate::extensions::{Database, DatabaseExtension, Extension, Migrate, MigrateExtension};
use crate::models::{Model, ModelRegistry};
use crate::settings::{self, Settings, SettingsPath};
use crate::templates::Templates;
use crate::toolbar::DebugToolbar;

/// State shared by every blueprint's handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Database,
    pub templates: Templates,
    pub models: Arc<ModelRegistry>,
}

/// Router transformation queued by an extension, applied after the views.
pub type RouterHook = Box<dyn FnOnce(Router<AppState>) -> Router<AppState> + Send>;

#[derive(Clone)]
pub struct Application {
    app_name: String,
    root_folder: PathBuf,
    settings_override: Option<SettingsPath>,
    blueprints: Vec<(String, Blueprint)>,
    models: ModelRegistry,
    extensions: Vec<Arc<dyn Extension>>,
}

impl Application {
    pub fn new(app_name: impl Into<String>, root_folder: impl Into<PathBuf>) -> Self {
        Self {
            app_name: app_name.into(),
            root_folder: root_folder.into(),
            settings_override: None,
            blueprints: Vec::new(),
            models: ModelRegistry::new(),
            extensions: Vec::new(),
        }
    }

    /// Settings used when the environment variable is not set.
    pub fn settings_override(mut self, path: SettingsPath) -> Self {
        self.settings_override = Some(path);
        self
    }

    /// Mount `blueprint` at `url_prefix`. A prefix registered twice keeps the
    /// last blueprint; `""` and `"/"`, or `"notes"` and `"/notes/"`, are the same prefix.
    pub fn blueprint(mut self, url_prefix: impl Into<String>, blueprint: Blueprint) -> Self {
        let url_prefix = url_prefix.into();
        let key = normalize_prefix(&url_prefix);
        match self
            .blueprints
            .iter_mut()
            .find(|(p, _)| normalize_prefix(p) == key)
        {
            Some(entry) => *entry = (url_prefix, blueprint),
            None => self.blueprints.push((url_prefix, blueprint)),
        }
        self
    }

    pub fn model<M: Model>(mut self) -> Self {
        self.models.register::<M>();
        self
    }

    pub fn extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// `(url_prefix, blueprint name)` pairs in registration order.
    pub fn blueprint_names(&self) -> Vec<(String, String)> {
        self.blueprints
            .iter()
            .map(|(prefix, bp)| (prefix.clone(), bp.name().to_string()))
            .collect()
    }

    pub fn settings_env_name(&self) -> String {
        settings::settings_env_name(&self.app_name)
    }

    pub fn default_settings_path(&self) -> SettingsPath {
        SettingsPath::default()
    }

    /// The environment variable wins, then the override, then the default.
    pub fn settings_path(&self) -> SettingsPath {
        match std::env::var(self.settings_env_name()) {
            Ok(value) if !value.is_empty() => SettingsPath::parse(&value),
            _ => self
                .settings_override
                .clone()
                .unwrap_or_else(|| self.default_settings_path()),
        }
    }

    pub fn create_app(&self) -> Result<App> {
        self.load_dotenv();

        let settings_path = self.settings_path();
        let settings = Arc::new(self.load_app_settings(&settings_path)?);
        self.configure_logging(&settings)?;
        tracing::info!(app = %self.app_name, "Loading settings from {}", settings_path);

        let mut builder = AppBuilder::new(self, settings.clone());
        self.load_extensions(&mut builder)?;
        let AppBuilder {
            database,
            migrate,
            hooks,
            ..
        } = builder;
        let database = database.ok_or(Error::Extension {
            name: "db",
            reason: "no database was configured".to_string(),
        })?;
        let migrate = migrate.ok_or(Error::Extension {
            name: "migrate",
            reason: "no migrations were configured".to_string(),
        })?;

        let models = Arc::new(self.models.clone());
        let state = AppState {
            settings: settings.clone(),
            db: database,
            templates: Templates::load(&settings.templates_dir)?,
            models: models.clone(),
        };

        let router = self.setup_views(Router::new());
        let router = self.setup_errorhandlers(router, &state);
        let router = hooks.into_iter().fold(router, |router, hook| hook(router));
        let router = router
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());
        // Trailing slashes are trimmed before routing, so `/notes/` reaches
        // the `/` route of a blueprint mounted at `/notes`.
        let router = Router::new()
            .fallback_service(NormalizePathLayer::trim_trailing_slash().layer(router));

        Ok(App {
            name: self.app_name.clone(),
            settings,
            router,
            state,
            migrate,
            models,
        })
    }

    fn load_dotenv(&self) {
        match dotenvy::from_path(self.root_folder.join(".env")) {
            Ok(()) => {}
            Err(e) if e.not_found() => {}
            Err(e) => eprintln!("Ignoring unreadable .env: {e}"),
        }
    }

    pub fn load_app_settings(&self, settings_path: &SettingsPath) -> Result<Settings> {
        Settings::load(&self.root_folder, settings_path)
    }

    pub fn configure_logging(&self, settings: &Settings) -> Result<()> {
        if !crate::logging::configure_logging(settings)? {
            tracing::debug!("Global subscriber already installed, keeping it");
        }
        Ok(())
    }

    pub fn load_extensions(&self, app: &mut AppBuilder<'_>) -> Result<()> {
        let mut extensions: Vec<Arc<dyn Extension>> =
            vec![Arc::new(DatabaseExtension), Arc::new(MigrateExtension)];
        if app.settings().toolbar_enabled {
            extensions.push(Arc::new(DebugToolbar));
        }
        extensions.extend(self.extensions.iter().cloned());

        for extension in extensions {
            extension.init_app(app)?;
            tracing::debug!(extension = extension.name(), "Extension initialized");
        }
        Ok(())
    }

    /// Install the 403/404/500 pages. Debug mode keeps the framework defaults.
    pub fn setup_errorhandlers(
        &self,
        router: Router<AppState>,
        state: &AppState,
    ) -> Router<AppState> {
        if state.settings.debug {
            return router;
        }

        let pages = ErrorPages::new(state.templates.clone());
        router
            .fallback(error_pages::not_found)
            .layer(CatchPanicLayer::custom(error_pages::panic_response))
            .layer(middleware::from_fn_with_state(
                pages,
                error_pages::render_error_pages,
            ))
    }

    pub fn setup_views(&self, router: Router<AppState>) -> Router<AppState> {
        self.blueprints
            .iter()
            .fold(router, |router, (url_prefix, blueprint)| {
                tracing::debug!(blueprint = blueprint.name(), url_prefix = %url_prefix, "Registering blueprint");
                blueprint::mount(router, url_prefix, blueprint.clone().into_router())
            })
    }
}

/// The application while extensions are being initialized.
pub struct AppBuilder<'a> {
    application: &'a Application,
    settings: Arc<Settings>,
    database: Option<Database>,
    migrate: Option<Migrate>,
    hooks: Vec<RouterHook>,
}

impl<'a> AppBuilder<'a> {
    fn new(application: &'a Application, settings: Arc<Settings>) -> Self {
        Self {
            application,
            settings,
            database: None,
            migrate: None,
            hooks: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn application(&self) -> &Application {
        self.application
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    pub fn set_database(&mut self, database: Database) {
        self.database = Some(database);
    }

    pub fn set_migrate(&mut self, migrate: Migrate) {
        self.migrate = Some(migrate);
    }

    /// Transform the router once the views and error pages are in place.
    pub fn wrap_router(
        &mut self,
        hook: impl FnOnce(Router<AppState>) -> Router<AppState> + Send + 'static,
    ) {
        self.hooks.push(Box::new(hook));
    }
}

/// A fully built application.
pub struct App {
    name: String,
    settings: Arc<Settings>,
    router: Router,
    state: AppState,
    migrate: Migrate,
    models: Arc<ModelRegistry>,
}

impl App {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    pub fn migrate(&self) -> &Migrate {
        &self.migrate
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Serve on the configured host and port.
    pub async fn serve(self) -> Result<()> {
        let host = self.settings.host.clone();
        let port = self.settings.port;
        self.serve_on(&host, port).await
    }

    /// Serve until SIGINT or SIGTERM.
    pub async fn serve_on(self, host: &str, port: u16) -> Result<()> {
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::io(format!("{host}:{port}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::io(format!("{host}:{port}"), e))?;
        tracing::info!("{} listening on {}", self.name, addr);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::io(addr.to_string(), e))?;

        tracing::info!("Shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
