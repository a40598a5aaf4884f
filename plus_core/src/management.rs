//! Management commands: `runserver`, `createdb`, `dropdb` and the `db`
//! migration group, plus any command the application registers.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::application::{App, Application};

type CommandFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type CommandHandler = Box<dyn Fn(App) -> CommandFuture + Send + Sync>;

#[derive(Parser, Debug)]
#[command(about = "Application management commands")]
struct ManagerCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server
    Runserver {
        /// Interface to bind (defaults to the `host` setting)
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (defaults to the `port` setting)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create every registered table missing from the database
    Createdb,
    /// Drop every registered table
    Dropdb,
    /// Database migrations
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum DbCommand {
    /// Create the migrations directory
    Init,
    /// Create an empty migration
    Revision {
        #[arg(short, long, default_value = "revision")]
        message: String,
    },
    /// Generate a migration for registered tables missing from the database
    Migrate {
        #[arg(short, long, default_value = "autogenerated")]
        message: String,
    },
    /// Apply pending migrations
    Upgrade,
    /// Revert applied migrations
    Downgrade {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Show the newest applied migration
    Current,
    /// List migrations and whether they are applied
    History,
}

/// What a command line resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum Invocation {
    Builtin(Command),
    Custom(String),
}

struct CustomCommand {
    name: String,
    about: String,
    handler: CommandHandler,
}

pub struct Manager {
    application: Application,
    commands: Vec<CustomCommand>,
}

/// Management commands for `application`.
pub fn get_manager(application: Application) -> Manager {
    Manager {
        application,
        commands: Vec::new(),
    }
}

impl Manager {
    /// Register a custom command. Names taken by built-in commands are ignored.
    pub fn command<F, Fut>(mut self, name: &str, about: &str, handler: F) -> Self
    where
        F: Fn(App) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.commands.retain(|c| c.name != name);
        self.commands.push(CustomCommand {
            name: name.to_string(),
            about: about.to_string(),
            handler: Box::new(move |app| Box::pin(handler(app))),
        });
        self
    }

    fn cli(&self) -> clap::Command {
        let mut cli = ManagerCli::command().name(self.application.app_name().to_string());
        for custom in &self.commands {
            if cli.find_subcommand(&custom.name).is_some() {
                continue;
            }
            cli = cli.subcommand(clap::Command::new(custom.name.clone()).about(custom.about.clone()));
        }
        cli
    }

    /// Resolve a command line without running anything.
    pub fn parse<I, T>(&self, args: I) -> Result<Invocation, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = self.cli().try_get_matches_from(args)?;
        if let Some((name, _)) = matches.subcommand() {
            let is_builtin = ManagerCli::command().find_subcommand(name).is_some();
            if !is_builtin && self.commands.iter().any(|c| c.name == name) {
                return Ok(Invocation::Custom(name.to_string()));
            }
        }
        let cli = ManagerCli::from_arg_matches(&matches)?;
        Ok(Invocation::Builtin(cli.command))
    }

    /// Run with the process arguments. Usage errors and `--help` exit the process.
    pub async fn run(self) -> anyhow::Result<()> {
        let invocation = match self.parse(std::env::args_os()) {
            Ok(invocation) => invocation,
            Err(e) => e.exit(),
        };
        self.dispatch(invocation).await
    }

    pub async fn run_from<I, T>(self, args: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let invocation = self.parse(args)?;
        self.dispatch(invocation).await
    }

    async fn dispatch(self, invocation: Invocation) -> anyhow::Result<()> {
        let app = self.application.create_app()?;

        let command = match invocation {
            Invocation::Custom(name) => {
                let custom = self
                    .commands
                    .iter()
                    .find(|c| c.name == name)
                    .ok_or_else(|| anyhow::anyhow!("unknown command: {name}"))?;
                return (custom.handler)(app).await;
            }
            Invocation::Builtin(command) => command,
        };

        match command {
            Command::Runserver { host, port } => {
                let host = host.unwrap_or_else(|| app.settings().host.clone());
                let port = port.unwrap_or(app.settings().port);
                app.serve_on(&host, port).await?;
            }
            Command::Createdb => {
                let created = app.db().create_all(app.models()).await?;
                report("Created", &created);
            }
            Command::Dropdb => {
                let dropped = app.db().drop_all(app.models()).await?;
                report("Dropped", &dropped);
            }
            Command::Db(db) => run_db(&app, db).await?,
        }
        Ok(())
    }
}

async fn run_db(app: &App, command: DbCommand) -> anyhow::Result<()> {
    let migrate = app.migrate();
    match command {
        DbCommand::Init => {
            migrate.init()?;
            println!("Created {}", migrate.directory().display());
        }
        DbCommand::Revision { message } => {
            let path = migrate.revision(&message)?;
            println!("Generated {}", path.display());
        }
        DbCommand::Migrate { message } => {
            match migrate.autogenerate(app.db(), app.models(), &message).await? {
                Some(path) => println!("Generated {}", path.display()),
                None => println!("No changes detected"),
            }
        }
        DbCommand::Upgrade => {
            let applied = migrate.upgrade().await?;
            if applied.is_empty() {
                println!("Already up to date");
            }
            for name in applied {
                println!("Applied {name}");
            }
        }
        DbCommand::Downgrade { steps } => {
            let reverted = migrate.downgrade(steps).await?;
            if reverted.is_empty() {
                println!("Nothing to revert");
            }
            for name in reverted {
                println!("Reverted {name}");
            }
        }
        DbCommand::Current => match migrate.current().await? {
            Some(name) => println!("{name}"),
            None => println!("No migrations applied"),
        },
        DbCommand::History => {
            for entry in migrate.history().await? {
                let mark = if entry.applied { "x" } else { " " };
                println!("[{mark}] {}", entry.name);
            }
        }
    }
    Ok(())
}

fn report(verb: &str, tables: &[String]) {
    if tables.is_empty() {
        println!("{verb} no tables");
    } else {
        println!("{verb} {}", tables.join(", "));
    }
}
