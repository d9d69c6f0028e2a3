use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;

use puws_broker::api::{self, AppState};
use puws_broker::broker::SessionBroker;
use puws_broker::config::AppConfig;
use puws_broker::container::{ContainerRuntime, ContainerRuntimeApi, RuntimeType};
use puws_broker::credential::derive_password;
use puws_broker::host::{LinuxHostIdentity, validate_username};
use puws_broker::inventory::InventoryScanner;
use puws_broker::seed::{get_or_create_seed, load_seed};

const APP_NAME: &str = env!("CARGO_PKG_NAME");

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_sessions(ctx: RuntimeContext) -> Result<()> {
    handle_sessions(&ctx).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.paths.config_file.display());

    match cli.command.unwrap_or(Command::Serve(ServeCommand::default())) {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Password { username } => handle_password(&ctx, &username),
        Command::Sessions => async_sessions(ctx),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "PUWS broker - per-user remote-desktop session broker.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP broker (default)
    Serve(ServeCommand),
    /// Print the session password for a user
    Password {
        /// Desktop username
        username: String,
    },
    /// List running desktop sessions
    Sessions,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths)?;
        config
            .validate()
            .with_context(|| format!("invalid config in {}", paths.config_file.display()))?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level();
        let level_name = level.as_str().to_ascii_lowercase();

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("puws_broker={level_name},tower_http={level_name}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Library modules log through the `log` facade.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&self.config.logging.level),
        );
        builder.filter_level(level);
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn container_runtime(&self) -> ContainerRuntime {
        let settings = &self.config.container;
        let runtime = match (&settings.binary, settings.runtime) {
            (Some(binary), runtime) => {
                ContainerRuntime::with_binary(runtime.unwrap_or(RuntimeType::Docker), binary)
            }
            (None, Some(runtime)) => ContainerRuntime::with_type(runtime),
            (None, None) => ContainerRuntime::new(),
        };
        runtime.command_timeout(settings.command_timeout())
    }

    fn seed_path(&self) -> Result<PathBuf> {
        expand_str_path(&self.config.seed.path)
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;

    let seed_path = ctx.seed_path()?;
    let seed = get_or_create_seed(&seed_path)
        .with_context(|| format!("loading session seed from {}", seed_path.display()))?;

    let runtime = ctx.container_runtime();
    match runtime.health_check().await {
        Ok(version) => info!("Container runtime {} ready ({})", runtime.runtime_type(), version),
        Err(e) => warn!(
            "Container runtime {} is not responding: {}",
            runtime.runtime_type(),
            e
        ),
    }

    let storage_base = expand_str_path(&config.storage.base_dir)?;
    let host = LinuxHostIdentity::new(config.host_users.clone(), storage_base)
        .command_timeout(config.container.command_timeout());

    let broker = SessionBroker::new(config, Arc::new(runtime), Arc::new(host), seed);
    let app = api::create_router(AppState::new(broker));

    let host = cmd.host.unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    info!(
        "Session ports {}, image {}",
        config.ports.range(),
        config.container.image
    );
    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. Running desktops are left alone.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn handle_password(ctx: &RuntimeContext, username: &str) -> Result<()> {
    let username = username.trim();
    validate_username(username).map_err(|e| anyhow!(e))?;

    let seed_path = ctx.seed_path()?;
    let seed = load_seed(&seed_path)
        .with_context(|| format!("loading session seed from {}", seed_path.display()))?;
    let password = derive_password(&seed, username).context("deriving password")?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::json!({ "username": username, "password": password.as_str() })
        );
    } else {
        println!("{}", password.as_str());
    }
    Ok(())
}

async fn handle_sessions(ctx: &RuntimeContext) -> Result<()> {
    let runtime = ctx.container_runtime();
    let scanner = InventoryScanner::new(&ctx.config.container.name_prefix, ctx.config.ports.range());
    let runtime: &dyn ContainerRuntimeApi = &runtime;
    let sessions = scanner
        .list_sessions(runtime)
        .await
        .context("listing session containers")?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&sessions).context("serializing sessions to JSON")?
        );
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No running sessions");
        return Ok(());
    }
    println!("{:<32} {:>6}  CONTAINER", "USERNAME", "PORT");
    for session in sessions {
        println!(
            "{:<32} {:>6}  {}",
            session.username,
            session.port,
            short_id(&session.container_id)
        );
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(&env_prefix())
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("reading config {}", paths.config_file.display()))?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing config {}", paths.config_file.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
