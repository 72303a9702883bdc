use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};

use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};

use rstudio_desktop::launch::LaunchConfig;
use rstudio_desktop::ports::{
    Allocation, AssignmentStore, ClaimRecord, Host, Identity, Listener, PortAllocator,
    PortsConfig, Registry, SystemHost,
};

const APP_NAME: &str = "rstudio-desktop";

fn main() {
    match try_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let _ = writeln!(io::stderr(), "error: {err:?}");
            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Allocate(cmd) => handle_allocate(&ctx, cmd).map(|_| 0),
        Command::Launch(cmd) => handle_launch(&ctx, cmd),
        Command::Status => handle_status(&ctx).map(|_| 0),
        Command::Registry { command } => handle_registry(&ctx, command).map(|_| 0),
        Command::Release(cmd) => handle_release(&ctx, cmd).map(|_| 0),
        Command::Init(cmd) => handle_init(&ctx, cmd).map(|_| 0),
        Command::Config { command } => handle_config(&ctx, command).map(|_| 0),
        Command::Completions { shell } => handle_completions(shell).map(|_| 0),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Launch a per-user RStudio Server on a shared host.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
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
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Allocate (or look up) this user's port and print it
    Allocate(AllocateCommand),
    /// Allocate a port and run the server on it
    Launch(LaunchCommand),
    /// Show this user's assignment and whether the port is in use
    Status,
    /// Inspect the shared reservation registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
    /// Release this user's registry entry
    Release(ReleaseCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
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

#[derive(Debug, Clone, Args)]
struct AllocateCommand {
    /// Use this port and skip allocation entirely
    #[arg(short, long, env = "RSTUDIO_PORT")]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct LaunchCommand {
    /// Use this port and skip allocation entirely
    #[arg(short, long, env = "RSTUDIO_PORT")]
    port: Option<u16>,
    /// Extra arguments appended to the server command
    #[arg(last = true, value_name = "ARGS")]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum RegistryCommand {
    /// List every claimed port
    List,
}

#[derive(Debug, Clone, Args)]
struct ReleaseCommand {
    /// Also delete the persisted assignment
    #[arg(long)]
    forget: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
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
        let config = load_or_init_config(&paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("rstudio_desktop={level}")));

        // Logs go to stderr so stdout stays parseable.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
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
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
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

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure state dir {}",
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    fn identity(&self) -> Identity {
        Identity::current()
    }

    fn registry(&self) -> Registry {
        Registry::new(&self.paths.registry_dir)
    }

    fn store(&self) -> AssignmentStore {
        AssignmentStore::in_dir(&self.paths.state_dir)
    }

    fn host(&self) -> SystemHost {
        SystemHost::new(self.config.ports.probe_timeout())
    }

    fn allocator(&self) -> Result<PortAllocator<SystemHost>> {
        let range = self
            .config
            .ports
            .range()
            .context("reading [ports] configuration")?;
        Ok(PortAllocator::new(
            self.identity(),
            range,
            self.registry(),
            self.store(),
            self.host(),
        )
        .with_policy(self.config.ports.conflict_policy)
        .with_grace_period(self.config.ports.grace_period()))
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            text()
        };
        println!("{output}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    state_dir: PathBuf,
    registry_dir: PathBuf,
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

        Ok(Self {
            config_file,
            state_dir: default_state_dir()?,
            registry_dir: default_registry_dir(),
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        if let Some(ref registry_override) = cfg.paths.registry_dir {
            self.registry_dir = expand_str_path(registry_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    ports: PortsConfig,
    launch: LaunchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    /// Private directory holding the port assignment.
    state_dir: Option<String>,
    /// Shared reservation registry (must be the same for every user).
    registry_dir: Option<String>,
}

#[derive(Debug, Serialize)]
struct AllocateOutput<'a> {
    user: &'a str,
    port: u16,
    source: String,
    url: String,
}

fn run_allocation(ctx: &RuntimeContext, port: Option<u16>) -> Result<(Identity, Allocation)> {
    let allocator = ctx.allocator()?;
    let allocation = allocator
        .allocate(port)
        .context("allocating a port for RStudio Server")?;
    Ok((allocator.identity().clone(), allocation))
}

fn handle_allocate(ctx: &RuntimeContext, cmd: AllocateCommand) -> Result<()> {
    if ctx.common.dry_run {
        let assigned = ctx.store().load(ctx.config.ports.range()?)?;
        info!(
            "dry-run: would allocate a port (current assignment: {})",
            assigned.map_or_else(|| "none".to_string(), |p| p.to_string())
        );
        return Ok(());
    }

    let (identity, allocation) = run_allocation(ctx, cmd.port)?;
    let launch = &ctx.config.launch;
    let output = AllocateOutput {
        user: &identity.name,
        port: allocation.port,
        source: allocation.source.to_string(),
        url: launch.url(&allocation),
    };
    ctx.print(&output, || launch.banner(&identity, &allocation))
}

fn handle_launch(ctx: &RuntimeContext, cmd: LaunchCommand) -> Result<i32> {
    let launch = &ctx.config.launch;

    if ctx.common.dry_run {
        info!(
            "dry-run: would allocate a port and run {:?}",
            launch.command
        );
        return Ok(0);
    }

    let (identity, allocation) = run_allocation(ctx, cmd.port)?;

    if !ctx.common.quiet {
        eprintln!("{}", launch.banner(&identity, &allocation));
    }
    launch.run(&identity, &allocation, &cmd.args)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    identity: Identity,
    assignment_file: PathBuf,
    assigned_port: Option<u16>,
    registry_dir: PathBuf,
    claim: Option<ClaimRecord>,
    listening: bool,
    listeners: Vec<Listener>,
}

fn handle_status(ctx: &RuntimeContext) -> Result<()> {
    let identity = ctx.identity();
    let store = ctx.store();
    let registry = ctx.registry();
    let host = ctx.host();

    let assigned_port = store.load(ctx.config.ports.range()?)?;
    let (claim, listening, listeners) = match assigned_port {
        Some(port) => {
            let listening = host.is_listening(port);
            let listeners = if listening {
                host.listeners(port)
            } else {
                Vec::new()
            };
            (registry.record(port), listening, listeners)
        }
        None => (None, false, Vec::new()),
    };

    let report = StatusReport {
        identity,
        assignment_file: store.path().to_path_buf(),
        assigned_port,
        registry_dir: registry.root().to_path_buf(),
        claim,
        listening,
        listeners,
    };

    ctx.print(&report, || {
        let mut text = format!("user:        {}\n", report.identity);
        match report.assigned_port {
            Some(port) => {
                text.push_str(&format!("port:        {port}\n"));
                let owner = match &report.claim {
                    Some(claim) if claim.is_owned_by(&report.identity) => "yes".to_string(),
                    Some(claim) => format!("no, held by {}", claim.user),
                    None => "no".to_string(),
                };
                text.push_str(&format!("claimed:     {owner}\n"));
                text.push_str(&format!(
                    "listening:   {}",
                    if report.listening { "yes" } else { "no" }
                ));
            }
            None => text.push_str("port:        not assigned"),
        }
        text
    })
}

#[derive(Debug, Serialize)]
struct RegistryRow {
    port: u16,
    user: Option<String>,
    uid: Option<u32>,
    hostname: Option<String>,
    claimed_at: Option<String>,
    listening: bool,
}

fn handle_registry(ctx: &RuntimeContext, command: RegistryCommand) -> Result<()> {
    match command {
        RegistryCommand::List => {
            let registry = ctx.registry();
            let host = ctx.host();
            let rows: Vec<RegistryRow> = registry
                .entries()?
                .into_iter()
                .map(|entry| RegistryRow {
                    port: entry.port,
                    user: entry.record.as_ref().map(|r| r.user.clone()),
                    uid: entry.record.as_ref().map(|r| r.uid),
                    hostname: entry.record.as_ref().map(|r| r.hostname.clone()),
                    claimed_at: entry.record.as_ref().map(|r| r.claimed_at.to_rfc3339()),
                    listening: host.is_listening(entry.port),
                })
                .collect();

            ctx.print(&rows, || {
                if rows.is_empty() {
                    return format!("no ports claimed in {}", registry.root().display());
                }
                let mut text = format!(
                    "{:<6} {:<16} {:<8} {:<10} {}",
                    "PORT", "USER", "UID", "LISTENING", "CLAIMED"
                );
                for row in &rows {
                    text.push_str(&format!(
                        "\n{:<6} {:<16} {:<8} {:<10} {}",
                        row.port,
                        row.user.as_deref().unwrap_or("?"),
                        row.uid.map_or_else(|| "?".to_string(), |u| u.to_string()),
                        if row.listening { "yes" } else { "no" },
                        row.claimed_at.as_deref().unwrap_or("?"),
                    ));
                }
                text
            })
        }
    }
}

fn handle_release(ctx: &RuntimeContext, cmd: ReleaseCommand) -> Result<()> {
    let identity = ctx.identity();
    let store = ctx.store();
    let registry = ctx.registry();

    let Some(port) = store.load(ctx.config.ports.range()?)? else {
        info!("No port assigned to {}", identity.name);
        return Ok(());
    };

    if ctx.common.dry_run {
        info!(
            "dry-run: would release port {}{}",
            port,
            if cmd.forget { " and forget the assignment" } else { "" }
        );
        return Ok(());
    }

    if registry.release(port, &identity)? {
        info!("Released port {} for {}", port, identity.name);
    } else {
        warn!("Port {} has no registry entry owned by {}", port, identity.name);
    }

    if cmd.forget && store.forget()? {
        info!("Removed assignment {}", store.path().display());
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.print(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else if let Err(e) = write_default_config(&paths.config_file) {
            // Read-only homes still get the built-in defaults.
            warn!("could not create default config: {e:#}");
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let config: AppConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing {}", paths.config_file.display()))?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
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
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn default_registry_dir() -> PathBuf {
    env::temp_dir().join(format!("{APP_NAME}-ports"))
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

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, state: {}, registry: {}",
            self.config_file.display(),
            self.state_dir.display(),
            self.registry_dir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "RSTUDIO_DESKTOP");
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.ports.min, 8800);
        assert_eq!(parsed.ports.max, 8899);
        assert_eq!(parsed.launch.command[0], "rserver");
    }

    #[test]
    fn test_cli_parses_launch_args() {
        let cli = Cli::try_parse_from([
            APP_NAME,
            "launch",
            "--port",
            "8850",
            "--",
            "--auth-none=1",
        ])
        .unwrap();
        match cli.command {
            Command::Launch(cmd) => {
                assert_eq!(cmd.port, Some(8850));
                assert_eq!(cmd.args, vec!["--auth-none=1"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_verifies() {
        Cli::command().debug_assert();
    }
}
