use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use tracing::level_filters::LevelFilter;

/// `--option.K=V` repeated flags, parsed into `(K, V)` pairs.
pub fn parse_option_flag(s: &str) -> Result<(String, String), String> {
    let rest = s.strip_prefix("option.").unwrap_or(s);
    rest.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid --option flag '{s}', expected option.<name>=<value>"))
}

#[derive(Parser)]
#[command(name = "eigenlayer")]
#[command(author, version, about = "Install, run, and update EigenLayer AVS node packages")]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "EIGEN_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Override the data directory root (defaults to `$XDG_DATA_HOME/eigen`).
    #[arg(long, global = true, env = "EIGEN_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Parser)]
pub struct VersionArgs {
    /// Install/update to this version tag.
    #[arg(long, conflicts_with = "commit")]
    pub version: Option<String>,

    /// Install/update to this commit hash.
    #[arg(long)]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct InstallArgs {
    /// The profile to install.
    #[arg(long, default_value = "default")]
    pub profile: String,

    /// The instance tag; `<name>-<tag>` must be unique.
    #[arg(long, default_value = "default")]
    pub tag: String,

    /// Option values, repeated `--option.<name>=<value>`.
    #[arg(long = "option", value_parser = parse_option_flag)]
    pub option: Vec<(String, String)>,

    #[command(flatten)]
    pub version: VersionArgs,

    /// Skip interactive prompts.
    #[arg(long)]
    pub no_prompt: bool,

    /// Assume yes to any remaining confirmation.
    #[arg(long)]
    pub yes: bool,

    /// Start the instance once installed.
    #[arg(long)]
    pub run: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct UpdateArgs {
    /// Option values, repeated `--option.<name>=<value>`.
    #[arg(long = "option", value_parser = parse_option_flag)]
    pub option: Vec<(String, String)>,
}

#[derive(Debug, Clone, Parser)]
pub struct PluginArgs {
    /// The instance id.
    pub id: String,

    /// Bind mounts `host:container`, repeatable.
    #[arg(short = 'v', long = "volume")]
    pub volume: Vec<String>,

    /// Join the host network instead of the instance's bridge network.
    #[arg(long)]
    pub host: bool,

    /// Arguments forwarded to the plugin container.
    #[arg(trailing_var_arg = true)]
    pub plugin_args: Vec<String>,
}

/// `backup <id>` creates a backup; `backup ls` lists them. The id is taken
/// as an external subcommand so both forms live under one `backup` word.
#[derive(Debug, Clone, Subcommand)]
pub enum BackupCommands {
    /// List backups for all instances.
    Ls,
    #[command(external_subcommand)]
    Id(Vec<String>),
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install a package from a git URL.
    Install {
        /// The package's git URL.
        url: String,
        #[command(flatten)]
        args: InstallArgs,
    },
    /// Install a package from a local directory.
    LocalInstall {
        /// The local package directory.
        path: PathBuf,
        #[command(flatten)]
        args: InstallArgs,
    },
    /// Start an installed instance.
    Run {
        id: String,
    },
    /// Stop a running instance.
    Stop {
        id: String,
    },
    /// Remove an installed instance.
    Uninstall {
        id: String,
    },
    /// Update an instance to a new version fetched from its remote.
    Update {
        id: String,
        /// Version tag or commit hash to update to.
        version_or_commit: String,
        #[command(flatten)]
        args: UpdateArgs,
    },
    /// Update an instance from a local directory.
    LocalUpdate {
        id: String,
        path: PathBuf,
        #[command(flatten)]
        args: UpdateArgs,
    },
    /// List installed instances and their state.
    Ls,
    /// Run an instance's plugin container.
    Plugin(PluginArgs),
    /// `backup <id>` creates a backup; `backup ls` lists existing backups.
    #[command(subcommand)]
    Backup(BackupCommands),
    /// Restore an instance from a backup.
    Restore {
        backup_id: String,
        /// Start the instance once restored.
        #[arg(long)]
        run: bool,
    },
    /// Install the shared Prometheus + Grafana monitoring stack.
    InitMonitoring,
    /// Generate shell completion scripts.
    Completions {
        shell: Shell,
    },
}
