//! eigenlayer is a CLI tool to install, run, and update EigenLayer AVS node packages.

mod cli;
mod config;

use std::collections::BTreeMap;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use comfy_table::{Cell, Table};

use cli::{BackupCommands, Cli, Commands, InstallArgs, UpdateArgs, VersionArgs};
use config::Config;
use eigenlayer_node::container::ContainerDriver;
use eigenlayer_node::datadir::DataDir;
use eigenlayer_node::engine::{InstallRequest, InstallSource, OrchestrationEngine, UpdateSource, VersionSelector};
use eigenlayer_node::model::BackupId;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.verbosity).init();

    let config = Config::load()?;
    let data_root = cli
        .data_root
        .clone()
        .or(config.data_root)
        .map(Ok)
        .unwrap_or_else(DataDir::default_root)?;

    if let Some(api_version) = &config.docker_api_version
        && std::env::var_os("DOCKER_API_VERSION").is_none()
    {
        // SAFETY: single-threaded at this point, before any tokio task reads the environment.
        unsafe { std::env::set_var("DOCKER_API_VERSION", api_version) };
    }

    let data_dir = DataDir::new(data_root);
    let driver = ContainerDriver::connect()?;
    let engine = OrchestrationEngine::new(data_dir.clone(), driver);

    match cli.command {
        Commands::Install { url, args } => run_install(&engine, InstallSource::Remote(url), args).await,
        Commands::LocalInstall { path, args } => run_install(&engine, InstallSource::Local(path), args).await,
        Commands::Run { id } => {
            engine.run(&id).await?;
            Ok(())
        }
        Commands::Stop { id } => {
            engine.stop(&id).await?;
            Ok(())
        }
        Commands::Uninstall { id } => {
            engine.uninstall(&id).await?;
            Ok(())
        }
        Commands::Update { id, version_or_commit, args } => {
            let version = if looks_like_commit(&version_or_commit) {
                VersionSelector::Commit(version_or_commit)
            } else {
                VersionSelector::Tag(version_or_commit)
            };
            let source = UpdateSource::Remote { url: instance_url(&data_dir, &id).await?, auth: None };
            run_update(&engine, &id, source, version, args).await
        }
        Commands::LocalUpdate { id, path, args } => {
            run_update(&engine, &id, UpdateSource::Local(path), VersionSelector::Latest, args).await
        }
        Commands::Ls => run_ls(&engine).await,
        Commands::Plugin(plugin_args) => run_plugin(&engine, plugin_args).await,
        Commands::Backup(backup_cmd) => run_backup(&engine, &data_dir, backup_cmd).await,
        Commands::Restore { backup_id, run } => {
            let id = BackupId::parse(&backup_id)
                .ok_or_else(|| anyhow::anyhow!("invalid backup id '{backup_id}'"))?;
            engine.restore(&id, run).await?;
            Ok(())
        }
        Commands::InitMonitoring => {
            engine.monitoring().install().await?;
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn version_selector(args: &VersionArgs) -> VersionSelector {
    if let Some(v) = &args.version {
        VersionSelector::Tag(v.clone())
    } else if let Some(c) = &args.commit {
        VersionSelector::Commit(c.clone())
    } else {
        VersionSelector::Latest
    }
}

async fn run_install(engine: &OrchestrationEngine, source: InstallSource, args: InstallArgs) -> Result<()> {
    let option_values: BTreeMap<String, String> = args.option.into_iter().collect();
    let req = InstallRequest {
        source,
        profile: args.profile,
        tag: args.tag,
        option_values,
        run_after: args.run,
        version: version_selector(&args.version),
        auth: None,
    };
    let id = engine.install(req).await?;
    println!("Installed instance: {id}");
    Ok(())
}

async fn run_update(engine: &OrchestrationEngine, id: &str, source: UpdateSource, version: VersionSelector, args: UpdateArgs) -> Result<()> {
    let option_values: BTreeMap<String, String> = args.option.into_iter().collect();
    engine.update(id, source, version, &option_values).await?;
    Ok(())
}

fn looks_like_commit(s: &str) -> bool {
    s.len() >= 7 && s.chars().all(|c| c.is_ascii_hexdigit())
}

async fn instance_url(data_dir: &DataDir, id: &str) -> Result<String> {
    Ok(data_dir.instance(id).await?.url)
}

async fn run_ls(engine: &OrchestrationEngine) -> Result<()> {
    let ids = engine.list_instances().await?;
    let mut table = Table::new();
    table.set_header(vec!["instance", "state"]);
    for id in ids {
        let state = engine.state(&id).await?;
        table.add_row(vec![Cell::new(&id), Cell::new(state.to_string())]);
    }
    println!("{table}");
    Ok(())
}

async fn run_plugin(engine: &OrchestrationEngine, args: cli::PluginArgs) -> Result<()> {
    let mounts = args
        .volume
        .iter()
        .map(|v| {
            v.split_once(':')
                .map(|(h, c)| (h.to_string(), c.to_string()))
                .ok_or_else(|| anyhow::anyhow!("invalid -v flag '{v}', expected host:container"))
        })
        .collect::<Result<Vec<_>>>()?;
    let exit_code = engine.plugin_run(&args.id, args.plugin_args, mounts, args.host).await?;
    std::process::exit(exit_code as i32);
}

async fn run_backup(engine: &OrchestrationEngine, data_dir: &DataDir, cmd: BackupCommands) -> Result<()> {
    match cmd {
        BackupCommands::Ls => {
            let backups = data_dir.backup_list().await?;
            let mut table = Table::new();
            table.set_header(vec!["backup id", "instance", "timestamp"]);
            for backup in backups {
                table.add_row(vec![
                    Cell::new(backup.format()),
                    Cell::new(&backup.instance_id),
                    Cell::new(backup.timestamp.to_string()),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        BackupCommands::Id(parts) => {
            let id = parts.first().ok_or_else(|| anyhow::anyhow!("backup requires an instance id"))?;
            let backup_id = engine.backup(id).await?;
            println!("Backup created with id: {backup_id}");
            Ok(())
        }
    }
}

