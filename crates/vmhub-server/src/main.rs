use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use vmhub_config::{Config, ConfigManager};
use vmhub_core::ViewModelTypes;
use vmhub_gateway::{AnonymousResolver, WsServer};
use vmhub_observability::LogManager;

mod demo;
mod wiring;

#[derive(Parser, Debug, Clone)]
#[command(name = "vmhub-server")]
#[command(about = "Connection-scoped view models over WebSocket")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "VMHUB_CONFIG", default_value = "~/.vmhub/config.json")]
    config: String,

    /// Bind address (overrides config)
    #[arg(long, env = "VMHUB_BIND")]
    bind: Option<String>,

    /// Log level or filter directives (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Registry idle timeout in seconds (overrides config)
    #[arg(long, env = "VMHUB_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Emit JSON logs
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Disable hot-reload
    #[arg(long, default_value = "false")]
    no_watch: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// 启动服务（默认）
    Serve,
    /// 配置管理命令
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// 获取配置值
    Get {
        /// 配置键 (如: server.bind, session.idle_timeout_secs)
        key: String,
    },
    /// 设置配置值
    Set {
        /// 配置键 (如: server.bind, session.idle_timeout_secs)
        key: String,
        /// 配置值
        value: String,
    },
    /// 初始化默认配置
    Init {
        /// 强制覆盖已有配置
        #[arg(long, default_value = "false")]
        force: bool,
    },
    /// 显示当前配置
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 展开配置文件路径
    let config_path =
        vmhub_config::expand_tilde(&cli.config).unwrap_or_else(|| PathBuf::from(&cli.config));

    match cli.command.clone().unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&cli, &config_path).await,
        Commands::Config(args) => handle_config(args.command, &config_path).await,
    }
}

async fn serve(cli: &Cli, config_path: &Path) -> anyhow::Result<()> {
    #[allow(unused_mut)]
    let mut config_manager = ConfigManager::load(config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let mut config = config_manager.snapshot().await;
    apply_overrides(&mut config, cli);
    ConfigManager::validate(&config).context("Invalid configuration")?;

    let mut log_settings = wiring::log_settings(&config.logging);
    if let Some(level) = &cli.log_level {
        log_settings = log_settings.with_level(level.clone());
    }
    let log_manager = Arc::new(LogManager::init(log_settings).context("Failed to initialise logging")?);
    info!("Config loaded from {:?}", config_path);

    // 启动热重载（如果未禁用）
    #[cfg(feature = "hot-reload")]
    if !cli.no_watch {
        let log_manager = Arc::clone(&log_manager);
        let level_pinned = cli.log_level.is_some();
        let watched = config_manager.watch(move |config: &Config| {
            if level_pinned {
                return;
            }
            if let Err(e) = log_manager.apply(wiring::log_settings(&config.logging)) {
                warn!("Failed to apply reloaded logging config: {}", e);
            }
        });
        if let Err(e) = watched {
            warn!("Failed to start config watcher: {}", e);
        }
    }
    #[cfg(not(feature = "hot-reload"))]
    let _ = &log_manager;

    let types = ViewModelTypes::new();
    demo::register(&types);
    info!("View model types: {:?}", types.type_names());

    let server = WsServer::build(
        wiring::ws_config(&config),
        types,
        wiring::build_pipeline(&config.pipeline),
        wiring::gateway_options(&config),
        Arc::new(AnonymousResolver),
    );
    let _sweeper = server.gateway().spawn_sweeper();

    info!(
        idle_timeout_secs = config.session.idle_timeout_secs,
        sweep_interval_secs = config.session.sweep_interval_secs,
        "Starting vmhub on {}",
        config.server.bind
    );

    tokio::select! {
        result = server.run() => result.context("Server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    let factory = server.gateway().factory();
    for connection_id in factory.connection_ids() {
        factory.remove(&connection_id).await;
    }
    info!("vmhub stopped");
    Ok(())
}

/// CLI 参数覆盖配置文件
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(bind) = &cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(secs) = cli.idle_timeout_secs {
        config.session.idle_timeout_secs = secs;
        // keep the sweep within the timeout
        config.session.sweep_interval_secs = config.session.sweep_interval_secs.min(secs);
    }
    if cli.json_logs {
        config.logging.json_format = true;
    }
}

async fn handle_config(command: ConfigCommands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Get { key } => {
            let manager = ConfigManager::load(config_path).await?;
            match manager.snapshot().await.get_value(&key) {
                Some(value) => println!("{}", value),
                None => bail!("Key not found: {}", key),
            }
        }
        ConfigCommands::Set { key, value } => {
            let manager = ConfigManager::load(config_path).await?;
            let mut updated = manager.snapshot().await;
            updated.set_value(&key, &value)?;
            manager.update(|config| *config = updated).await?;
            println!("{} = {}", key, value);
        }
        ConfigCommands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "Config already exists at {:?}; use --force to overwrite",
                    config_path
                );
            }
            ConfigManager::new(Config::default(), config_path.to_path_buf())
                .save()
                .await?;
            println!("Wrote default config to {:?}", config_path);
        }
        ConfigCommands::Show => {
            let manager = ConfigManager::load(config_path).await?;
            println!("{}", serde_json::to_string_pretty(&manager.snapshot().await)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::parse_from(["vmhub-server"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, "~/.vmhub/config.json");
        assert!(!cli.json_logs);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "vmhub-server",
            "--bind",
            "0.0.0.0:9000",
            "--idle-timeout-secs",
            "30",
            "--json-logs",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.session.idle_timeout_secs, 30);
        assert_eq!(config.session.sweep_interval_secs, 30);
        assert!(config.logging.json_format);
        assert!(ConfigManager::validate(&config).is_ok());
    }

    #[test]
    fn test_config_subcommand_parses() {
        let cli = Cli::parse_from(["vmhub-server", "config", "set", "server.bind", "127.0.0.1:1"]);
        match cli.command {
            Some(Commands::Config(ConfigArgs {
                command: ConfigCommands::Set { key, value },
            })) => {
                assert_eq!(key, "server.bind");
                assert_eq!(value, "127.0.0.1:1");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_config_set_then_get() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        assert_ok!(handle_config(ConfigCommands::Init { force: false }, &path).await);
        assert_err!(handle_config(ConfigCommands::Init { force: false }, &path).await);

        assert_ok!(
            handle_config(
                ConfigCommands::Set {
                    key: "session.idle_timeout_secs".to_string(),
                    value: "300".to_string(),
                },
                &path,
            )
            .await
        );

        let manager = ConfigManager::load(&path).await.unwrap();
        assert_eq!(manager.snapshot().await.session.idle_timeout_secs, 300);

        assert_err!(
            handle_config(
                ConfigCommands::Get {
                    key: "session.missing".to_string()
                },
                &path
            )
            .await
        );
    }
}
