mod catalog;
mod config;
mod driver;
mod planner;
mod progress;
mod store;
mod supervisor;
mod time;

use clap::Parser;
use config::Config;
use eyre::Result;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use store::{RedisStore, StoreClient};
use supervisor::{Supervisor, SupervisorConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "redis-sync-keeper", about = "Resumable edge-to-cloud time-series replication engine")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::from_file(&args.config)?;

    init_tracing(&cfg);

    tracing::info!(config = %args.config, "starting redis-sync-keeper");

    let local: Arc<dyn StoreClient> = Arc::new(
        RedisStore::connect("local", &cfg.redis_local.host, cfg.redis_local.port).await?,
    );
    let remote: Arc<dyn StoreClient> = Arc::new(
        RedisStore::connect("cloud", &cfg.redis_cloud.host, cfg.redis_cloud.port).await?,
    );

    let sup_cfg = SupervisorConfig {
        db_poll_freq: std::time::Duration::from_secs(cfg.sync.db_poll_freq_secs),
        interval_size: cfg.sync.time_interval_size,
        interval_nb: cfg.sync.time_interval_nb,
        interval_start_idx: cfg.sync.time_interval_start_idx,
        key_label_ts: cfg.sync.key_label_ts.clone(),
        key_label: cfg.sync.key_label.clone(),
        label_selector: format!("class={}", cfg.sync.key_label_ts),
        compaction: catalog::CompactionConfig {
            enabled: cfg.sync.compaction.enabled,
            key_suffix: cfg.sync.compaction.key_suffix.clone(),
            bucket_duration_ms: cfg.sync.compaction.bucket_duration_ms,
            aggregator: cfg.sync.compaction.aggregator.clone(),
        },
    };

    let supervisor = Arc::new(Supervisor::new(local, remote, sup_cfg));

    if cfg.sync.autostart {
        supervisor.start().await;
    }

    run_command_shell(supervisor).await
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::verbosity_to_level(cfg.verbosity)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Minimal stdin RPC shell standing in for the binding's `ping`/`sync
/// start`/`sync stop`/`bandwidth get`/`bandwidth set <level>` surface
/// (spec.md §6). Reads one command per line until `quit` or EOF.
async fn run_command_shell(supervisor: Arc<Supervisor>) -> Result<()> {
    let stdin = io::stdin();
    print_prompt();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            print_prompt();
            continue;
        }

        match line {
            "ping" => {
                println!("pong {}", supervisor.ping());
            }
            "sync start" => {
                supervisor.start().await;
                println!("ok");
            }
            "sync stop" => {
                supervisor.stop().await;
                println!("ok");
            }
            "bandwidth get" => {
                println!("{}", supervisor.bandwidth_get().await);
            }
            "quit" | "exit" => {
                supervisor.stop().await;
                break;
            }
            other if other.starts_with("bandwidth set ") => {
                let level = other.trim_start_matches("bandwidth set ").trim();
                match supervisor.bandwidth_set(level).await {
                    Ok(()) => println!("ok"),
                    Err(e) => println!("error: {e}"),
                }
            }
            other => {
                println!("unrecognized command: {other}");
            }
        }
        print_prompt();
    }

    Ok(())
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
