use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tidal_core::config::ProjectConfig;
use tidal_core::registry::{Edge, EdgeTable};
use tidal_kubehub::{KubeStore, LeaderElector};
use tidal_runtime::Manager;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod worker;

use worker::PhaseTable;

#[derive(Parser, Debug)]
#[command(name = "tidal", version, about = "Tidal reconciliation operator")]
struct Cli {
    /// Project descriptor (YAML)
    #[arg(short = 'p', long = "project", global = true, env = "TIDAL_PROJECT", default_value = "tidal.yaml")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch and reconcile until interrupted
    Run {
        /// Leader-election identity (default: $HOSTNAME, else random)
        #[arg(long = "identity", env = "TIDAL_IDENTITY")]
        identity: Option<String>,
    },
    /// Validate the descriptor and print the watch plan
    Check,
}

fn init_tracing() {
    let env = std::env::var("TIDAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TIDAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TIDAL_METRICS_ADDR; expected host:port");
        }
    }
}

fn check(cfg: &ProjectConfig) {
    println!("{} ({} finalizer)", cfg.kind, cfg.finalizer_name());
    for p in &cfg.phases {
        let mark = match (p.initial, p.terminal) {
            (true, _) => " [initial]",
            (_, true) => " [terminal]",
            _ => "",
        };
        println!("  phase {}{}", p.name, mark);
        for i in &p.inputs {
            let cluster = i.cluster.as_deref().unwrap_or("-");
            println!("    in  {} <- {} ({:?}, {:?}, cluster {})", i.name, i.kind, i.cardinality, i.scope, cluster);
        }
        for o in &p.outputs {
            println!("    out {}", o);
        }
    }
    let edges = EdgeTable::from_config(cfg);
    for edge in [Edge::Output, Edge::Input] {
        for child in edges.children(&cfg.kind, edge) {
            println!("  watch {} as {:?}", child, edge);
        }
    }
}

async fn run(cfg: ProjectConfig, identity: Option<String>) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            cancel.cancel();
        }
    });

    let mut manager = Manager::from_config(cfg.clone());
    let mut lease_client = None;
    if cfg.clusters.is_empty() {
        let client = tidal_kubehub::connect(None).await.context("connecting to the default cluster")?;
        manager.add_cluster(None, Arc::new(KubeStore::new(client.clone())));
        lease_client = Some(client);
    }
    for c in &cfg.clusters {
        let client = tidal_kubehub::connect(c.context.as_deref())
            .await
            .with_context(|| format!("connecting cluster {}", c.name))?;
        manager.add_cluster(Some(&c.name), Arc::new(KubeStore::new(client.clone())));
        lease_client.get_or_insert(client);
    }

    let mut guard = None;
    if cfg.operator.leader_election {
        let client = lease_client.context("no cluster to hold the lease")?;
        let identity = identity
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lease = format!("tidal-{}", cfg.kind.kind.to_lowercase());
        let elector = Arc::new(LeaderElector::new(client, &lease, &cfg.operator.lease_namespace, &identity));
        match elector.acquire(&cancel).await {
            Some(g) => guard = Some(g),
            None => return Ok(()),
        }
    }

    info!(kind = %cfg.kind, clusters = cfg.clusters.len().max(1), "tidal: starting");
    let mut task = tokio::spawn(manager.run(PhaseTable::from_config(&cfg), cancel.clone()));
    let result = match guard.as_mut() {
        Some(g) => tokio::select! {
            r = &mut task => r,
            _ = g.lost() => {
                warn!("leadership lost; stopping");
                cancel.cancel();
                task.await
            }
        },
        None => task.await,
    };
    if let Some(g) = guard {
        if let Err(e) = g.release().await {
            warn!(error = %e, "failed to release lease");
        }
    }
    result.context("manager task failed")??;
    info!("tidal: stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = ProjectConfig::load(&cli.project).with_context(|| format!("loading {}", cli.project.display()))?;

    match cli.command {
        Commands::Check => {
            check(&cfg);
            Ok(())
        }
        Commands::Run { identity } => run(cfg, identity).await,
    }
}
