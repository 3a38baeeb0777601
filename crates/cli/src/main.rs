use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ksync_apply::{Applier, ApplicationRef};
use ksync_core::{AppIdentity, Credentials, RetryPolicy, SyncAction, SyncConfig, SyncTarget};
use ksync_engine::{resolve_target, Engine, ForwardReport, ReverseReport};
use ksync_git::PushEvent;
use ksync_kubehub::KubeCluster;
use secrecy::SecretString;
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ksyncctl", version, about = "Two-way GitOps sync between a spec repository and a cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace for export, watch and delete-app (default: all / required for delete-app)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Sync repository URL
    #[arg(long, env = "KSYNC_REPO", global = true)]
    repo: Option<String>,
    /// Branch (default: the remote's default branch)
    #[arg(long, env = "KSYNC_BRANCH", global = true)]
    branch: Option<String>,
    /// HTTPS access token for the repository
    #[arg(long, env = "KSYNC_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,
    /// Passphrase for Secret payloads; without it Secret values are committed in clear
    #[arg(long = "secret-key", env = "KSYNC_SECRET_KEY", hide_env_values = true, global = true)]
    secret_key: Option<String>,
    /// Re-run the forward sync every N seconds (watch)
    #[arg(long = "interval-secs", env = "KSYNC_INTERVAL_SECS", global = true)]
    interval_secs: Option<u64>,
    #[arg(long = "clone-depth", env = "KSYNC_CLONE_DEPTH", default_value_t = 20, global = true)]
    clone_depth: u32,
    /// Commits inspected when looking for the sync cursor
    #[arg(long = "max-scan", env = "KSYNC_MAX_SCAN", default_value_t = 200, global = true)]
    max_scan: usize,
    #[arg(long = "retry-attempts", default_value_t = 3, global = true)]
    retry_attempts: u32,
    #[arg(long = "retry-delay-ms", default_value_t = 500, global = true)]
    retry_delay_ms: u64,
    /// Application identity named in reverse-sync commits
    #[arg(long = "app-ns", global = true)]
    app_ns: Option<String>,
    #[arg(long = "app-name", default_value = "ksync", global = true)]
    app_name: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one forward sync cycle (repository -> cluster)
    Sync {
        /// Process the commits of a push event (JSON) instead of scanning for the cursor
        #[arg(long = "event")]
        event: Option<String>,
    },
    /// Apply every spec file in naming order and record a cursor
    Bootstrap,
    /// Periodic forward sync plus reverse sync of watched kinds until Ctrl-C
    Watch {
        /// GVK keys to write back, e.g. "apps/v1/Deployment" (repeatable)
        #[arg(long = "gvk")]
        gvks: Vec<String>,
        /// Seconds between reverse-sync flushes
        #[arg(long = "flush-secs", default_value_t = 30)]
        flush_secs: u64,
    },
    /// Write the current cluster objects of the given kinds into the repository
    Export {
        #[arg(long = "gvk", required = true)]
        gvks: Vec<String>,
    },
    /// Delete an application's resources in dependency order
    DeleteApp {
        #[arg(long)]
        name: String,
        /// Ingress path; the Ingress is left alone when absent
        #[arg(long)]
        path: Option<String>,
    },
    /// Encrypt a Secret value with the configured key
    Encrypt { text: String },
    /// Decrypt a Secret value with the configured key
    Decrypt { text: String },
}

fn init_tracing() {
    let env = std::env::var("KSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_config(args: &SyncArgs) -> Result<SyncConfig> {
    let url = args.repo.clone().ok_or_else(|| anyhow!("--repo (or KSYNC_REPO) is required"))?;
    let mut cfg = SyncConfig::new(SyncTarget { url, branch: args.branch.clone() });
    cfg.credentials = args.token.clone().map(|t| Credentials { user: None, token: SecretString::new(t) });
    cfg.cipher_key = args.secret_key.clone().map(SecretString::new);
    cfg.interval = args.interval_secs.map(Duration::from_secs);
    cfg.clone_depth = args.clone_depth;
    cfg.max_scan = args.max_scan;
    cfg.retry = RetryPolicy { attempts: args.retry_attempts, base_delay: Duration::from_millis(args.retry_delay_ms), ..RetryPolicy::default() };
    cfg.app = AppIdentity { namespace: args.app_ns.clone(), name: args.app_name.clone() };
    cfg.validate()?;
    Ok(cfg)
}

async fn build_engine(args: &SyncArgs) -> Result<Engine> {
    let config = build_config(args)?;
    let target = resolve_target(&config).await.context("resolving sync target")?;
    info!(target = %target, "sync target resolved");
    let cluster = KubeCluster::connect().await?;
    Ok(Engine::new(config, target, Arc::new(cluster))?)
}

fn secret_key(args: &SyncArgs) -> Result<String> {
    args.secret_key.clone().filter(|k| !k.is_empty()).ok_or_else(|| anyhow!("--secret-key (or KSYNC_SECRET_KEY) is required"))
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_forward(output: Output, r: &ForwardReport) -> Result<()> {
    match output {
        Output::Json => print_json(r),
        Output::Human => {
            let mode = if r.bootstrap { "bootstrap" } else { "forward" };
            println!("{}: {} commit(s), {} applied, {} deleted, {} skipped", mode, r.commits.len(), r.applied, r.deleted, r.skipped);
            if let Some(c) = &r.cursor { println!("cursor: {}", c); }
            Ok(())
        }
    }
}

fn print_reverse(output: Output, r: &ReverseReport) -> Result<()> {
    match output {
        Output::Json => print_json(r),
        Output::Human => {
            for f in &r.written { println!("+ {}", f); }
            for f in &r.removed { println!("- {}", f); }
            println!("{}", if r.committed { "committed and pushed" } else { "no changes" });
            Ok(())
        }
    }
}

fn print_text(output: Output, field: &str, value: &str) -> Result<()> {
    match output {
        Output::Human => { println!("{}", value); Ok(()) }
        Output::Json => print_json(&serde_json::json!({ field: value })),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encrypt { text } => {
            let out = ksync_cipher::encrypt(&text, &secret_key(&cli.sync)?)?;
            print_text(cli.output, "ciphertext", &out)?;
        }
        Commands::Decrypt { text } => {
            let out = ksync_cipher::decrypt(&text, &secret_key(&cli.sync)?)?;
            print_text(cli.output, "plaintext", &out)?;
        }
        Commands::Sync { event } => {
            let engine = build_engine(&cli.sync).await?;
            match event {
                Some(path) => {
                    let text = tokio::fs::read_to_string(&path).await.with_context(|| format!("reading {}", path))?;
                    let push: PushEvent = serde_json::from_str(&text).with_context(|| format!("parsing push event {}", path))?;
                    match engine.push_cycle(&push).await? {
                        Some(r) => print_forward(cli.output, &r)?,
                        None => println!("push is not for the sync target; nothing to do"),
                    }
                }
                None => {
                    let r = engine.forward_cycle().await?;
                    print_forward(cli.output, &r)?;
                }
            }
        }
        Commands::Bootstrap => {
            let engine = build_engine(&cli.sync).await?;
            let r = engine.bootstrap_cycle().await?;
            print_forward(cli.output, &r)?;
        }
        Commands::Export { gvks } => {
            let engine = build_engine(&cli.sync).await?;
            let mut objects = Vec::new();
            for gvk in &gvks {
                objects.extend(ksync_kubehub::list_objects(gvk, cli.namespace.as_deref()).await?);
            }
            info!(objects = objects.len(), "exporting to repository");
            let r = engine.reverse_cycle(&objects, SyncAction::Upsert).await?;
            print_reverse(cli.output, &r)?;
        }
        Commands::DeleteApp { name, path } => {
            let namespace = cli.namespace.clone().ok_or_else(|| anyhow!("--ns is required for delete-app"))?;
            let retry = RetryPolicy { attempts: cli.sync.retry_attempts.max(1), base_delay: Duration::from_millis(cli.sync.retry_delay_ms), ..RetryPolicy::default() };
            let cluster = KubeCluster::connect().await?;
            let applier = Applier::new(Arc::new(cluster), retry);
            let app = ApplicationRef { namespace, name, path };
            let deleted = applier.delete_application(&app).await?;
            match cli.output {
                Output::Json => print_json(&deleted)?,
                Output::Human => {
                    for id in &deleted { println!("- {}", id); }
                    if deleted.is_empty() { println!("nothing to delete"); }
                }
            }
        }
        Commands::Watch { gvks, flush_secs } => {
            let engine = Arc::new(build_engine(&cli.sync).await?);
            let (stop_tx, stop_rx) = watch::channel(false);
            let mut tasks = Vec::new();
            if let Some(every) = engine.config().interval {
                let engine = engine.clone();
                let rx = stop_rx.clone();
                tasks.push(tokio::spawn(async move { engine.run_periodic(every, rx).await }));
            }
            if !gvks.is_empty() {
                let engine = engine.clone();
                let rx = stop_rx.clone();
                let ns = cli.namespace.clone();
                let every = Duration::from_secs(flush_secs.max(1));
                tasks.push(tokio::spawn(ksync_engine::watcher::watch_cluster(engine, gvks, ns, every, rx)));
            }
            if tasks.is_empty() {
                warn!("nothing to watch: set --interval-secs and/or --gvk");
                return Ok(());
            }
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; finishing current cycle");
            let _ = stop_tx.send(true);
            for t in tasks {
                if let Err(e) = t.await {
                    error!(error = %e, "sync task panicked");
                }
            }
        }
    }
    Ok(())
}
