//! Cloud resource operator binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;

use cro_common::retry::PollConfig;
use cro_common::telemetry::{init_telemetry, TelemetryConfig};
use cro_common::{
    DEFAULT_CONFIG_NAMESPACE, DEFAULT_STRATEGY_CONFIG_MAP, REQUEUE_CONFIG_ERROR_SECS,
};
use cro_operator::runner::{build_controllers, build_registry, crds_yaml, ensure_crds_installed};
use cro_operator::{Context, ControllerSettings};
use cro_provider::credentials::CredentialsRequestBroker;
use cro_provider::strategy::{ConfigMapStrategyResolver, StaticStrategyResolver};
use cro_provider::{CredentialBroker, StrategyResolver};

/// Provisions cloud caches and buckets for `Redis` and `BlobStorage` requests
#[derive(Parser, Debug)]
#[command(name = "cro-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default)
    Run,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Namespace of the strategy ConfigMap
    #[arg(long, env = "CRO_CONFIG_NAMESPACE", default_value = DEFAULT_CONFIG_NAMESPACE, global = true)]
    config_namespace: String,

    /// Name of the strategy ConfigMap
    #[arg(long, default_value = DEFAULT_STRATEGY_CONFIG_MAP, global = true)]
    strategy_config: String,

    /// Read strategies from a JSON file instead of the ConfigMap
    #[arg(long, env = "CRO_STRATEGY_FILE", global = true)]
    strategy_file: Option<PathBuf>,

    /// Requeue interval while provisioning and after success
    #[arg(long, default_value_t = 30, global = true)]
    requeue_secs: u64,

    /// Deadline for a single pass
    #[arg(long, default_value_t = 600, global = true)]
    pass_timeout_secs: u64,

    /// Interval between external list attempts
    #[arg(long, default_value_t = 5, global = true)]
    list_poll_interval_secs: u64,

    /// Ceiling for retrying an external list
    #[arg(long, default_value_t = 300, global = true)]
    list_poll_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds_yaml()?);
        return Ok(());
    }

    let telemetry = init_telemetry(TelemetryConfig::default())?;
    if telemetry.exporting() {
        tracing::info!("exporting traces and metrics over OTLP");
    }

    let result = match cli.command {
        Some(Commands::Run) | None => run(cli.run).await,
    };
    telemetry.shutdown();
    result
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let broker: Arc<dyn CredentialBroker> =
        Arc::new(CredentialsRequestBroker::new(client.clone()));
    let list_poll = PollConfig::from_secs(args.list_poll_interval_secs, args.list_poll_timeout_secs);
    let registry = Arc::new(build_registry(broker, list_poll)?);

    let resolver: Arc<dyn StrategyResolver> = match &args.strategy_file {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
            tracing::info!(path = %path.display(), "using strategies from file");
            Arc::new(StaticStrategyResolver::from_json(&document)?)
        }
        None => {
            tracing::info!(
                namespace = %args.config_namespace,
                config_map = %args.strategy_config,
                "using strategies from ConfigMap"
            );
            Arc::new(ConfigMapStrategyResolver::new(
                client.clone(),
                args.config_namespace.clone(),
                args.strategy_config.clone(),
            ))
        }
    };

    let settings = ControllerSettings {
        requeue_after: Duration::from_secs(args.requeue_secs),
        config_error_resync: Duration::from_secs(REQUEUE_CONFIG_ERROR_SECS),
        pass_timeout: Duration::from_secs(args.pass_timeout_secs),
        ..Default::default()
    };
    let ctx = Arc::new(
        Context::builder(client.clone(), registry, resolver)
            .settings(settings)
            .shutdown(shutdown)
            .build(),
    );

    tracing::info!("Starting cloud resource controllers");
    let controllers = build_controllers(client, ctx, args.namespace.as_deref());
    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped");
    Ok(())
}

/// Cancel in-flight passes when the process is asked to stop
///
/// The kube runtime drains its own queues on the same signals; cancelling
/// here makes providers give up their external calls instead of holding the
/// drain open.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown requested, cancelling in-flight passes");
    shutdown.cancel();
}
