//! Composition root: config, logging, wiring, graceful shutdown.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use opflow_bundler::{Bundler, BundlerConfig};
use opflow_cache::RedisKvStore;
use opflow_datastore::PostgresDatastore;
use opflow_entrypoint::EntryPointClient;
use opflow_mempool::{Mempool, MempoolConfig};
use opflow_rpc::{HealthService, RateLimiter, RpcMetrics, RpcState, router};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about = "ERC-4337 bundler service", long_about = None)]
struct Config {
    /// Address to bind the HTTP server to
    #[arg(long, env = "ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,

    /// HTTP listen port
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Durable store DSN
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// KV store DSN
    #[arg(long, env = "REDIS_URL")]
    redis_url: String,

    /// EVM RPC endpoint
    #[arg(long, env = "ETH_RPC_URL")]
    eth_rpc_url: Url,

    /// Expected chain id
    #[arg(long, env = "CHAIN_ID")]
    chain_id: u64,

    /// The sole supported EntryPoint
    #[arg(long, env = "ENTRY_POINT_ADDRESS")]
    entry_point_address: Address,

    /// Signing key for handleOps submissions
    #[arg(long, env = "BUNDLER_PRIVATE_KEY", hide_env_values = true)]
    bundler_private_key: String,

    /// Fee recipient passed to handleOps
    #[arg(long, env = "BUNDLER_BENEFICIARY")]
    bundler_beneficiary: Address,

    /// Minimum signer balance in wei before health degrades (default 0.1 ETH)
    #[arg(
        long,
        env = "BUNDLER_MIN_SIGNER_BALANCE",
        default_value = "100000000000000000"
    )]
    bundler_min_signer_balance: U256,

    #[arg(long, env = "MAX_OPS_PER_BUNDLE", default_value = "10")]
    max_ops_per_bundle: usize,

    #[arg(long, env = "BUNDLE_INTERVAL_MS", default_value = "5000")]
    bundle_interval_ms: u64,

    #[arg(long, env = "TX_TIMEOUT_MS", default_value = "120000")]
    tx_timeout_ms: u64,

    #[arg(long, env = "MAX_BUNDLE_GAS", default_value = "10000000")]
    max_bundle_gas: u64,

    #[arg(long, env = "LOCK_TTL_MS", default_value = "30000")]
    lock_ttl_ms: u64,

    #[arg(long, env = "MAX_MEMPOOL_SIZE", default_value = "1000")]
    max_mempool_size: usize,

    /// TTL on cached user operations (default 24h)
    #[arg(long, env = "MEMPOOL_TTL_SECONDS", default_value = "86400")]
    mempool_ttl_seconds: u64,

    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "60000")]
    sweep_interval_ms: u64,

    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value = "60000")]
    rate_limit_window_ms: u64,

    /// 0 disables ingress rate limiting
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value = "100")]
    rate_limit_max_requests: u32,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "10")]
    database_max_connections: u32,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false),
    );
    tracing::subscriber::set_global_default(registry)?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    info!(
        port = config.port,
        chain_id = config.chain_id,
        entry_point = %config.entry_point_address,
        "starting opflow bundler"
    );

    // Start order: durable store, cache, chain adapter, then the services
    // that consume them.
    let datastore = Arc::new(
        PostgresDatastore::connect(&config.database_url, config.database_max_connections)
            .await
            .context("connect DATABASE_URL")?,
    );
    datastore.migrate().await.context("run migrations")?;

    let kv = Arc::new(
        RedisKvStore::connect(&config.redis_url)
            .await
            .context("connect REDIS_URL")?,
    );

    let signer: PrivateKeySigner = config
        .bundler_private_key
        .parse()
        .context("parse BUNDLER_PRIVATE_KEY")?;
    let entry_point = Arc::new(EntryPointClient::new(
        config.eth_rpc_url.clone(),
        signer,
        config.entry_point_address,
        config.chain_id,
    ));

    let mempool = Arc::new(Mempool::new(
        datastore.clone(),
        kv.clone(),
        entry_point.clone(),
        MempoolConfig {
            max_size: config.max_mempool_size,
            ttl: Duration::from_secs(config.mempool_ttl_seconds),
        },
    ));

    let bundler = Arc::new(Bundler::new(
        mempool.clone(),
        datastore.clone(),
        datastore.clone(),
        kv.clone(),
        entry_point.clone(),
        BundlerConfig {
            interval: Duration::from_millis(config.bundle_interval_ms),
            max_ops_per_bundle: config.max_ops_per_bundle,
            max_bundle_gas: config.max_bundle_gas,
            tx_timeout: Duration::from_millis(config.tx_timeout_ms),
            lock_ttl: Duration::from_millis(config.lock_ttl_ms),
            ..BundlerConfig::with_beneficiary(config.bundler_beneficiary)
        },
    ));

    let health = Arc::new(HealthService::new(
        datastore.clone(),
        kv.clone(),
        entry_point.clone(),
        config.bundler_min_signer_balance,
    ));

    let state = RpcState {
        mempool: mempool.clone(),
        bundles: datastore.clone(),
        entry_point: entry_point.clone(),
        bundler: bundler.handle(),
        health,
        rate_limiter: Arc::new(RateLimiter::new(
            Duration::from_millis(config.rate_limit_window_ms),
            config.rate_limit_max_requests,
        )),
        metrics: RpcMetrics::default(),
        prometheus: Some(prometheus),
    };
    let app = router(state);

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    {
        let bundler = bundler.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { bundler.run(shutdown).await });
    }
    tasks.spawn(
        mempool
            .clone()
            .run_sweeper(Duration::from_millis(config.sweep_interval_ms), shutdown.clone()),
    );

    let bind_addr = SocketAddr::from((config.address, config.port));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("bind listen address")?;
    info!(address = %bind_addr, "rpc server started");

    // Ingress stops first; the bundler then drains (an in-flight bundle is
    // awaited up to TX_TIMEOUT inside the loop) before stores close.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server")?;

    info!("ingress stopped, draining workers");
    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "worker task panicked");
        }
    }
    datastore.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
