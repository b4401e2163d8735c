use deposit_guardian::chain::{AlloyChainClient, BlockNotifier, ChainClient};
use deposit_guardian::config::{Config, TransportKind};
use deposit_guardian::deposit::abi::topic_mismatches;
use deposit_guardian::deposit::{DepositCacheStore, DepositContract, DepositService, DepositSettings};
use deposit_guardian::guardian::{CommandPauser, DryRunPauser, Guardian, ProtocolPauser};
use deposit_guardian::registry::ContractRegistry;
use deposit_guardian::transport::{message_topic, MemoryTransport, Transport, WebhookTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config_path =
        PathBuf::from(std::env::var("GUARDIAN_CONFIG").unwrap_or_else(|_| "guardian.toml".into()));
    let config_from_file = config_path.exists();
    let config = if config_from_file {
        Config::load(&config_path)?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("deposit-guardian v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_from_file {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    config.validate()?;

    let mismatches = topic_mismatches();
    if !mismatches.is_empty() {
        anyhow::bail!("topic hash mismatch for {}", mismatches.join(", "));
    }

    // --- Chain ---
    let client = AlloyChainClient::connect(
        &config.rpc.url,
        Duration::from_millis(config.rpc.request_timeout_ms),
        Duration::from_millis(config.rpc.block_poll_interval_ms),
    )
    .await?;
    let chain: Arc<dyn ChainClient> = Arc::new(client);
    let chain_id = chain.chain_id().await?;
    info!(chain_id, "connected to chain");

    let lido = config.lido_address()?;
    let registry_address = config.registry_address()?;

    // --- Deposits ---
    let store = DepositCacheStore::new(&config.deposit.cache_dir, chain_id);
    let contract = Arc::new(DepositContract::new(chain.clone(), lido));
    let deposits = Arc::new(DepositService::new(
        chain.clone(),
        contract,
        store,
        DepositSettings::from(&config.deposit),
    ));

    // --- Guardian collaborators ---
    let registry = Arc::new(ContractRegistry::new(
        chain.clone(),
        registry_address,
        lido,
        config.registry.max_deposit_keys,
    ));

    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Memory => {
            warn!("memory transport: messages stay inside this process");
            Arc::new(MemoryTransport::new())
        }
        TransportKind::Webhook => {
            let url = config.transport.webhook_url.clone().unwrap_or_default();
            Arc::new(WebhookTransport::new(
                url,
                Duration::from_millis(config.rpc.request_timeout_ms),
            )?)
        }
    };

    let pauser: Arc<dyn ProtocolPauser> = match &config.guardian.pause_command {
        Some(command) => Arc::new(CommandPauser::new(command)?),
        None => {
            warn!("no pause command configured, running in dry-run mode");
            Arc::new(DryRunPauser)
        }
    };

    let topic = message_topic(&config.transport.topic_prefix, chain_id);
    let guardian = Arc::new(Guardian::new(
        deposits.clone(),
        registry,
        transport,
        pauser,
        topic,
    ));

    // --- Startup ---
    let notifier = BlockNotifier::new();
    let mut tasks = Vec::new();

    if let Some(handle) = guardian.subscribe_to_transport().await {
        tasks.push(handle);
    }

    if deposits.initialize().await.is_none() {
        warn!("initial deposit cache refresh incomplete, will retry on new blocks");
    }

    tasks.push(deposits.start(&notifier));
    tasks.push(guardian.start(&notifier));
    tasks.push(notifier.start(chain.clone()));

    info!(topic = %guardian.topic(), "guardian running, Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    for task in tasks {
        task.abort();
    }

    Ok(())
}
