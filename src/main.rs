use std::sync::Arc;

use blockvoke::{
    backend::{BitcoindRpc, ChainBackend},
    config::Config,
    funding::fund_owners,
    orchestrator::Orchestrator,
    registration::register_certificates,
    registry::{CsvRegistryRepository, RegistryRepository},
    telemetry,
    transaction::TransactionPairBuilder,
};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(rpc = %config.rpc.url, registry = %config.registry.path.display(), "Loaded configuration");

    let backend: Arc<dyn ChainBackend> = Arc::new(BitcoindRpc::new(&config.rpc)?);
    let repository = Arc::new(CsvRegistryRepository::new(&config.registry.path));
    let registry = repository.load().await?;

    if let Some(dir) = &config.certificates.dir {
        register_certificates(
            backend.as_ref(),
            &registry,
            dir,
            &config.protocol.owner_label_suffix,
        )
        .await?;
        repository.save(&registry.snapshot().await).await?;
    }

    if config.funding.enabled {
        fund_owners(
            backend.clone(),
            &registry,
            &config.funding,
            &config.protocol.owner_label_suffix,
            config.protocol.fee_rate_sat_vb,
        )
        .await?;
        repository.save(&registry.snapshot().await).await?;
    }

    let builder = TransactionPairBuilder::new(backend.clone(), config.protocol.pair_params())?;
    let orchestrator = Orchestrator::new(backend, registry, builder, config.orchestrator())
        .with_repository(repository);

    let report = orchestrator
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!(
        sent = report.pairs_sent,
        skipped = report.pairs_skipped,
        failed = report.pairs_failed,
        orphaned = report.orphaned_funds.len(),
        interrupted = report.interrupted,
        certificates = report.snapshot.len(),
        "Done"
    );
    Ok(())
}
