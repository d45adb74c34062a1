use anyhow::Context;
use marketfeed::config::AppConfig;
use marketfeed::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = AppConfig::from_env().context("configuration")?;

    if let Some(core) = config.cpu_core {
        pin_to_core(core);
    }

    tracing::info!(
        symbols = config.symbols.len(),
        symbols_per_shard = config.symbols_per_shard,
        "starting marketfeed"
    );

    let orchestrator = Orchestrator::start(config)
        .await
        .context("pipeline startup")?;

    tokio::signal::ctrl_c()
        .await
        .context("shutdown signal handler")?;
    tracing::info!("shutdown requested");

    orchestrator.stop().await;
    Ok(())
}

/// Pin the process to a core when configured; a miss is only a warning.
fn pin_to_core(core: usize) {
    match core_affinity::get_core_ids() {
        Some(cores) => match cores.into_iter().find(|c| c.id == core) {
            Some(core_id) => {
                if core_affinity::set_for_current(core_id) {
                    tracing::info!(core, "pinned to core");
                } else {
                    tracing::warn!(core, "core pinning failed");
                }
            }
            None => tracing::warn!(core, "configured core does not exist"),
        },
        None => tracing::warn!("core enumeration unavailable"),
    }
}
