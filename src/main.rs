use tracing::info;

use bookd::config::Config;
use bookd::engine::BookingService;
use bookd::model::Actor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bookd::observability::init_tracing();

    let config = Config::from_env()?;
    bookd::observability::init(config.metrics_port)?;

    let service = BookingService::open(&config)?;
    let providers = service.list_providers().await?;
    let appointments = service
        .list_appointments(&Actor::administrator(ulid::Ulid::nil()))
        .await?;

    info!("bookd ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  quota: {} ({:?} on reschedule)", config.quota, config.reschedule_quota);
    info!("  providers: {}, confirmed appointments: {}", providers.len(), appointments.len());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Keep the metrics endpoint up until asked to stop.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutting down, compacting booking log");
    service.ledger().repository().compact().await?;
    Ok(())
}
