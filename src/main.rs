use std::sync::Arc;

use anyhow::Result;
use env_logger::Env;

use mesh_drop::{
    config::ConfigStore,
    discovery,
    host::{EventBus, HostAdapter, LogNotifier, Notifier},
    transfer::{self, TRANSFER_PORT},
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Arc::new(ConfigStore::load()?);
    let events = EventBus::new();
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let discovery = discovery::Service::new(Arc::clone(&config), events.clone(), TRANSFER_PORT);
    discovery.start();

    let transfer = transfer::Service::new(
        Arc::clone(&config),
        Arc::clone(&discovery),
        events.clone(),
        notifier,
        TRANSFER_PORT,
    )?;
    transfer.load_history();
    transfer.start();

    let host = Arc::new(HostAdapter::new(
        config,
        discovery,
        Arc::clone(&transfer),
        events,
    ));
    // Headless event pump; a windowing host would forward these to its UI.
    {
        let mut events = host.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                log::debug!("host event: {}", event.name());
            }
        });
    }

    log::info!(
        "backend services started: discovery on udp :{}, transfers on tcp :{}",
        discovery::DISCOVERY_PORT,
        TRANSFER_PORT
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down, saving history");
    transfer.save_history();
    Ok(())
}
