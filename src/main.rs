use funkwerk::commands::App;
use funkwerk::infrastructure::logging;

#[tokio::main]
async fn main() {
    logging::init_logging();

    let app = App::bootstrap().await;

    // Headless runs have no frontend attached; keep a receiver draining the
    // bus and tracing events for diagnosis.
    let mut events = app.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log::debug!("event {}: {}", event.name, event.payload),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to wait for shutdown signal: {err}");
    }
    log::info!("Shutting down");
    app.shutdown().await;
}
