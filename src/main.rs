use gatehouse::echo::EchoExecutor;
use gatehouse::{Server, ServerConfig};
use gatehouse_lifecycle::SignalListener;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };

    let level: tracing::Level = config.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    // Before any thread exists, so every thread inherits the blocked mask.
    let signals = SignalListener::install()?;

    let server = Server::builder()
        .with_config(config)
        .with_executor(Arc::new(EchoExecutor::default()))
        .start()?;

    signals.spawn(server.orchestrator(), || {
        tracing::info!("Reload requested; configuration is read at startup only");
    })?;

    let report = server.wait();
    tracing::info!(
        "Gatehouse: stopped ({:?}) after {:?}, {} sessions forcibly closed",
        report.reason,
        report.elapsed,
        report.forced_closed
    );
    Ok(())
}
