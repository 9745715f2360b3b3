use std::net::TcpListener;
use std::sync::Arc;

use authgate::clock::{Clock, SystemClock};
use authgate::configuration::get_configuration;
use authgate::startup::{connect_store, run, AppState};
use authgate::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Configuration is loaded before logging so its format can be honoured.
    let configuration = match get_configuration() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to read configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Configuration error",
            ));
        }
    };

    init_telemetry(configuration.telemetry.format);
    tracing::info!("Configuration loaded successfully");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = connect_store(&configuration.store, clock.clone())
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to store: {}", e);
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Store connection error")
        })?;

    let state = AppState::new(&configuration, store, clock).map_err(|e| {
        tracing::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Configuration error")
    })?;

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!("Server listening on: {}", address);

    run(listener, state)?.await
}
