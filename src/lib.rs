// Public modules
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod fusion;
pub mod messages;
pub mod registry;
pub mod scheduler;
pub mod sensors;
pub mod state_store;

// Re-export commonly used types
pub use config::{load_bus_config, load_sensor_config, BusConfig, SensorConfig};
pub use dispatch::{BroadcastSink, OutputKind, ValueSink};
pub use errors::{SensorError, SensorResult};
pub use messages::ValueMessage;
pub use registry::init_all;
pub use scheduler::{spawn_sensor_tasks, Bme68xComponent, CycleOutcome, CyclePhase};

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Capacity of the channel between components and the value logger
const VALUE_CHANNEL_CAPACITY: usize = 256;

/// Initialize tracing with default configuration
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Run the sensor hub with the given configuration path until Ctrl-C.
///
/// Published values are logged, or printed as JSON lines when
/// `output_json` is set.
pub async fn run_sensor_hub(config_path: &str, output_json: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("[BME68xSensorHub] starting up...");

    let sensor_config = load_sensor_config(&format!("{}/sensors.toml", config_path))?;
    let bus_config = load_bus_config(&format!("{}/buses.toml", config_path))?;
    info!(
        "[config] loaded {} sensor(s) on {} bus(es)",
        sensor_config.sensors.len(),
        bus_config.buses.len()
    );

    let sink = BroadcastSink::new(VALUE_CHANNEL_CAPACITY);
    let values = sink.subscribe();
    let components = init_all(&sensor_config, &bus_config, Arc::new(sink)).await?;
    info!("[registry] sensors and buses initialized");

    let printer = tokio::spawn(log_values(values, output_json));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_sensor_tasks(components, shutdown_rx);
    info!("[main] {} sensor task(s) launched", handles.len());

    tokio::signal::ctrl_c().await?;
    info!("[main] shutdown requested, saving fusion state");
    // Receivers may already be gone if every task panicked
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("[main] sensor task ended abnormally: {}", e);
        }
    }
    printer.abort();
    info!("[main] stopped");
    Ok(())
}

async fn log_values(mut values: broadcast::Receiver<ValueMessage>, output_json: bool) {
    loop {
        match values.recv().await {
            Ok(msg) if output_json => match msg.to_json() {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("[output] could not encode value: {}", e),
            },
            Ok(msg) => {
                let accuracy = msg.accuracy.map(|a| format!(" (accuracy {})", a.level())).unwrap_or_default();
                info!(
                    "[{}] {} = {:.*} {}{}",
                    msg.sensor_id,
                    msg.channel,
                    msg.accuracy_decimals as usize,
                    msg.value,
                    msg.unit,
                    accuracy
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("[output] dropped {} value(s)", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
