use bme68x_sensorhub::{init_tracing, run_sensor_hub};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG=debug for per-cycle detail, RUST_LOG=warn to see only failures
    init_tracing();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    let output_json = std::env::var("OUTPUT_JSON").is_ok_and(|v| v == "1");
    run_sensor_hub(&config_path, output_json).await
}
