//! Poll a vehicle's status and print what changes.
//!
//! Usage: `carread [CONFIG_PATH] [INTERVAL_SECS]`
//!
//! `CONFIG_PATH` defaults to `carread.json`, `INTERVAL_SECS` to 5. Set `RUST_LOG=carread=debug`
//! to watch the exchange, or `trace` for every byte.

use std::time::Duration;

use anyhow::Context;
use carread::transport::bluest::BluestTransport;
use carread::{ClientConfig, ConnectOptions, VehicleClient};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "carread.json";
const DEFAULT_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let interval = match args.next() {
        Some(secs) => secs.parse().with_context(|| format!("invalid interval {secs:?}"))?,
        None => DEFAULT_INTERVAL_SECS,
    };
    let interval = Duration::from_secs(interval);

    let config = ClientConfig::load(&config_path).with_context(|| format!("loading {config_path}"))?;
    let transport = BluestTransport::new().await.context("opening the Bluetooth adapter")?;
    let mut client = VehicleClient::new(transport, config)?;
    info!(name = client.ble_name(), vin = %client.vin(), "looking for vehicle");

    tokio::select! {
        result = poll(&mut client, interval) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    client.disconnect().await;
    Ok(())
}

async fn poll(client: &mut VehicleClient<BluestTransport>, interval: Duration) -> anyhow::Result<()> {
    let mut printed_initial = false;
    loop {
        if !client.is_connected() {
            if let Err(err) = client.connect(ConnectOptions::default()).await {
                warn!(error = %err, "connect failed, retrying");
                sleep(interval).await;
                continue;
            }
        }

        match client.send_status_request().await {
            Ok(update) if !printed_initial => {
                println!("{}", update.status);
                printed_initial = true;
            }
            Ok(update) => {
                for change in &update.changes {
                    println!("{change}");
                }
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "status request failed, reconnecting");
                client.disconnect().await;
            }
            Err(err) => warn!(error = %err, "could not read status"),
        }

        sleep(interval).await;
    }
}
