//! Scan, connect and discover services.
//!
//! Runs against the in-memory radio by default, scripting a nearby device.
//! Pass `--hardware` to scan with the first Bluetooth adapter instead.
//!
//! Run with: cargo run --example scan_and_connect [-- --hardware]

use std::sync::Arc;
use std::time::Duration;

use ble_session::{
    DeviceId, Intent, Result, ServiceDescriptor, ServiceDiscoveryState, SimulatedAdapter, Store,
    StoreConfig,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_session=debug".parse().unwrap()),
        )
        .init();

    if std::env::args().any(|arg| arg == "--hardware") {
        hardware().await
    } else {
        simulated().await
    }
}

async fn hardware() -> Result<()> {
    let store = Store::with_btleplug(StoreConfig::default()).await?;
    store.send(Intent::Appear)?;
    let state = store.wait_until(|s| s.radio.is_powered_on()).await;
    println!("Radio: {}", state.radio);

    store.send(Intent::StartScan)?;
    println!("Scanning for 10 seconds...\n");
    tokio::time::sleep(Duration::from_secs(10)).await;

    let state = store.state();
    println!("--- Scan Complete ---");
    println!("Devices found: {}", state.discovered.len());
    for device in state.devices_by_signal() {
        println!(
            "  {} - {} ({} dBm)",
            device.name.as_deref().unwrap_or("<unnamed>"),
            device.id,
            device.rssi
        );
    }

    store.shutdown().await
}

async fn simulated() -> Result<()> {
    let radio = Arc::new(SimulatedAdapter::powered_on());
    let store = Store::new(radio.clone(), StoreConfig::default());

    store.send(Intent::Appear)?;
    store.wait_until(|s| s.is_radio_ready()).await;

    store.send(Intent::StartScan)?;
    store.wait_until(|s| s.is_scanning).await;

    let widget = DeviceId::random();
    radio.advertise(widget, Some("Widget"), -50);
    radio.advertise(DeviceId::random(), None, -80);
    let state = store.wait_until(|s| s.discovered.len() == 2).await;
    for device in state.devices_by_signal() {
        println!("Discovered {} ({} dBm)", device.id, device.rssi);
    }

    store.send(Intent::Connect(widget))?;
    store.wait_until(|s| s.is_connecting()).await;
    radio.complete_connect(widget);
    store
        .wait_until(|s| s.connected_device() == Some(widget))
        .await;
    println!("Connected to {}", widget);

    store.send(Intent::DiscoverServices)?;
    store
        .wait_until(|s| s.service_discovery.is_in_progress())
        .await;
    radio.complete_discovery(
        widget,
        vec![
            ServiceDescriptor::primary(Uuid::from_u128(0x180d)),
            ServiceDescriptor::primary(Uuid::from_u128(0x180f)),
        ],
    );

    let state = store
        .wait_until(|s| matches!(s.service_discovery, ServiceDiscoveryState::Completed(_)))
        .await;
    if let ServiceDiscoveryState::Completed(services) = &state.service_discovery {
        println!("Services:");
        for service in services {
            println!("  {}", service.uuid);
        }
    }

    store.send(Intent::Disconnect)?;
    store.wait_until(|s| s.connection.is_none()).await;
    println!("Disconnected");

    store.shutdown().await?;
    println!("\nDone!");
    Ok(())
}
