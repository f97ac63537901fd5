//! Basic example: scan, connect to the strongest device and print its GATT tree
//!
//! Run with: cargo run --example scan_and_discover [ADDRESS]

use ble_gatt_bridge::{
    ConnectionState, DeviceManager, GattEvent, ManagerConfig, Result, ScanSettings,
    ServiceSnapshot,
};
use std::time::Duration;

fn print_service(service: &ServiceSnapshot, indent: usize) {
    let pad = " ".repeat(indent);
    let kind = if service.is_primary { "primary" } else { "included" };
    println!("{}Service {} ({})", pad, service.uuid, kind);

    for characteristic in &service.characteristics {
        println!(
            "{}  Characteristic {} [properties {:#04x}]",
            pad, characteristic.path.uuid, characteristic.properties.0
        );
        for descriptor in &characteristic.descriptors {
            println!("{}    Descriptor {}", pad, descriptor.path.uuid);
        }
    }

    for included in &service.included_services {
        print_service(included, indent + 2);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_gatt_bridge=info".parse().unwrap()),
        )
        .init();

    let target = std::env::args().nth(1);
    let manager = DeviceManager::with_btleplug(ManagerConfig::default()).await?;
    let mut events = manager.subscribe();

    let settings = match &target {
        Some(address) => ScanSettings::for_device(address.clone()),
        None => ScanSettings::new(),
    };
    manager.start_scan(settings)?;

    println!("Scanning for 10 seconds...");
    tokio::time::sleep(Duration::from_secs(10)).await;
    manager.stop_scan()?;

    let Some(device) = manager
        .devices()
        .into_iter()
        .filter(|d| d.rssi().is_some())
        .max_by_key(|d| d.rssi())
    else {
        println!("No devices found.");
        return Ok(());
    };

    println!(
        "Connecting to {} ({}), RSSI {:?} dBm",
        device.name(),
        device.address(),
        device.rssi()
    );
    manager.connect(device.address(), false)?;

    let connected = tokio::time::timeout(Duration::from_secs(20), async {
        while let Ok(event) = events.recv().await {
            if let GattEvent::DeviceStateChanged { remote_id, state, .. } = event {
                match state {
                    _ if remote_id != device.address() => {}
                    ConnectionState::Connected => return true,
                    ConnectionState::Disconnected => return false,
                    _ => {}
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !connected {
        println!("Connection failed.");
        manager.shutdown()?;
        return Ok(());
    }

    for service in manager.discover_services(device.address())? {
        print_service(&service, 0);
    }

    manager.shutdown()?;
    println!("\nDone!");

    Ok(())
}
