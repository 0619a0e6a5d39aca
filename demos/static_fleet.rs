use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use scale_bridge::{
    BridgeConfig, DeviceRegistry, HttpIdentityResolver, LoggingSink, NoopMetrics, RegistryEvent,
    ScaleEndpointConfig,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Bridges a fixed list of scales to the log for a minute.
///
/// Pass a JSON `BridgeConfig` path as the first argument, otherwise a single
/// scale at 192.168.1.50:4001 is used.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str::<BridgeConfig>(&std::fs::read_to_string(path)?)?,
        None => {
            let mut config = BridgeConfig::default();
            config.scales.push(ScaleEndpointConfig::new(
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
                0,
                4001,
            ));
            config
        }
    };
    config.validate()?;

    println!("Starting scale bridge:");
    println!("- Scales: {}", config.scales.len());
    println!("- Health interval: {:?}", config.registry.health_interval);
    println!("- Validation timeout: {:?}", config.registry.link.validation_timeout);

    let resolver = HttpIdentityResolver::new(config.registry.identity.clone())?;
    let registry = DeviceRegistry::new(
        config.registry.clone(),
        Arc::new(LoggingSink::new("scales")),
        Arc::new(NoopMetrics),
        Arc::new(resolver),
    );

    let mut events = registry.subscribe();
    registry.initialize(config.scales.clone()).await?;
    registry.start_streaming(None).await?;

    let run = sleep(Duration::from_secs(60));
    tokio::pin!(run);
    loop {
        tokio::select! {
            _ = &mut run => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(RegistryEvent::Health(snapshots)) => {
                    for health in snapshots {
                        println!(
                            "{:<16} connected={} errors={} reconnects={}",
                            health.scale_id,
                            health.is_connected,
                            health.error_count,
                            health.reconnect_attempts
                        );
                    }
                }
                Ok(other) => println!("{:?}", other),
                Err(_) => continue,
            },
        }
    }

    registry.shutdown().await;
    Ok(())
}
