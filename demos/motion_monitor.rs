//! Motion reading monitor example
//!
//! Run with: cargo run --example motion_monitor [interval|read|notify]

use accel_gyro_ble::{ConnectionState, ManagerConfig, ManagerUpdate, Result, Session};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("accel_gyro_ble=debug".parse().unwrap()),
        )
        .init();

    let config = match std::env::args().nth(1).as_deref() {
        Some("read") => ManagerConfig::direct_read(),
        Some("notify") => ManagerConfig::motion_notify(),
        _ => ManagerConfig::interval_request(),
    };

    println!("Motion Monitor");
    println!("==============\n");
    println!("Looking for the sensor...\n");

    let session = Session::start(config).await?;
    let mut updates = session.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            _ = ticker.tick() => {
                if session.connection_state() == ConnectionState::Connected {
                    if let Err(e) = session.request_update_now().await {
                        println!("Update request failed: {}", e);
                    }
                }
            }
            update = updates.recv() => match update {
                Ok(ManagerUpdate::Connection(state)) => {
                    println!("Sensor {}", state);
                    if state == ConnectionState::Disconnected {
                        println!("Restart to search again.");
                    }
                }
                Ok(ManagerUpdate::Data { text, is_requested, received_at }) => {
                    let source = if is_requested { "read" } else { "notify" };
                    println!("[{}] {:>6}  {}", received_at.format("%H:%M:%S%.3f"), source, text);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            },
        }
    }

    session.shutdown().await?;

    Ok(())
}
