use ftms_treadmill::{
    ble::BtleplugTransport, ConnectionParams, ConnectionState, Result, Treadmill, TreadmillConfig,
    TreadmillEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 FTMS Session Monitor");
    info!("Searching for FTMS treadmills...");

    let params = ConnectionParams {
        name_filter: std::env::args().nth(1),
        ..ConnectionParams::default()
    };
    let transport = match BtleplugTransport::discover_first(&params).await {
        Ok(transport) => transport,
        Err(e) => {
            error!("❌ No treadmill found: {}", e);
            return Err(e);
        }
    };

    let advertised = transport.local_name().await;
    let treadmill = Treadmill::new(transport, TreadmillConfig::default());
    let mut events = treadmill.subscribe();
    treadmill.connect().await?;
    info!(
        "✅ Connected to: {}",
        treadmill
            .device_name()
            .await
            .or(advertised)
            .unwrap_or_else(|| "unnamed treadmill".to_string())
    );
    if !treadmill.is_control_available().await {
        warn!("Treadmill has no control point, monitoring only");
    }

    info!("Press Ctrl+C to stop monitoring");
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(TreadmillEvent::TelemetrySample(sample)) => println!(
                "🏃 {:4.1} mph | {:5.2} mi | {} | {} kcal",
                sample.speed_mph, sample.distance_miles, sample.formatted_time, sample.energy_kcal
            ),
            Ok(TreadmillEvent::TrainingStatusChanged(status)) => {
                println!("📋 Training status: {}", status.kind);
            }
            Ok(TreadmillEvent::ConnectionStateChanged { state, .. }) => {
                println!("🔗 {state}");
                if state == ConnectionState::Disconnected {
                    break;
                }
            }
            Ok(TreadmillEvent::Reconnected) => println!("🔁 Link recovered"),
            Ok(TreadmillEvent::SessionEnded(session)) => {
                println!("\n📈 Session Summary:");
                println!("  Duration: {}s", session.duration_seconds);
                println!("  Distance: {:.2} mi", session.distance_miles);
                println!("  Average Speed: {:.1} mph", session.average_speed_mph);
                println!("  Energy: {} kcal\n", session.energy_kcal);
            }
            Ok(TreadmillEvent::TargetSpeedChanged(mph)) => println!("🎯 Target {mph:.1} mph"),
            Ok(TreadmillEvent::Disconnected) => break,
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }

    info!("🔌 Disconnecting...");
    if let Err(e) = treadmill.disconnect().await {
        error!("❌ Failed to disconnect: {}", e);
    }

    let sessions = treadmill.store().sessions().await;
    info!("🎉 Monitoring completed, {} session(s) recorded", sessions.len());
    Ok(())
}
