use liftwire::{BtleLink, ConnectionManager, Result, TrainerError};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Liftwire Status Monitor Example");
    info!("Searching for trainers...");

    let link = Arc::new(BtleLink::new().await?);
    let manager = ConnectionManager::new(link);

    let devices = manager.start_scanning().await?;
    let Some(device) = devices.first() else {
        error!("❌ No trainer found");
        return Err(TrainerError::DeviceNotFound);
    };

    info!(
        "✅ Found: {} ({} dBm)",
        device.name.as_deref().unwrap_or(&device.address),
        device.rssi
    );

    if let Err(e) = manager.connect(device).await {
        error!("❌ Failed to connect: {e}");
        return Err(e);
    }

    info!("🔍 Monitoring metrics, reps and faults...");
    info!("Press Ctrl+C to stop");

    let mut metrics = manager.metrics();
    let mut reps = manager.rep_events();
    let mut deloads = manager.deload_events();
    let mut reconnects = manager.reconnection_requests();
    let mut sample_count = 0u64;
    let mut max_load: f32 = 0.0;

    loop {
        tokio::select! {
            sample = metrics.recv() => {
                let Ok(sample) = sample else { continue };
                sample_count += 1;
                max_load = max_load.max(sample.load_a.max(sample.load_b));

                // metrics arrive fast; print a summary every 50th sample
                if sample_count % 50 == 0 {
                    println!(
                        "📏 pos {:7.1}/{:7.1} mm  vel {:7.1}/{:7.1} mm/s  load {:5.1}/{:5.1} kg",
                        sample.position_a,
                        sample.position_b,
                        sample.velocity_a,
                        sample.velocity_b,
                        sample.load_a,
                        sample.load_b,
                    );
                }
            }
            rep = reps.recv() => {
                if let Ok(rep) = rep {
                    println!(
                        "🔁 Rep! complete: {}  top: {}  ROM {:.0}-{:.0} mm",
                        rep.complete_counter, rep.top_counter, rep.range_bottom, rep.range_top
                    );
                }
            }
            deload = deloads.recv() => {
                if let Ok(event) = deload {
                    println!(
                        "⚠️  DELOAD: subsystem {} fault {} — {}",
                        event.channel, event.fault_code, event.message
                    );
                }
            }
            request = reconnects.recv() => {
                if let Ok(request) = request {
                    warn!("❌ Connection lost to {}: {}", request.device_name, request.reason);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl+C received");
                break;
            }
        }
    }

    let stats = manager.poll_stats().await;
    println!("\n📊 Final Session Summary:");
    println!("  Samples: {sample_count}");
    println!("  Max load: {max_load:.1} kg");
    println!(
        "  Poll gaps: min {:.1} ms / mean {:.1} ms / max {:.1} ms",
        stats.min_gap_ms, stats.mean_gap_ms, stats.max_gap_ms
    );

    info!("🔌 Disconnecting...");
    manager.disconnect().await;
    info!("🎉 Status monitoring completed!");
    Ok(())
}
