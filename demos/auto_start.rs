use liftwire::{BtleLink, ConnectionManager, HandleActivityState, Result, TrainerError};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏋️ Liftwire Auto-Start Example");
    info!("Searching for trainers...");

    let link = Arc::new(BtleLink::new().await?);
    let manager = ConnectionManager::new(link);

    let devices = manager.start_scanning().await?;
    let Some(device) = devices.first() else {
        error!("❌ No trainer found");
        return Err(TrainerError::DeviceNotFound);
    };

    if let Err(e) = manager.connect(device).await {
        error!("❌ Failed to connect: {e}");
        return Err(e);
    }

    // Arm grab detection: the workout starts when the user takes hold of
    // the handles and stops when they let go.
    manager.enable_handle_detection().await;
    info!("💪 Grab the handles to start the workout");

    let mut handle_state = manager.handle_state();
    let mut workout_running = false;

    loop {
        tokio::select! {
            changed = handle_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *handle_state.borrow_and_update();
                println!("🤚 Handle state: {state}");

                match state {
                    HandleActivityState::Grabbed if !workout_running => {
                        info!("▶️  Handles grabbed, starting workout");
                        manager.start_workout().await?;
                        workout_running = true;
                    }
                    HandleActivityState::Released if workout_running => {
                        info!("⏹️  Handles released, stopping workout");
                        manager.stop_workout().await?;
                        workout_running = false;
                        // re-arm for the next set
                        manager.reset_handle_state().await;
                        info!("💪 Grab the handles to start the next set");
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl+C received");
                break;
            }
        }
    }

    if workout_running {
        if let Err(e) = manager.stop_workout().await {
            error!("❌ Failed to stop workout: {e}");
        }
    }

    info!("🔌 Disconnecting...");
    manager.disconnect().await;
    info!("🎉 Auto-start session completed!");
    Ok(())
}
