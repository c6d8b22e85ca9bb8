use std::time::Duration;
use ergodesk::{DeskConfig, DeskController, Result};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("⏱️ Ergodesk Timed Move Example");

    let Some(address) = std::env::args().nth(1) else {
        error!("❌ Usage: timed_move <desk address> [seconds]");
        return Ok(());
    };
    let seconds = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    let desk = DeskController::with_ble(DeskConfig::new(address)).await?;
    desk.connect().await?;
    desk.subscribe_notifications().await?;

    info!("⬆️ Moving up for {} s...", seconds);
    if let Err(e) = desk.move_up_for(Duration::from_secs(seconds)).await {
        error!("❌ Timed move failed: {}", e);
        // Make sure the desk does not keep moving
        if let Err(e) = desk.stop().await {
            warn!("⚠️ Stop failed as well: {}", e);
        }
    }
    info!("📏 Height: {:?} cm", desk.current_height());

    info!("⬇️ Moving down for {} s...", seconds);
    if let Err(e) = desk.move_down_for(Duration::from_secs(seconds)).await {
        error!("❌ Timed move failed: {}", e);
        if let Err(e) = desk.stop().await {
            warn!("⚠️ Stop failed as well: {}", e);
        }
    }
    info!("📏 Height: {:?} cm", desk.current_height());

    if desk.is_at_minimum() == Some(true) {
        info!("✅ Desk is fully lowered");
    }

    desk.disconnect().await;
    info!("✅ Timed move example completed");
    Ok(())
}
