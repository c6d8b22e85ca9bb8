use std::{sync::Arc, time::Duration};
use ergodesk::{BleTransport, DeskConfig, DeskController, Result};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🪑 Ergodesk Basic Control Example");
    info!("Searching for ErgoMate desks...");

    let transport = BleTransport::new().await?;

    // Use the address given on the command line, or the first desk found
    let address = match std::env::args().nth(1) {
        Some(address) => address,
        None => match transport.discover_desks().await?.into_iter().next() {
            Some(desk) => {
                info!("✅ Found: {} ({})", desk.name, desk.address);
                desk.address
            }
            None => {
                error!("❌ No desk found");
                return Err(ergodesk::DeskError::DeviceNotFound);
            }
        },
    };

    let desk = DeskController::new(DeskConfig::new(address), Arc::new(transport))?;
    if let Err(e) = desk.connect().await {
        error!("❌ Failed to connect to desk: {}", e);
        return Err(e);
    }
    info!("✅ Connected to: {}", desk.address());

    desk.subscribe_notifications().await?;
    sleep(Duration::from_secs(1)).await;
    match desk.current_height() {
        Some(height) => info!("📏 Current height: {:.1} cm", height),
        None => warn!("⚠️ Desk has not reported its height yet"),
    }

    // Stand up
    info!("⬆️ Moving to standing height (110 cm)...");
    if let Err(e) = desk.move_to_height(110.0).await {
        error!("❌ Failed to move desk: {}", e);
        return Err(e);
    }
    sleep(Duration::from_secs(15)).await;
    info!("📏 Height: {:?} cm", desk.current_height());

    // Sit down
    info!("⬇️ Moving to sitting height (72 cm)...");
    if let Err(e) = desk.move_to_height(72.0).await {
        error!("❌ Failed to move desk: {}", e);
        return Err(e);
    }
    sleep(Duration::from_secs(15)).await;
    info!("📏 Height: {:?} cm", desk.current_height());

    info!("🔌 Disconnecting...");
    desk.disconnect().await;
    info!("✅ Basic control example completed");

    Ok(())
}
