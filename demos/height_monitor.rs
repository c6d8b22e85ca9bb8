use std::time::Duration;
use ergodesk::{DeskConfig, DeskController, Result};
use tokio::time::interval;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Ergodesk Height Monitor Example");

    let Some(address) = std::env::args().nth(1) else {
        error!("❌ Usage: height_monitor <desk address>");
        return Ok(());
    };

    let desk = DeskController::with_ble(DeskConfig::new(address)).await?;

    // The supervisor keeps reconnecting in the background, so a desk that is
    // out of range right now is picked up later
    if let Err(e) = desk.connect().await {
        error!("❌ First connection attempt failed: {}", e);
    }

    desk.subscribe(|frame: &[u8]| {
        if let Some(height) = ergodesk::protocol::decode_notification(frame) {
            println!("📏 {height:.1} cm");
        }
        Ok(())
    })
    .await;

    info!("🔍 Monitoring height, press Ctrl+C to stop");

    let mut status_interval = interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status_interval.tick() => {
                let snapshot = desk.snapshot();
                println!("\n📊 Status");
                println!("┌───────────────────────────────┐");
                println!("│ Link:     {:19} │", snapshot.link.to_string());
                println!(
                    "│ Height:   {:19} │",
                    snapshot
                        .height
                        .map_or_else(|| "unknown".to_string(), |h| format!("{:.1} cm", h.corrected))
                );
                println!(
                    "│ Position: {:19} │",
                    snapshot
                        .position
                        .map_or_else(|| "unknown".to_string(), |p| format!("{p}%"))
                );
                println!("│ Moving:   {:19} │", snapshot.motion.is_moving.to_string());
                println!("└───────────────────────────────┘");
            }
        }
    }

    info!("🛑 Stopping monitor...");
    desk.disconnect().await;
    Ok(())
}
