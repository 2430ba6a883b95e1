use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{info, warn};

use tga_core::{bridge::ControlBridge, config::Config};
use tga_telegram::TelegramSessionFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tga_core::logging::init("tga").context("initializing logging")?;

    let cfg = Config::load().context("loading configuration")?;
    let factory = Arc::new(TelegramSessionFactory::from_config(&cfg));
    let bridge = ControlBridge::new(&cfg, factory, Handle::current());

    for invite in &cfg.listen_groups {
        match bridge.observe(invite).await {
            Ok(out) => info!(
                group = %out.group.id,
                title = %out.group.title,
                newly_added = out.newly_added,
                "observing group"
            ),
            Err(e) => warn!(%invite, "could not observe group: {e}"),
        }
    }

    let mut report = tokio::time::interval(cfg.history_report_interval);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("ctrl-c handler failed: {e}");
                }
                break;
            }
            _ = report.tick() => {
                let registry = bridge.registry();
                for (group, invite) in registry.active_groups() {
                    info!(
                        %group,
                        %invite,
                        messages = registry.history(group).len(),
                        "history"
                    );
                }
                info!(status = ?bridge.daemon_status(), "listener daemon");
            }
        }
    }

    let dropped = bridge.shutdown().await;
    info!(dropped, "shut down");
    Ok(())
}
