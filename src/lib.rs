pub mod config;
pub mod ctrl;
pub mod observer;
pub mod server;
pub mod statistics;

use self::{config::Config, observer::Observer, statistics::Statistics};

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use codec::ctrl::capability;
use service::{Stack, StackOptions};

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds since daemon start; the time base for every stack timer.
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// In order to let integration tests use the crate and start the daemon
/// directly, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();

    let (upcall_tx, upcall_rx) = tokio::sync::mpsc::unbounded_channel();

    let stack = Stack::new(StackOptions {
        config: config.stack.clone(),
        local_addr: config.local_addr(),
        capabilities: if config.ctrl.transit {
            capability::TRANSIT
        } else {
            0
        },
        handler: Observer::new(upcall_tx),
    });

    server::start(&config, &stack, &statistics).await?;
    ctrl::start(config.clone(), stack.clone(), upcall_rx).await?;

    // Everything runs on background tasks; keep the daemon alive.
    std::future::pending::<()>().await;
    Ok(())
}
