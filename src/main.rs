#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use svc_stack::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.interfaces.is_empty() {
        log::warn!(
            "No interfaces are bound, no packet port is running, it's just a program without any functionality :-)"
        );

        return Ok(());
    }

    svc_stack::startup(config).await
}
