use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil::{config, engine::Engine};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    vigil::init();

    config::ensure_dirs()?;
    let app_config = config::load_config("config.yml")?;

    let mut engine = Engine::new(app_config)?;
    engine.start()?;

    let (interrupt_tx, interrupt_rx) = crossbeam::channel::bounded(1);
    let shutdown = engine.shutdown_handle();
    ctrlc::set_handler(move || {
        shutdown.request();
        let _ = interrupt_tx.try_send(());
    })?;

    info!("running, press ctrl-c to stop");
    let _ = interrupt_rx.recv();
    engine.stop();
    Ok(())
}
