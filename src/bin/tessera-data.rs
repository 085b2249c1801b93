use anyhow::Error;

use tessera::node::{NodeRole, NodeState};
use tessera::{dn, health, server, sync, Config};

fn main() -> Result<(), Error> {
    let config = Config::from_args(std::env::args().skip(1))?;
    std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!("tessera={}", config.log_level)
    }));
    env_logger::init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let state = NodeState::new(NodeRole::Data, config)?;
        log::info!("starting data node {}", state.id);

        tokio::spawn(health::run_health_task(state.clone()));
        tokio::spawn(sync::run_sync_task(state.clone()));

        let (_, task) = server::spawn(state.clone(), dn::router(), state.port())?;
        tokio::select! {
            result = task => result.map_err(Error::from),
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                Ok(())
            }
        }
    })
}
