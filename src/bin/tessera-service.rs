use anyhow::Error;

use tessera::node::{NodeRole, NodeState};
use tessera::{health, server, sn, Config};

fn main() -> Result<(), Error> {
    let config = Config::from_args(std::env::args().skip(1))?;
    std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!("tessera={}", config.log_level)
    }));
    env_logger::init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let state = NodeState::new(NodeRole::Service, config)?;
        log::info!("starting service node {}", state.id);

        tokio::spawn(health::run_health_task(state.clone()));

        let (_, task) = server::spawn(state.clone(), sn::router(), state.port())?;
        tokio::select! {
            result = task => result.map_err(Error::from),
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                Ok(())
            }
        }
    })
}
