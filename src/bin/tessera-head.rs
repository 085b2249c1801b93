use anyhow::Error;

use tessera::head;
use tessera::node::{NodeRole, NodeState};
use tessera::Config;

fn main() -> Result<(), Error> {
    let config = Config::from_args(std::env::args().skip(1))?;
    std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| {
        format!("tessera={}", config.log_level)
    }));
    env_logger::init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let state = NodeState::new(NodeRole::Head, config)?;
        log::info!("starting head node {}", state.id);
        tokio::select! {
            result = head::run(state) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                Ok(())
            }
        }
    })
}
