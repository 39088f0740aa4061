use chat_relay::config::{Args, RelayConfig};
use chat_relay::relay_state::RelayState;
use chat_relay::server;
use clap::Parser;

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let relay_config = RelayConfig::try_from(Args::parse())?;
    server::init_logging(relay_config.log_level);

    let relay_state = RelayState::new(relay_config.clone())?;
    actix_web::rt::System::new().block_on(server::startup(relay_config, relay_state))?;
    Ok(())
}
