use jaeger_nginx_proxy_operator::{config::Settings, controllers};
use log::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings = Settings::from_env()?;

    info!("starting jaeger nginx proxy operator");

    controllers::run(settings).await?;

    Ok(())
}
