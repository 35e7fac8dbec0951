//! Run command implementation

use crate::config::Config;
use crate::service::PriceRelay;
use clap::Args;

#[derive(Args, Debug)]
pub struct RunArgs {}

impl RunArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let mut relay = PriceRelay::new(config);
        relay.start().await?;

        tracing::info!("Relay running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;

        tracing::info!("Shutdown requested");
        relay.shutdown().await;
        Ok(())
    }
}
