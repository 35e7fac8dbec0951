use clap::Parser;
use price_relay::cli::{Cli, Commands};
use price_relay::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config from {}: {}", cli.config, e);
        eprintln!("Using default configuration");
        toml::from_str(include_str!("../config.toml.example")).expect("Invalid default config")
    });

    // Initialize telemetry
    let _guard = price_relay::telemetry::init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Run(args) => {
            tracing::info!("Starting price relay");
            args.execute(&config).await?;
        }
        Commands::Status => {
            println!("price-relay status");
            println!("  Status: Not running");
            println!("  Subscribe at: ws://{}/ws/prices", config.broadcast.bind_addr);
        }
        Commands::Config => {
            println!("Current configuration:");
            println!("  Primary feed:   {}", config.feed.primary_url);
            println!("  Secondary feed: {}", config.feed.secondary_url);
            println!("  Symbols:        {}", config.feed.symbols.join(", "));
            println!("  Cache TTL:      {}s", config.cache.ttl_secs);
            println!(
                "  Failover:       silence {}s, backoff {}..{}ms",
                config.aggregator.silence_window_secs,
                config.aggregator.backoff_base_ms,
                config.aggregator.backoff_cap_ms
            );
            println!(
                "  Broadcast:      {} every {}ms",
                config.broadcast.bind_addr, config.broadcast.tick_interval_ms
            );
        }
    }

    Ok(())
}
