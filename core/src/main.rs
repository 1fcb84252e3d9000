use clap::Parser;
use std::sync::Arc;
use stompbox::{BrokerConfig, BrokerServer, ErrorPolicy, Result};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stompbox")]
#[command(about = "A STOMP 1.2 message broker written in Rust")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value = "61613")]
    port: u16,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Read the configuration from STOMPBOX_* environment variables instead
    /// of the flags below
    #[arg(long)]
    from_env: bool,

    #[arg(long, default_value = "1000")]
    max_connections: usize,

    /// Largest accepted frame in bytes
    #[arg(long, default_value = "1048576")]
    max_frame_size: usize,

    #[arg(long, default_value = "256")]
    outgoing_queue_size: usize,

    /// Deliveries buffered per session before messages are dropped
    #[arg(long, default_value = "1024")]
    inbox_size: usize,

    /// Broadcast destination to register at startup (repeatable)
    #[arg(short, long = "destination", default_value = "/topic/all")]
    destinations: Vec<String>,

    /// Create a broadcast destination on first SUBSCRIBE or SEND
    #[arg(long)]
    auto_create: bool,

    #[arg(long, value_enum, default_value = "terminal")]
    error_policy: ErrorPolicy,

    /// Log a metrics report every N seconds
    #[arg(long)]
    stats_interval: Option<u64>,
}

impl Args {
    fn into_config(self) -> BrokerConfig {
        BrokerConfig {
            host: self.host,
            port: self.port,
            max_connections: self.max_connections,
            max_frame_size: self.max_frame_size,
            outgoing_queue_size: self.outgoing_queue_size,
            inbox_size: self.inbox_size,
            destinations: self.destinations,
            auto_create_destinations: self.auto_create,
            error_policy: self.error_policy,
            stats_interval_secs: self.stats_interval,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = parse_log_level(&args.log_level);
    tracing_subscriber::fmt()
        .with_max_level(level.unwrap_or(tracing::Level::INFO))
        .init();
    if level.is_none() {
        warn!("Invalid log level '{}', defaulting to 'info'", args.log_level);
    }

    let config = if args.from_env {
        BrokerConfig::from_env()?
    } else {
        args.into_config()
    };

    info!("Starting Stompbox broker on {}", config.listen_addr());
    info!("Destinations: {}", config.destinations.join(", "));
    info!("Auto-create destinations: {}", config.auto_create_destinations);
    info!("Error policy: {:?}", config.error_policy);
    info!(
        "Limits: connections={}, frame={}B, outgoing queue={}, inbox={}",
        config.max_connections, config.max_frame_size, config.outgoing_queue_size, config.inbox_size
    );

    let server = Arc::new(BrokerServer::new(config)?);

    // Spawn the server task
    let server_task = Arc::clone(&server);
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server_task.run().await {
            error!("Server error: {}", e);
        }
    });

    // Set up signal handlers
    let interrupted = tokio::select! {
        _ = signal::ctrl_c() => true,
        _ = &mut server_handle => false,
    };

    if interrupted {
        info!("Received Ctrl+C, shutting down gracefully...");
        server.shutdown();
        if let Err(e) = server_handle.await {
            error!("Server task failed: {}", e);
        }
    } else {
        info!("Server task completed");
    }

    server.metrics().report();
    info!("Stompbox shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> Option<tracing::Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG"), Some(tracing::Level::DEBUG));
        assert_eq!(parse_log_level("warn"), Some(tracing::Level::WARN));
        assert_eq!(parse_log_level("loud"), None);
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "stompbox",
            "--port",
            "7000",
            "-d",
            "/topic/a",
            "-d",
            "/topic/b",
            "--error-policy",
            "lenient",
        ]);
        let config = args.into_config();
        assert_eq!(config.port, 7000);
        assert_eq!(config.destinations, ["/topic/a", "/topic/b"]);
        assert_eq!(config.error_policy, ErrorPolicy::Lenient);
    }
}
