//! Junction relay server binary.
//!
//! Holds the authoritative junction graph and relays document changes and
//! cursor positions between connected clients.

use clap::Parser;
use junction_collab::server::{ServerConfig, SyncServer};
use log::info;

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "junction-server")]
#[command(about = "Relay server for the shared junction graph")]
struct Args {
    /// Address to listen on
    #[arg(short, long, value_name = "ADDR", default_value = "127.0.0.1:4545")]
    bind: String,

    /// Outbound frames buffered per session before frames are dropped
    #[arg(long, value_name = "FRAMES", default_value_t = 256)]
    session_buffer: usize,

    /// Seconds between keep-alive pings
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    heartbeat: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            session_buffer: self.session_buffer,
            heartbeat_interval_secs: self.heartbeat,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("Starting junction-server");

    let server = SyncServer::new(args.server_config());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.hub().stats().await;
            info!(
                "Shutting down after {} connections, {} deltas applied, {} frames rejected",
                stats.total_connections, stats.deltas_applied, stats.rejected_messages
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["junction-server"]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "127.0.0.1:4545");
        assert_eq!(config.session_buffer, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(!args.verbose);
    }

    #[test]
    fn test_custom_args() {
        let args = Args::parse_from([
            "junction-server",
            "--bind",
            "0.0.0.0:9000",
            "--session-buffer",
            "8",
            "--heartbeat",
            "5",
            "-v",
        ]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.session_buffer, 8);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert!(args.verbose);
    }
}
