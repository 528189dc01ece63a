//! CIFS file server front end

use clap::Parser;
use rust_fileserver::auth::UserCredential;
use rust_fileserver::server::{FileServer, ServerConfig};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "file-server")]
#[command(about = "Rust file server (SMB2 session negotiation)", long_about = None)]
struct Args {
    /// Server name
    #[arg(short = 'n', long, default_value = "RUST-FILESERVER")]
    server_name: String,

    /// Workgroup/domain name
    #[arg(short = 'w', long, default_value = "WORKGROUP")]
    workgroup: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value = "445")]
    port: u16,

    /// Bind address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind: String,

    /// Map anonymous and unknown users to guest
    #[arg(long, default_value = "false")]
    allow_guest: bool,

    /// Require signing
    #[arg(long, default_value = "false")]
    require_signing: bool,

    /// Maximum connections
    #[arg(long, default_value = "100")]
    max_connections: usize,

    /// User accounts (can be specified multiple times)
    /// Format: name:password
    #[arg(short = 'u', long = "user", value_parser = parse_user)]
    users: Vec<UserCredential>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn parse_user(s: &str) -> Result<UserCredential, String> {
    match s.split_once(':') {
        Some((name, password)) if !name.is_empty() => Ok(UserCredential::new(name, password)),
        _ => Err("User format: name:password".to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("Starting file server");
    tracing::info!("{} user account(s) configured", args.users.len());
    if args.users.is_empty() && !args.allow_guest {
        tracing::warn!("No users and guest access disabled, every logon will fail");
    }

    let config = ServerConfig {
        server_name: args.server_name,
        workgroup: args.workgroup,
        allow_guest: args.allow_guest,
        require_signing: args.require_signing,
        max_connections: args.max_connections,
        users: args.users,
    };
    let server = FileServer::new(config)?;

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    // Handle shutdown signal
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping server...");
        std::process::exit(0);
    });

    server.run(addr).await?;

    Ok(())
}
