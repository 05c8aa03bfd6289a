use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use leasekeeper::{
    DhcpConfig, DhcpController, DhcpServer, DhcpState, LeaseSweeper, MacAddress, Result,
    StaticReservation,
};

#[derive(Parser)]
#[command(name = "leasekeeper")]
#[command(author, version, about = "DHCP server for a home network gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcp.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 (the default)
    Run,
    /// Print the effective configuration
    ShowConfig,
    /// Validate the configuration file and exit
    CheckConfig,
    /// Pin an address to a MAC
    AddReservation {
        mac: MacAddress,
        ip: Ipv4Addr,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Drop the reservation for a MAC
    RemoveReservation { mac: MacAddress },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = DhcpConfig::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::CheckConfig => {
            println!(
                "{} is valid: {} - {} ({} addresses, {} reservations)",
                cli.config.display(),
                config.range_start,
                config.range_end,
                config.range_size(),
                config.static_reservations.len()
            );
            Ok(())
        }
        Commands::AddReservation {
            mac,
            ip,
            hostname,
            description,
        } => {
            let controller = DhcpController::new(DhcpState::shared(config), Some(cli.config));
            let reservation = StaticReservation {
                mac_address: mac,
                ip_address: ip,
                hostname,
                description,
            };

            if controller.add_static_reservation(reservation).await? {
                println!("Reserved {} for {}.", ip, mac);
            } else {
                println!("{} is outside the range or reserved for another client.", ip);
            }
            Ok(())
        }
        Commands::RemoveReservation { mac } => {
            let controller = DhcpController::new(DhcpState::shared(config), Some(cli.config));

            if controller.remove_static_reservation(&mac).await? {
                println!("Removed reservation for {}.", mac);
            } else {
                println!("No reservation for {}.", mac);
            }
            Ok(())
        }
    }
}

async fn run(config: DhcpConfig) -> Result<()> {
    let sweep_interval = Duration::from_secs(u64::from(config.sweep_interval_seconds));
    let state = DhcpState::shared(config);

    let server = Arc::new(DhcpServer::new(Arc::clone(&state)).await?);
    let sweeper = LeaseSweeper::new(state, sweep_interval).spawn(server.shutdown_signal());

    let mut runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    let joined = tokio::select! {
        joined = &mut runner => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            server.shutdown();
            runner.await
        }
    };

    server.shutdown();
    if let Err(error) = sweeper.await {
        error!("Lease sweeper task failed: {}", error);
    }

    server_outcome(joined)
}

/// A server task that panicked or was cancelled fails the process.
fn server_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(error) => {
            error!("Server task failed: {}", error);
            Err(std::io::Error::from(error).into())
        }
    }
}
