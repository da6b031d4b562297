// deptnet operator binary
// Every reconciler operation as a subcommand; `restore` is what the host runs at boot.

mod cli;

use clap::{Parser, Subcommand};
use cli::commands;
use deptnet::config::ReconcilerConfig;
use deptnet::reconciler::Reconciler;
use deptnet::utils::constants::DEFAULT_CAPTURE_SECS;
use deptnet::utils::logger::Logger;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// deptnet - per-department bridge, DHCP and NAT reconciler
#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-department network reconciler for virtualization hosts")]
#[clap(propagate_version = true)]
struct DeptnetCli {
    #[clap(subcommand)]
    command: Commands,

    /// Tenant database (overrides DEPTNET_DB)
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    /// Enable JSON output format
    #[clap(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[clap(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a department without a network
    Add {
        tenant_id: String,

        /// Display name (defaults to the id)
        #[clap(long)]
        name: Option<String>,
    },

    /// Forget a department; its network must be destroyed first
    Remove { tenant_id: String },

    /// List departments and their networks
    List,

    /// Show the subnet the next configure would get
    NextSubnet,

    /// Create the bridge, dnsmasq and NAT rule for a department
    Configure {
        tenant_id: String,

        /// Explicit CIDR instead of the next free 10.10.X.0/24
        #[clap(long)]
        subnet: Option<String>,
    },

    /// Tear down a department's network
    Destroy { tenant_id: String },

    /// Tear down whatever is left, even when the record is inconsistent
    ForceDestroy { tenant_id: String },

    /// Re-create or repair every department network on record
    Restore,

    /// Restart the DHCP daemon of a department
    RestartDhcp { tenant_id: String },

    /// Change DNS, NTP or MTU handed out to a department
    Settings {
        tenant_id: String,

        /// Comma separated IPv4 DNS servers
        #[clap(long)]
        dns: Option<String>,

        /// Comma separated IPv4 NTP servers
        #[clap(long)]
        ntp: Option<String>,

        #[clap(long, conflicts_with = "default_mtu")]
        mtu: Option<u32>,

        /// Go back to the default MTU
        #[clap(long)]
        default_mtu: bool,
    },

    /// Inspect bridge, daemon, kernel, NAT and TAP state
    Diagnose { tenant_id: String },

    /// Watch DHCP traffic on a department bridge
    Capture {
        tenant_id: String,

        /// Duration in seconds (5-120)
        #[clap(long, short, default_value_t = DEFAULT_CAPTURE_SECS)]
        seconds: u64,
    },
}

/// RUST_LOG wins; otherwise deptnet=info, or deptnet=debug with --verbose.
/// DEPTNET_LOG_FILE sends logs to a file instead of stderr.
fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default = if verbose { "deptnet=debug" } else { "deptnet=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match std::env::var("DEPTNET_LOG_FILE") {
        Ok(path) if !path.is_empty() => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("failed to open log file {}: {}", path, e))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = DeptnetCli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        Logger::error(&e.to_string());
        std::process::exit(2);
    }

    if let Err(e) = run(cli).await {
        Logger::error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(cli: DeptnetCli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ReconcilerConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let json = cli.json;

    let reconciler = Reconciler::open(config).await?;
    let r = &reconciler;

    match cli.command {
        Commands::Add { tenant_id, name } => commands::handle_add(r, &tenant_id, name, json).await,
        Commands::Remove { tenant_id } => commands::handle_remove(r, &tenant_id, json).await,
        Commands::List => commands::handle_list(r, json).await,
        Commands::NextSubnet => commands::handle_next_subnet(r, json).await,
        Commands::Configure { tenant_id, subnet } => {
            commands::handle_configure(r, &tenant_id, subnet, json).await
        }
        Commands::Destroy { tenant_id } => {
            commands::handle_destroy(r, &tenant_id, false, json).await
        }
        Commands::ForceDestroy { tenant_id } => {
            commands::handle_destroy(r, &tenant_id, true, json).await
        }
        Commands::Restore => commands::handle_restore(r, json).await,
        Commands::RestartDhcp { tenant_id } => {
            commands::handle_restart_dhcp(r, &tenant_id, json).await
        }
        Commands::Settings {
            tenant_id,
            dns,
            ntp,
            mtu,
            default_mtu,
        } => commands::handle_settings(r, &tenant_id, dns, ntp, mtu, default_mtu, json).await,
        Commands::Diagnose { tenant_id } => commands::handle_diagnose(r, &tenant_id, json).await,
        Commands::Capture { tenant_id, seconds } => {
            commands::handle_capture(r, &tenant_id, seconds, json).await
        }
    }
}
