//! KMS activation protocol server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with a random HWID and synthesized EPIDs (development)
//! kms-server --bind 0.0.0.0:1688
//!
//! # Listen on more than one address (IPv4 and IPv6, or several interfaces)
//! kms-server --bind 0.0.0.0:1688,[::]:1688
//!
//! # Pin the reported hardware ID and EPID (matching a specific emulator profile)
//! kms-server --bind 0.0.0.0:1688 --hwid 5de6b2787969cbbc --epid 03612-00206-172-157248-03-1033-17763.0000-0622016
//! ```

use clap::Parser;
use kms_core::ServerIdentity;
use kms_server::{Server, ServerConfig, ServerRuntimeConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// KMS volume-license activation protocol server
#[derive(Parser, Debug)]
#[command(name = "kms-server")]
#[command(about = "KMS activation protocol emulator")]
#[command(version)]
struct Args {
    /// Address(es) to bind to. Repeat the flag or separate with commas to
    /// listen on more than one (address, port) pair, e.g. to serve both
    /// IPv4 and IPv6.
    #[arg(short, long, value_delimiter = ',', default_value = "0.0.0.0:1688")]
    bind: Vec<String>,

    /// 8-byte hardware ID reported in V6 responses, as 16 hex digits.
    /// Falls back to a random HWID if omitted or unparsable.
    #[arg(long)]
    hwid: Option<String>,

    /// EPID string to report verbatim instead of synthesizing one per
    /// `applicationId`.
    #[arg(long)]
    epid: Option<String>,

    /// Current activated-client count to report (before clamping).
    #[arg(long)]
    current_client_count: Option<u32>,

    /// Ceiling for `currentClientCount` and `requiredClientCount`.
    #[arg(long)]
    max_clients: Option<u32>,

    /// Minutes until a client should retry activation.
    #[arg(long)]
    vl_activation_interval: Option<u32>,

    /// Minutes until a client should renew its activation.
    #[arg(long)]
    vl_renewal_interval: Option<u32>,

    /// Maximum concurrent connections.
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("KMS server starting");
    tracing::info!("Binding to {}", args.bind.join(", "));

    let mut rng_seed = [0u8; 8];
    getrandom::fill(&mut rng_seed)?;
    let fallback_hwid = rng_seed;
    let hwid = ServerIdentity::with_hwid_hex_or(args.hwid.as_deref(), fallback_hwid);

    let mut identity = ServerIdentity::new(hwid);
    identity.epid_override = args.epid;
    if let Some(count) = args.current_client_count {
        identity.current_client_count = count;
    }
    if let Some(max) = args.max_clients {
        identity.max_clients = max;
    }
    if let Some(interval) = args.vl_activation_interval {
        identity.vl_activation_interval = interval;
    }
    if let Some(interval) = args.vl_renewal_interval {
        identity.vl_renewal_interval = interval;
    }

    let config = ServerRuntimeConfig {
        bind_addresses: args.bind,
        identity,
        driver: ServerConfig { max_connections: args.max_connections, ..Default::default() },
    };

    let server = Server::bind(config).await?;

    for addr in server.local_addrs()? {
        tracing::info!("Server listening on {}", addr);
    }

    server.run().await?;

    Ok(())
}
