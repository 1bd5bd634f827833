//! scriptportd - Serve step-bounded script evaluation on a loopback port
//!
//! Runs the server loop under the supervisor until SIGINT or SIGTERM.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;
use scriptport::interpreter::{HostBindings, Registry};
use scriptport::runtime::{DEFAULT_COMPUTE_BUDGET, DEFAULT_SERIALIZE_BUDGET, Limits};
use scriptport::service::{
    DEFAULT_IDLE_INTERVAL_MS, DEFAULT_MAX_REQUEST_BYTES, Server, ServerConfig, Supervisor,
};

#[derive(Parser)]
#[command(name = "scriptportd")]
#[command(about = "Loopback script evaluation service with step budgets", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = scriptport::DEFAULT_PORT)]
    port: u16,

    /// Steps available to each request's code
    #[arg(long, default_value_t = DEFAULT_COMPUTE_BUDGET)]
    compute_budget: u64,

    /// Steps available to render each result
    #[arg(long, default_value_t = DEFAULT_SERIALIZE_BUDGET)]
    serialize_budget: u64,

    /// Nesting depth beyond which results render as "<too deep>"
    #[arg(long)]
    depth_cap: Option<usize>,

    /// Pause between server cycles in milliseconds
    #[arg(long, default_value_t = DEFAULT_IDLE_INTERVAL_MS)]
    idle_interval_ms: u64,

    /// Maximum bytes read for one request
    #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    max_request_bytes: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut limits = Limits::default()
            .with_compute_budget(self.compute_budget)
            .with_serialize_budget(self.serialize_budget);
        if let Some(depth_cap) = self.depth_cap {
            limits = limits.with_depth_cap(depth_cap);
        }
        ServerConfig {
            host: self.host,
            port: self.port,
            limits,
            idle_interval_ms: self.idle_interval_ms,
            max_request_bytes: self.max_request_bytes,
        }
    }
}

/// Namespace exposed to scripts as `host`.
struct DaemonBindings;

impl HostBindings for DaemonBindings {
    fn install(&self, registry: &mut Registry<'_>) {
        registry.value("host.name", "scriptportd");
        registry.value("host.version", scriptport::VERSION);
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.server_config();
    let idle = config.idle_interval();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .with_context(|| format!("failed to register handler for signal {signal}"))?;
    }

    let server = Server::bind(config)
        .context("failed to start server")?
        .with_bindings(DaemonBindings);

    let mut supervisor = Supervisor::new(server, idle);
    supervisor.run(&shutdown);
    Ok(())
}
