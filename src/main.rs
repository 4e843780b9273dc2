// # CyberCache Server
//
// Main entry point for the cache server: initializes logging, loads the
// configuration, registers the main thread, starts the store services,
// and runs the listener loop.

use clap::Parser;
use cybercache::concurrent::registry;
use cybercache::config::{self, ServerConfig};
use cybercache::memory::{Memory, MemoryInterface};
use cybercache::server::CacheServer;
use cybercache::{Result, VERSION};
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cybercached", version = VERSION, about = "CyberCache cluster server")]
struct Args {
    /// Path to the configuration file
    config: Option<String>,

    /// Override the listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the listener address
    #[arg(short, long)]
    address: Option<String>,
}

/// Host hooks for memory-pressure eviction: a domain that blows through
/// its quota asks the stores to shed expired records before the
/// allocation is allowed to fail.
struct EvictionHost {
    server: parking_lot::RwLock<Option<Arc<CacheServer>>>,
}

impl MemoryInterface for EvictionHost {
    fn begin_memory_deallocation(&self, size: u64) -> bool {
        let guard = self.server.read();
        match guard.as_ref() {
            Some(server) => {
                info!("memory pressure: need {size} bytes, running eviction");
                let pages = server.pages.clean(cybercache::protocol::CleanMode::Old, &[]);
                let sessions = server.sessions.gc(0);
                pages > 0 || sessions > 0
            }
            None => false,
        }
    }

    fn end_memory_deallocation(&self) {}
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    if let Err(e) = run() {
        error!("server failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let _main_thread = registry::register_thread(registry::TI_MAIN);

    info!("CyberCache server {VERSION} starting");

    let mut server_config = ServerConfig::default();
    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path).map_err(|e| {
            cybercache::CacheError::Configuration(format!("cannot read '{path}': {e}"))
        })?;
        let applied = server_config.apply_config_text(&text)?;
        info!("applied {applied} options from '{path}'");
    }
    if let Some(port) = args.port {
        server_config.port = port;
    }
    if let Some(address) = args.address {
        server_config.listen_address = address;
    }

    let bind_address = format!("{}:{}", server_config.listen_address, server_config.port);
    let shared = config::shared(server_config);
    let server = Arc::new(CacheServer::new(shared)?);

    // install the eviction hooks now that the stores exist
    let host: &'static EvictionHost = Box::leak(Box::new(EvictionHost {
        server: parking_lot::RwLock::new(Some(Arc::clone(&server))),
    }));
    Memory::configure(host);

    let listener = TcpListener::bind(&bind_address)
        .map_err(|e| cybercache::CacheError::Server(format!("cannot bind '{bind_address}': {e}")))?;
    let _maintenance = server.start_maintenance()?;
    info!("ready to accept connections on {bind_address}");

    let result = server.run(listener);
    host.server.write().take();
    info!("shutdown complete");
    result
}
