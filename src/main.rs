#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trellis_proxy::server;

#[derive(Parser)]
#[command(
    name = "trellis-proxy",
    about = "Content-aware HTTP reverse proxy and load balancer"
)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("TLS provider installed once");

    let worker_threads = server::runtime::worker_threads();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
    }))
}
