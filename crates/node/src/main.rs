//! The binary for running the oracle node

use orakl_node::cli::Cli;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    let _guards = match orakl_tracing::init_logging() {
        Ok(guards) => guards,
        Err(error) => {
            eprintln!("failed to initialize logging: {error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = Cli::run().await {
        tracing::error!(%error, "node exited");
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}
