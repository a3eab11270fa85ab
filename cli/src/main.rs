//! The main entrypoint for cpe-upgrade, which calls into the library.

use anyhow::Result;

async fn run() -> Result<()> {
    cpe_upgrade_utils::initialize_tracing();
    tracing::trace!("starting");
    cpe_upgrade_lib::cli::run_from_iter(std::env::args_os()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
