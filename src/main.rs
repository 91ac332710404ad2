use clap::Parser;

use cips::config::Args;
use cips::server;

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = server::run(args).await {
        log::error!(target: "cips::server", "fatal: {e}");
        std::process::exit(1);
    }
}
