use clap::Parser;
use pdc_cli::{run, Cli};

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("pdc: {}", e);
        std::process::exit(1);
    }
}
