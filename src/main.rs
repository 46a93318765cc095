use clap::Parser;
use cheri_provenance::cli::Cli;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    Cli::parse().run()
}
