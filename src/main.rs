//! kgflow CLI entry point.

use clap::Parser;

use kgflow::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;

    if let Err(err) = kgflow::cli::run(cli).await {
        kgflow::cli::handle_error(&err, json_mode);
    }
}
