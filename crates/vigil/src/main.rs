use clap::Parser;

use vigil::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(cli.execute().await);
}
