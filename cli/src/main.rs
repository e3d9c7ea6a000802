//! Entry-point for the `dagrun` binary.

use clap::Parser;
use dagrun_cli::Cli;
use dagrun_cli::run_main;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run_main(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("dagrun: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
