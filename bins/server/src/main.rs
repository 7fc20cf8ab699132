mod config;
mod error;

use std::fs::OpenOptions;
use std::sync::Mutex;

use clap::Parser;
use config::{Cli, Commands, ServeArgs};
use error::ServerError;

mod cmd;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => match init_tracing(&args) {
            Ok(()) => cmd::serve::run(args).await,
            Err(e) => Err(e),
        },
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(args: &ServeArgs) -> Result<(), ServerError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    match args.log_path() {
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| ServerError::LogFile { path, source })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
    }
    Ok(())
}
