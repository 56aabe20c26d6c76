use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use vuload_cli::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(args) => cli::run(args).await,
        Commands::Validate { config } => cli::validate(&config),
    };

    std::process::exit(code);
}

/// Initialize logging; `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
