use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "envctl", version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision one environment, install a package and check it
    Run(commands::run::RunArgs),
    /// Run the same package against several targets, one thread per target
    Matrix(commands::matrix::MatrixArgs),
    /// Worker configuration utilities
    Config {
        #[command(subcommand)]
        cmd: commands::config::ConfigCommand,
    },
    /// Print version and exit
    Version,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.cmd {
        Commands::Run(args) => commands::run::run(args, cli.verbose),
        Commands::Matrix(args) => commands::matrix::run(args, cli.verbose),
        Commands::Config { cmd } => commands::config::handle(cmd),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
