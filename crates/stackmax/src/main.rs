//! stackmax - static worst-case stack depth analysis for embedded ELF
//! binaries.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stackmax::pipeline::{self, EXIT_ANALYSIS};
use stackmax::report;
use stackmax::terminal::Spinner;

#[derive(Parser)]
#[command(name = "stackmax")]
#[command(about = "Static worst-case stack usage analysis of embedded executables")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress warnings (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    silent: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze an ARM Cortex-M0 (Thumbv6-m) ELF executable
    #[command(name = "elf_arm_thumbv6m_cortex_m0")]
    ElfArmThumbv6mCortexM0 {
        #[command(subcommand)]
        command: ArchCommands,
    },
    /// Print the tool version
    Version,
}

#[derive(Subcommand)]
enum ArchCommands {
    /// Print worst-case stack depth per entrypoint and the global maximum
    Summary {
        /// Input ELF file
        #[arg(value_name = "ELF")]
        binary: PathBuf,

        /// Analyzer config (JSON)
        #[arg(value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Also print the witness call chain per entrypoint
        #[arg(long)]
        call_chains: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.silent {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            0
        }
        Commands::ElfArmThumbv6mCortexM0 { command } => match command {
            ArchCommands::Summary {
                binary,
                config,
                call_chains,
            } => run_summary(&binary, config.as_deref(), call_chains),
        },
    };

    std::process::exit(code);
}

fn run_summary(
    binary: &std::path::Path,
    config: Option<&std::path::Path>,
    call_chains: bool,
) -> i32 {
    let spinner = Spinner::new("Analyzing...");
    let analysis = pipeline::analyze(binary, config);
    spinner.finish_and_clear();

    match analysis {
        Ok(analysis) => {
            report::print_summary(&analysis, call_chains);
            if analysis.has_failures() {
                EXIT_ANALYSIS
            } else {
                0
            }
        }
        Err(error) => {
            eprintln!("{} {error}", console::style("error:").red().bold());
            error.exit_code()
        }
    }
}
