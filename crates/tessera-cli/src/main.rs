//! tessera CLI - drive the reactive scheduler from the command line.

mod graph;
mod notebook;
mod output;
mod replay;
mod run;
mod runner;

use clap::{Parser, Subcommand, ValueEnum};
use tessera_core::RunMode;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Reactive notebook scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every cell of a notebook and run it with a dry-run runner
    Run {
        /// Path to the notebook (.rs file, cells separated by `// %%`)
        notebook: String,

        /// Run only this cell (by position, starting at 1) and what it needs
        #[arg(long)]
        cell: Option<usize>,

        /// How changes propagate
        #[arg(long, value_enum, default_value_t = Mode::Autorun)]
        mode: Mode,

        /// Make the runner fail for this cell (repeatable)
        #[arg(long)]
        fail: Vec<usize>,

        /// Print every state change as it happens
        #[arg(long)]
        trace: bool,

        /// Print the run reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the dependency graph of a notebook as JSON
    Graph {
        /// Path to the notebook (.rs file)
        notebook: String,
    },

    /// Replay a JSON session script of edits, deletes and runs
    Replay {
        /// Path to the script
        script: String,

        /// Print the step results as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Autorun,
    Lazy,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Autorun => RunMode::Autorun,
            Mode::Lazy => RunMode::Lazy,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            notebook,
            cell,
            mode,
            fail,
            trace,
            json,
        } => {
            let options = run::RunOptions {
                cell,
                mode: mode.into(),
                fail,
                trace,
                json,
            };
            run::execute(&notebook, options).await?;
        }

        Commands::Graph { notebook } => graph::execute(&notebook)?,

        Commands::Replay { script, json } => replay::execute(&script, json)?,
    }

    Ok(())
}
