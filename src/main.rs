//! # ralc
//!
//! Command line driver for the relational algebra compiler.
//!
//! ## Usage
//!
//! ```bash
//! # Generate code for a program
//! ralc compile program.json --output query.cpp
//!
//! # Show the program graph after dead-code elimination and chaining
//! ralc analyze program.json
//!
//! # Show the physical plan chosen for every statement
//! ralc explain program.json --join shuffle-hash
//! ```
//!
//! Program files are JSON, or TOML when the extension is `.toml`, holding
//! an optional `catalog` of relation schemes and the `program` items.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use ralc::config::LoggingConfig;
use ralc::{Compiler, Config, JoinAlgorithm, ProgramFile};

#[derive(Parser)]
#[command(name = "ralc")]
#[command(about = "Relational algebra compiler", long_about = None)]
struct Cli {
    /// Configuration file, in place of ralc.toml and ralc.local.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program to runtime source
    Compile {
        program: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum)]
        join: Option<JoinArg>,

        /// Disable common subexpression elimination
        #[arg(long)]
        no_cse: bool,
    },
    /// Print the program graph and liveness after the analysis passes
    Analyze { program: PathBuf },
    /// Print the optimized physical plan of every statement
    Explain {
        program: PathBuf,

        #[arg(short, long, value_enum)]
        join: Option<JoinArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum JoinArg {
    Hash,
    SymmetricHash,
    ShuffleHash,
}

impl From<JoinArg> for JoinAlgorithm {
    fn from(arg: JoinArg) -> Self {
        match arg {
            JoinArg::Hash => JoinAlgorithm::Hash,
            JoinArg::SymmetricHash => JoinAlgorithm::SymmetricHash,
            JoinArg::ShuffleHash => JoinAlgorithm::ShuffleHash,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(&path.to_string_lossy())
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Compile {
            program,
            output,
            join,
            no_cse,
        } => {
            if let Some(join) = join {
                config.optimizer.join_algorithm = join.into();
            }
            if no_cse {
                config.codegen.common_subexpression_elimination = false;
            }
            let file = read_program(&program)?;
            let catalog = file.catalog.clone();
            let compiled = Compiler::new(&config)
                .with_catalog(&catalog)
                .compile_program(&file.program)
                .with_context(|| format!("failed to compile {}", program.display()))?;
            let source = compiled.bundle.render()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, source)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(output = %path.display(), "code written");
                }
                None => print!("{source}"),
            }
        }
        Commands::Analyze { program } => {
            let file = read_program(&program)?;
            let cfg = Compiler::new(&config).analyse(&file.program)?;
            let liveness = cfg.compute_liveness();
            for node in cfg.nodes() {
                let successors: Vec<String> =
                    cfg.successors(node.id).iter().map(ToString::to_string).collect();
                let live: Vec<&str> = liveness.live_out(node.id).iter().map(String::as_str).collect();
                println!(
                    "[{}] {} = {}",
                    node.id,
                    node.def_var.as_deref().unwrap_or("_"),
                    node.plan
                );
                println!("    -> [{}]  live out: {{{}}}", successors.join(", "), live.join(", "));
            }
        }
        Commands::Explain { program, join } => {
            if let Some(join) = join {
                config.optimizer.join_algorithm = join.into();
            }
            let file = read_program(&program)?;
            let catalog = file.catalog.clone();
            let compiled = Compiler::new(&config)
                .with_catalog(&catalog)
                .compile_program(&file.program)
                .with_context(|| format!("failed to compile {}", program.display()))?;
            for (id, plan) in &compiled.plans {
                println!("[{id}]");
                println!("{}", plan.pretty_print());
            }
        }
    }

    Ok(())
}

fn read_program(path: &Path) -> Result<ProgramFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&text).with_context(|| format!("invalid program in {}", path.display()))?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("invalid program in {}", path.display()))?
    };
    Ok(file)
}

/// Install a stderr subscriber; `RUST_LOG` overrides the configured level
fn init_tracing(logging: &LoggingConfig) {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone());
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_writer(std::io::stderr)
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if logging.format == "json" {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
