//! # answerkit
//!
//! Hybrid FAQ/RAG question answering for a curated knowledge base.
//!
//! ## Usage
//!
//! ```bash
//! # Index documents and draft a FAQ
//! answerkit ingest ./docs --generate-faq
//!
//! # Ask a one-shot question
//! answerkit ask "What are your opening hours?"
//!
//! # Run the HTTP server
//! answerkit serve
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use answerkit_engine::config::EngineConfig;

mod commands;
mod context;
mod exit_codes;
mod http;

/// Initialize logger based on verbose flag
fn init_logger(verbose: bool) {
    let mut log_builder = env_logger::Builder::from_default_env();
    if verbose {
        log_builder.filter_level(log::LevelFilter::Debug);
    } else {
        log_builder.filter_level(log::LevelFilter::Info);
    }
    log_builder.init();
}

/// Main CLI structure
#[derive(Parser)]
#[command(name = "answerkit")]
#[command(about = "Hybrid FAQ/RAG question answering", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a JSON config file. Defaults apply when absent.
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Answer a single question and exit
    Ask {
        /// The question to answer
        #[arg(value_name = "QUERY")]
        query: String,
        /// Output the full response envelope as JSON
        #[arg(long)]
        json: bool,
    },
    /// Chunk and index documents from a directory
    Ingest {
        /// Directory of .txt/.md documents
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Also distill a draft FAQ knowledge file from the corpus
        #[arg(long)]
        generate_faq: bool,
    },
    /// Run the HTTP chat server
    Serve {
        /// Address to bind
        #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(exit_codes::EXIT_CONFIG_ERROR);
        }
    };

    let exit_code = run_command(cli.command, config).await;
    std::process::exit(exit_code);
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

async fn run_command(command: Commands, config: EngineConfig) -> i32 {
    use exit_codes::*;

    match command {
        Commands::Ask { query, json } => {
            let args = commands::ask::AskArgs { query, json };
            match commands::ask::execute(config, args).await {
                Ok(exit_code) => exit_code,
                Err(e) => {
                    eprintln!("Ask error: {e:#}");
                    EXIT_ERROR
                }
            }
        }
        Commands::Ingest { dir, generate_faq } => {
            let args = commands::ingest::IngestArgs { dir, generate_faq };
            match commands::ingest::execute(config, args).await {
                Ok(exit_code) => exit_code,
                Err(e) => {
                    eprintln!("Ingest error: {e:#}");
                    EXIT_ERROR
                }
            }
        }
        Commands::Serve { addr } => {
            let args = commands::serve::ServeArgs { addr };
            match commands::serve::execute(config, args).await {
                Ok(exit_code) => exit_code,
                Err(e) => {
                    eprintln!("Serve error: {e:#}");
                    EXIT_ERROR
                }
            }
        }
    }
}
