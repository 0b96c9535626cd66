mod demo;
mod report;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use weave_core::config::{LogConfig, WeaveConfig};
use weave_core::error::WeaveError;
use weave_runtime::{ValidatorLimits, WorkflowGraph, WorkflowValidator};

#[derive(Parser)]
#[command(name = "weave", version, about = "Event-driven agent orchestration runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weave.toml", env = "WEAVE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow graph file (TOML or JSON)
    Validate {
        /// Graph file to check
        path: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Treat error handlers with outgoing routes as invalid
        #[arg(long)]
        strict: bool,
    },
    /// Show the effective configuration
    Config,
    /// Run a small in-process workflow and print its trace
    Demo {
        /// Print the trace as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weave", &mut std::io::stdout());
        return Ok(());
    }

    let (config, missing) = match WeaveConfig::load(&cli.config) {
        Ok(config) => (config, false),
        Err(WeaveError::ConfigNotFound(_)) => (WeaveConfig::default(), true),
        Err(e) => {
            return Err(e).with_context(|| format!("loading {}", cli.config.display()));
        }
    };
    init_tracing(&config.log);
    if missing {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Validate { path, json, strict } => {
            let graph = WorkflowGraph::load(&path)
                .with_context(|| format!("reading workflow {}", path.display()))?;
            let limits = ValidatorLimits {
                max_parallel: config.orchestration.max_concurrency,
                strict,
                error_handler_name: config.error_router.error_handler_name.clone(),
                ..ValidatorLimits::default()
            };
            let result = WorkflowValidator::new(limits).validate_graph(&graph);

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                report::print_validation(&path, &graph, &result);
            }
            if !result.is_valid {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Demo { json } => {
            demo::run(&config, json).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter)),
        )
        .with_target(log.with_target)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_validate() {
        let cli = Cli::try_parse_from(["weave", "-c", "alt.toml", "validate", "flow.toml", "--json"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(
            cli.command,
            Commands::Validate { json: true, strict: false, .. }
        ));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
