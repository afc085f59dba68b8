//! Command-line surface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ensemble document annotation with vision models", long_about = None)]
pub struct Args {
    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Annotate images with every enabled annotator, then vote
    Run(RunArgs),

    /// Vote over cached annotations without calling any annotator
    Vote {
        #[arg(long)]
        config: PathBuf,
    },

    /// Export the voted results of a task as a JSONL dataset
    Export {
        #[arg(long)]
        config: PathBuf,
    },

    /// Compare predictions with ground truth
    Evaluate(EvaluateArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Task configuration file (YAML)
    #[arg(long)]
    pub config: PathBuf,

    /// Override task.max_workers
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Search the input directory recursively
    #[arg(long, default_value_t = false)]
    pub recursive: bool,

    /// Export a dataset after voting
    #[arg(long, default_value_t = false)]
    pub export: bool,
}

#[derive(clap::Args, Debug)]
pub struct EvaluateArgs {
    /// Directory of ground-truth JSON files
    #[arg(long)]
    pub ground_truth: PathBuf,

    /// Prediction directory, or the sampling directory with --num-samples
    #[arg(long)]
    pub predictions: PathBuf,

    /// Evaluate `sample_{i}` subdirectories instead of flat predictions
    #[arg(long)]
    pub num_samples: Option<usize>,

    /// Field matcher as FIELD=KIND (exact, case_insensitive, numeric, date, currency)
    #[arg(long = "matcher", value_parser = parse_matcher_arg)]
    pub matchers: Vec<(String, String)>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

fn parse_matcher_arg(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((field, kind)) if !field.is_empty() && !kind.is_empty() => {
            Ok((field.to_string(), kind.to_string()))
        }
        _ => Err(format!("expected FIELD=KIND, got '{arg}'")),
    }
}
