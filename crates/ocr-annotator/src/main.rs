mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use annotation::evaluate::matcher_by_name;
use annotation::{
    BatchDriver, ConfigManager, DatasetExporter, FieldEvaluator, HttpAnnotatorFactory,
    JsonlDatasetExporter, SamplingEvaluator,
};
use clap::Parser;
use cli::{Args, Command, EvaluateArgs, RunArgs};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    match args.command {
        Command::Run(run) => run_pipeline(run, false).await,
        Command::Vote { config } => {
            let run = RunArgs {
                config,
                max_workers: None,
                recursive: false,
                export: false,
            };
            run_pipeline(run, true).await
        }
        Command::Export { config } => export(&config).await,
        Command::Evaluate(eval) => evaluate(eval),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: &std::path::Path) -> Result<ConfigManager> {
    ConfigManager::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))
}

async fn run_pipeline(args: RunArgs, vote_only: bool) -> Result<()> {
    let config = load_config(&args.config)?;
    let task = config.task().clone();
    info!(
        task_id = %task.task_id,
        version = config.version(),
        input = %task.input_dir.display(),
        output = %task.output_dir.display(),
        "Loaded task"
    );

    let factory = HttpAnnotatorFactory::default().with_prompt_path(task.prompt_path.clone());
    let mut driver = BatchDriver::new(config.clone(), Arc::new(factory))
        .context("invalid task configuration")?
        .skip_annotation(vote_only);
    if let Some(workers) = args.max_workers {
        driver = driver.with_max_workers(workers);
    }
    if args.export {
        let exporter = JsonlDatasetExporter::new(config.dataset().clone(), task.dataset_name());
        driver = driver.with_exporter(Box::new(exporter));
    }

    let images = driver
        .discover_images(args.recursive)
        .context("failed to resolve input images")?;
    let summary = driver.run(&images).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn export(config_path: &std::path::Path) -> Result<()> {
    let config = load_config(config_path)?;
    let task = config.task();
    let exporter = JsonlDatasetExporter::new(config.dataset().clone(), task.dataset_name());
    let summary = exporter
        .export(&task.voted_dir())
        .await
        .with_context(|| format!("export of {} failed", task.voted_dir().display()))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn evaluate(args: EvaluateArgs) -> Result<()> {
    let mut evaluator = FieldEvaluator::new();
    for (field, kind) in &args.matchers {
        evaluator = evaluator.with_matcher(field.clone(), matcher_by_name(kind)?);
    }

    let report = match args.num_samples {
        Some(num_samples) => {
            let results = SamplingEvaluator::new(evaluator, num_samples)
                .evaluate_batch(&args.ground_truth, &args.predictions)?;
            serde_json::to_string_pretty(&results)?
        }
        None => {
            let results = evaluator.evaluate_batch(&args.ground_truth, &args.predictions)?;
            serde_json::to_string_pretty(&results)?
        }
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &report)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Evaluation written");
        }
        None => println!("{report}"),
    }
    Ok(())
}
