mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kensa_core::error::Result as KensaResult;
use kensa_core::model::ChatModel;
use kensa_eval::builtins::BUILTINS;
use kensa_eval::dataset::{DatasetProvider, JsonFileDataset};
use kensa_eval::presets::PRESET_NAMES;
use kensa_eval::result::{EvaluationResult, RunState};
use kensa_llm::factory::create_chat_model;
use kensa_llm::mock::ScriptedChatModel;
use kensa_llm::provider::{ModelRef, ProviderSettings};

use config::EvalFile;

/// kensa: evaluate chat models against question-answering datasets.
#[derive(Parser, Debug)]
#[command(name = "kensa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate outputs for every case and score them.
    Run {
        /// Evaluation config (YAML)
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        /// Dataset file (.json or .jsonl)
        #[arg(short = 'd', long = "dataset")]
        dataset: PathBuf,

        /// Replace the system prompt from the config
        #[arg(long = "system-prompt")]
        system_prompt: Option<String>,

        #[arg(long = "format", value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Write the report here instead of stdout
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Check config, dataset and metric columns without calling any model.
    Validate {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        #[arg(short = 'd', long = "dataset")]
        dataset: PathBuf,
    },
    /// List the builtin metrics and judge presets.
    Metrics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Tsv,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kensa=info,kensa_eval=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            dataset,
            system_prompt,
            format,
            output,
        } => {
            run(
                &config,
                &dataset,
                system_prompt.as_deref(),
                format,
                output.as_deref(),
            )
            .await
        }
        Command::Validate { config, dataset } => validate(&config, &dataset),
        Command::Metrics => {
            print_metrics();
            Ok(())
        }
    }
}

async fn run(
    config_path: &Path,
    dataset_path: &Path,
    system_prompt: Option<&str>,
    format: OutputFormat,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let file = EvalFile::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let settings = ProviderSettings::from_env();
    let resolve = |model_ref: &ModelRef| create_chat_model(model_ref, &settings);

    let token = CancellationToken::new();
    let runner = file
        .build_runner(system_prompt, &resolve)?
        .with_cancellation(token.clone());

    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            ctrl_c.cancel();
        }
    });

    info!(config = %config_path.display(), model = %file.model, "running evaluation");
    let provider = JsonFileDataset::new(dataset_path, file.dataset.clone());
    let result = runner.run(&provider).await?;
    if result.state == RunState::Cancelled {
        warn!("run was cancelled; report covers completed cases only");
    }

    let report = render(&result, format)?;
    match output {
        Some(path) => {
            std::fs::write(path, report).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => print!("{report}"),
    }
    Ok(())
}

fn render(result: &EvaluationResult, format: OutputFormat) -> KensaResult<String> {
    Ok(match format {
        OutputFormat::Table => result.summary_table(),
        OutputFormat::Tsv => result.detail_tsv(),
        OutputFormat::Json => result.to_json()?,
    })
}

/// Stand-in models so validation never reaches the network.
fn offline_model(model_ref: &ModelRef) -> KensaResult<Arc<dyn ChatModel>> {
    Ok(Arc::new(ScriptedChatModel::with_response(model_ref.to_string())))
}

fn validate(config_path: &Path, dataset_path: &Path) -> anyhow::Result<()> {
    let file = EvalFile::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let runner = file.build_runner(None, &offline_model)?;
    let dataset = JsonFileDataset::new(dataset_path, file.dataset.clone())
        .load()
        .with_context(|| format!("loading {}", dataset_path.display()))?;
    let registry = runner.prepare(&dataset)?;

    let settings = ProviderSettings::from_env();
    if settings.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; `kensa run` will fail to resolve models");
    }
    println!(
        "ok: {} cases, {} metrics [{}], models {}",
        dataset.len(),
        registry.len(),
        registry.names().join(", "),
        file.model_refs()
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn print_metrics() {
    println!("builtin metrics:");
    let width = BUILTINS.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, description) in BUILTINS {
        println!("  {name:<width$}  {description}");
    }
    println!("judge presets:");
    for name in PRESET_NAMES {
        println!("  {name}");
    }
}
