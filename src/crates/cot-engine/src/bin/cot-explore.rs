//! Explore and audit reasoning trees from the command line.
//!
//! Reads one problem from flags or a batch from a JSON file, builds the
//! trees, audits them, and prints the visualized trie plus the serialized
//! reports.

use anyhow::{Context, Result};
use clap::Parser;
use cot_engine::{Engine, EngineConfig, Problem};
use llm::config::RunnerConfig;
use llm::{BackendRegistry, GenerationParams};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cot-explore", about = "Reasoning-tree exploration and faithfulness audit")]
struct Args {
    /// A single problem statement.
    #[arg(long, conflicts_with = "problems")]
    question: Option<String>,

    /// Ground-truth answer for the single problem.
    #[arg(long, requires = "question")]
    answer: Option<String>,

    /// JSON file with an array of {question, answer, category} records.
    #[arg(long)]
    problems: Option<PathBuf>,

    /// Solver model name.
    #[arg(long, default_value = "claude-3-haiku-20240307")]
    solver_model: String,

    /// Judge model name.
    #[arg(long, default_value = "claude-3-5-sonnet-20241022")]
    judge_model: String,

    /// Upper bound on children per node.
    #[arg(long, default_value_t = 3)]
    branching_factor: usize,

    /// Concurrent request cap for hosted back-ends.
    #[arg(long, default_value_t = 20)]
    remote_limit: usize,

    /// Concurrent request cap for local back-ends.
    #[arg(long, default_value_t = 1)]
    local_limit: usize,

    /// Retry attempts for throttled requests.
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Base URL of a self-hosted runner (enables `runner:<model>` names).
    #[arg(long)]
    runner_url: Option<String>,

    /// Randomize seed and temperature per sampled continuation.
    #[arg(long)]
    vary_sampling: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let problems = load_problems(&args)?;
    if problems.is_empty() {
        anyhow::bail!("no problems given; use --question or --problems");
    }

    let config = EngineConfig::new(&args.solver_model, &args.judge_model)
        .with_branching_factor(args.branching_factor)
        .with_semaphore_limits(args.remote_limit, args.local_limit)
        .with_max_retries(args.max_retries);

    let mut registry =
        BackendRegistry::new(args.remote_limit, args.local_limit, args.max_retries);
    if let Some(url) = &args.runner_url {
        registry = registry.with_runner(RunnerConfig::new(url, "default"));
    }

    let mut engine = Engine::with_registry(config, registry)?;
    if args.vary_sampling {
        engine = engine.with_sampler(Arc::new(|| {
            let mut rng = rand::thread_rng();
            GenerationParams::new()
                .with_seed(rng.gen_range(0..1_000_000))
                .with_temperature(rng.gen_range(0.6..0.8))
        }));
    }

    let reports = engine.run_batch(&problems).await;
    for report in &reports {
        println!("== {} ({})\n", report.question, report.run_id);
        println!("{}", Engine::visualize(report));
        println!(
            "size={} depth={} incorrect_steps={} audited_paths={} unfaithful_to_correct={}\n",
            report.size,
            report.depth,
            report.incorrect_steps,
            report.audited_paths,
            report.has_unfaithful_correct_path
        );
        println!("{}", serde_json::to_string_pretty(&report.tree)?);
    }

    eprintln!("{}/{} problems succeeded", reports.len(), problems.len());
    Ok(())
}

fn load_problems(args: &Args) -> Result<Vec<Problem>> {
    if let Some(path) = &args.problems {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let problems: Vec<Problem> =
            serde_json::from_str(&data).context("parsing problems file")?;
        return Ok(problems);
    }

    Ok(args
        .question
        .iter()
        .map(|question| Problem {
            question: question.clone(),
            answer: args.answer.clone(),
            category: None,
        })
        .collect())
}
