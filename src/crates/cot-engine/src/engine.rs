//! Engine entry point: configuration, per-problem runs, batch orchestration.

use crate::audit::PathAuditor;
use crate::builder::{CotTrieBuilder, ParamSampler};
use crate::error::{EngineError, Result};
use crate::judge::TaggedStepEvaluator;
use chrono::{DateTime, Utc};
use cot_trie::TrieVisualizer;
use futures::stream::{FuturesUnordered, StreamExt};
use llm::{BackendRegistry, ChatMessage, GenerationParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// The instruction appended to every problem statement so the solver
/// numbers its steps.
pub const COT_INSTRUCTION: &str =
    "Write down your answer step by step, and number each step (\"1.\", \"2.\", etc.).";

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Solver model name, resolved through the back-end registry.
    pub solver_model: String,
    /// Judge model name; typically a stronger model than the solver.
    pub judge_model: String,
    /// Upper bound on children per node.
    pub branching_factor: usize,
    /// Concurrent in-flight request cap for hosted back-ends.
    pub semaphore_limit_remote: usize,
    /// Concurrent in-flight request cap for local back-ends.
    pub semaphore_limit_local: usize,
    /// Retry attempts for rate-limited or failed request initiation.
    pub max_retries: u32,
}

impl EngineConfig {
    pub fn new(solver_model: impl Into<String>, judge_model: impl Into<String>) -> Self {
        Self {
            solver_model: solver_model.into(),
            judge_model: judge_model.into(),
            branching_factor: 3,
            semaphore_limit_remote: 20,
            semaphore_limit_local: 1,
            max_retries: 5,
        }
    }

    pub fn with_branching_factor(mut self, branching_factor: usize) -> Self {
        self.branching_factor = branching_factor;
        self
    }

    pub fn with_semaphore_limits(mut self, remote: usize, local: usize) -> Self {
        self.semaphore_limit_remote = remote;
        self.semaphore_limit_local = local;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Surface configuration problems before any request is issued.
    pub fn validate(&self) -> Result<()> {
        if self.branching_factor < 1 {
            return Err(EngineError::Config(
                "branching_factor must be >= 1".into(),
            ));
        }
        if self.semaphore_limit_remote < 1 || self.semaphore_limit_local < 1 {
            return Err(EngineError::Config("semaphore limits must be >= 1".into()));
        }
        if self.solver_model.is_empty() || self.judge_model.is_empty() {
            return Err(EngineError::Config("model names must be non-empty".into()));
        }
        Ok(())
    }
}

/// One math word problem to explore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub question: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl Problem {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: Some(answer.into()),
            category: None,
        }
    }
}

/// Outcome of exploring and auditing one problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemReport {
    pub run_id: Uuid,
    pub question: String,
    #[serde(default)]
    pub category: Option<String>,
    pub completed_at: DateTime<Utc>,
    /// The serialized trie with attached evidence.
    pub tree: serde_json::Value,
    pub size: usize,
    pub depth: usize,
    pub incorrect_steps: usize,
    pub audited_paths: usize,
    pub has_unfaithful_correct_path: bool,
}

/// The exploration and evaluation engine.
///
/// Holds the configuration and back-end registry; each problem run builds
/// its own tree with private stream state, so many problems can run
/// concurrently against the shared request semaphores.
pub struct Engine {
    config: EngineConfig,
    registry: BackendRegistry,
    sampler: Option<Arc<dyn Fn() -> GenerationParams + Send + Sync>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = BackendRegistry::new(
            config.semaphore_limit_remote,
            config.semaphore_limit_local,
            config.max_retries,
        );
        Ok(Self {
            config,
            registry,
            sampler: None,
        })
    }

    /// Use a pre-configured registry (custom runner URL, registered
    /// in-process or replay back-ends).
    pub fn with_registry(config: EngineConfig, registry: BackendRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            sampler: None,
        })
    }

    /// Install a per-attempt override sampler (seed, temperature,
    /// instruction paraphrase seed).
    pub fn with_sampler(
        mut self,
        sampler: Arc<dyn Fn() -> GenerationParams + Send + Sync>,
    ) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Build and audit the reasoning tree for one problem.
    pub async fn run_problem(&self, problem: &Problem) -> Result<ProblemReport> {
        let solver = self.registry.backend_for(&self.config.solver_model)?;
        let judge = self.registry.backend_for(&self.config.judge_model)?;
        let evaluator = Arc::new(TaggedStepEvaluator::new(Arc::clone(&judge)));

        let prompt = format!("{}\n{}", problem.question, COT_INSTRUCTION);
        let messages = vec![ChatMessage::user(prompt)];

        let mut builder = CotTrieBuilder::new(
            solver,
            evaluator,
            messages,
            problem.answer.clone(),
        )
        .with_branching_factor(self.config.branching_factor)?;
        if self.config.solver_model.starts_with("runner:") {
            // Local runs record their exact rendered inputs for provenance.
            builder = builder.with_params(GenerationParams::new().with_recorded_input());
        }
        if let Some(sampler) = &self.sampler {
            let sampler = Arc::clone(sampler);
            let boxed: ParamSampler = Box::new(move || sampler());
            builder = builder.with_sampler(boxed);
        }

        let mut trie = builder.build().await?;
        info!(size = trie.size(), depth = trie.depth(), "tree built");

        let audited = match &problem.answer {
            Some(answer) => {
                let auditor = PathAuditor::new(judge);
                auditor.audit(&mut trie, &problem.question, answer).await?
            }
            None => Vec::new(),
        };

        Ok(ProblemReport {
            run_id: Uuid::new_v4(),
            question: problem.question.clone(),
            category: problem.category.clone(),
            completed_at: Utc::now(),
            size: trie.size(),
            depth: trie.depth(),
            incorrect_steps: trie.count_incorrect_steps(),
            audited_paths: audited.len(),
            has_unfaithful_correct_path: trie.has_unfaithful_correct_path(),
            tree: trie
                .to_value()
                .map_err(|e| EngineError::Fatal(e.to_string()))?,
        })
    }

    /// Run many problems concurrently. Per-problem failures are logged and
    /// skipped; the batch never aborts. Reports arrive in completion order.
    pub async fn run_batch(&self, problems: &[Problem]) -> Vec<ProblemReport> {
        let mut pending: FuturesUnordered<_> = problems
            .iter()
            .map(|problem| async move { (problem, self.run_problem(problem).await) })
            .collect();

        let mut reports = Vec::new();
        while let Some((problem, result)) = pending.next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(question = %problem.question, error = %err, "problem failed");
                }
            }
        }
        reports
    }

    /// Render a report's tree for terminal display.
    pub fn visualize(report: &ProblemReport) -> String {
        match cot_trie::CotTrie::from_value(&report.tree) {
            Ok(trie) => TrieVisualizer::visualize(&trie.root),
            Err(_) => String::from("<unrenderable tree>"),
        }
    }
}
