//! Breadth-first construction of the reasoning trie.
//!
//! The builder drives the checkpointed step stream to produce many partial
//! continuations per node, asks the step judge to cluster them into
//! equivalence classes with correctness labels, and materializes the
//! classes as child nodes. Terminal children with a known ground-truth
//! answer additionally receive a terminal-answer judgment.
//!
//! The stream is stateful, so child sampling within one node is strictly
//! sequential; concurrency across problems lives with the orchestrator,
//! where each builder owns its own stream.

use crate::error::{EngineError, Result};
use crate::judge::StepEvaluator;
use crate::stream::BufferedCotStream;
use cot_trie::{CotContent, CotTrie, CotTrieNode};
use llm::{ChatMessage, GenerationParams, ModelBackend};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Produces per-attempt sampling overrides (seed, temperature, instruction
/// paraphrase seed). Sampled fresh for every candidate attempt.
pub type ParamSampler = Box<dyn Fn() -> GenerationParams + Send + Sync>;

/// Candidates shorter than this are step-number echoes, not steps: a model
/// given a prefix ending in "2. " sometimes jumps straight to "\n3. ".
const MIN_STEP_LEN: usize = "\n\nStep 10: ".len();

struct Candidate {
    text: String,
    done: bool,
    args: Option<Value>,
    input: Option<String>,
}

/// Builds one reasoning trie for one problem.
pub struct CotTrieBuilder {
    backend: Arc<dyn ModelBackend>,
    evaluator: Arc<dyn StepEvaluator>,
    messages: Vec<ChatMessage>,
    answer: Option<String>,
    branching_factor: usize,
    sampler: ParamSampler,
    stream: BufferedCotStream,
    next_node_id: u32,
}

impl CotTrieBuilder {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        evaluator: Arc<dyn StepEvaluator>,
        messages: Vec<ChatMessage>,
        answer: Option<String>,
    ) -> Self {
        let stream = BufferedCotStream::new(Arc::clone(&backend), messages.clone());
        Self {
            backend,
            evaluator,
            messages,
            answer,
            branching_factor: 3,
            sampler: Box::new(GenerationParams::default),
            stream,
            next_node_id: 1,
        }
    }

    /// Upper bound on children per node; fewer are acceptable when the
    /// model repeats itself.
    pub fn with_branching_factor(mut self, branching_factor: usize) -> Result<Self> {
        if branching_factor < 1 {
            return Err(EngineError::Config(
                "branching_factor must be >= 1".into(),
            ));
        }
        self.branching_factor = branching_factor;
        Ok(self)
    }

    pub fn with_sampler(mut self, sampler: ParamSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Parameters applied to every solver generation (max tokens, input
    /// recording for provenance, model override).
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.stream = BufferedCotStream::new(Arc::clone(&self.backend), self.messages.clone())
            .with_params(params);
        self
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    /// Build the trie. Consumes the builder: a trie is built in one run or
    /// discarded.
    pub async fn build(mut self) -> Result<CotTrie> {
        // Prime with a single step; the preamble before the first numbered
        // marker needs no equivalence or correctness judgment.
        let overrides = (self.sampler)();
        let primed = self
            .stream
            .single_step(false, &overrides)
            .await?
            .ok_or_else(|| EngineError::Fatal("solver produced no output".into()))?;

        let root_id = self.next_id();
        let mut content = CotContent::single(primed.text.clone(), cot_trie::Correctness::Correct);
        content.step_indices = Some(vec![1]);
        if !overrides.is_empty() {
            content.args = Some(vec![Some(serde_json::to_value(&overrides).map_err(
                |e| EngineError::Fatal(format!("cannot record sampling args: {}", e)),
            )?)]);
        }
        if let Some(input) = primed.input {
            content.meta = Some(serde_json::json!({ "inputs": [input] }));
        }

        let mut root = CotTrieNode::new(content, primed.text, root_id);
        root.terminal = primed.done;

        if root.terminal {
            // The stream finished before any numbered step: no chain of
            // thought took place.
            return Ok(CotTrie::from_root(root));
        }

        let mut queue: VecDeque<Vec<usize>> = VecDeque::from([Vec::new()]);
        while let Some(path) = queue.pop_front() {
            let prefix = node_at(&root, &path).prefix.clone();
            let children = self.build_children(&prefix).await?;

            let node = node_at_mut(&mut root, &path);
            node.children = children;
            for (i, child) in node.children.iter().enumerate() {
                if !child.terminal {
                    let mut child_path = path.clone();
                    child_path.push(i);
                    queue.push_back(child_path);
                }
            }
        }

        Ok(CotTrie::from_root(root))
    }

    /// Sample candidate next-steps from `prefix` and judge them into child
    /// nodes.
    async fn build_children(&mut self, prefix: &str) -> Result<Vec<CotTrieNode>> {
        self.stream.step_rollouts(true);
        self.stream
            .set_assistant_prefix_and_reset_checkpoints(vec![
                self.backend.format_assistant_message(prefix)
            ]);

        let mut candidates: Vec<Candidate> = Vec::new();
        // One extra attempt absorbs the occasional empty or duplicate
        // response.
        for _ in 0..=self.branching_factor {
            if candidates.len() >= self.branching_factor {
                break;
            }

            let overrides = (self.sampler)();
            let Some(step) = self.stream.single_step(false, &overrides).await? else {
                break;
            };

            if step.text.is_empty() || candidates.iter().any(|c| c.text == step.text) {
                continue;
            }
            if step.text.len() < MIN_STEP_LEN {
                trace!(step = %step.text, "discarding step-number echo");
                continue;
            }

            let args = if overrides.is_empty() {
                None
            } else {
                Some(serde_json::to_value(&overrides).map_err(|e| {
                    EngineError::Fatal(format!("cannot record sampling args: {}", e))
                })?)
            };
            candidates.push(Candidate {
                text: step.text,
                done: step.done,
                args,
                input: step.input,
            });
        }

        debug!(
            candidates = candidates.len(),
            prefix_len = prefix.len(),
            "sampled candidate continuations"
        );

        // Continuations that ended the stream and those that kept going are
        // different outcomes; judge them as separate batches.
        let mut children = Vec::new();
        for done in [false, true] {
            let batch: Vec<&Candidate> = candidates.iter().filter(|c| c.done == done).collect();
            if batch.is_empty() {
                continue;
            }

            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let evaluations = self.evaluator.evaluate(&self.messages, prefix, &texts).await?;

            for evaluation in evaluations {
                let terminal = done || evaluation.is_final;

                let answer_correct = match (&self.answer, terminal) {
                    (Some(answer), true) => Some(
                        self.evaluator
                            .evaluate_answer(&evaluation.steps[0], answer)
                            .await?,
                    ),
                    _ => None,
                };

                // Per-variant sampling args and recorded inputs, aligned
                // with the group's members.
                let group_args: Vec<Option<Value>> = evaluation
                    .step_indices
                    .iter()
                    .map(|&i| {
                        batch
                            .get(i.saturating_sub(1) as usize)
                            .and_then(|c| c.args.clone())
                    })
                    .collect();
                let group_inputs: Vec<&String> = evaluation
                    .step_indices
                    .iter()
                    .filter_map(|&i| {
                        batch
                            .get(i.saturating_sub(1) as usize)
                            .and_then(|c| c.input.as_ref())
                    })
                    .collect();

                let first_step = evaluation.steps[0].clone();
                let node_id = self.next_id();
                let content = CotContent {
                    steps: evaluation.steps,
                    step_indices: Some(evaluation.step_indices),
                    args: if group_args.iter().all(Option::is_none) {
                        None
                    } else {
                        Some(group_args)
                    },
                    correct: evaluation.correct,
                    explanation: evaluation.explanation,
                    answer_correct,
                    secondary_eval: None,
                    meta: if group_inputs.is_empty() {
                        None
                    } else {
                        Some(serde_json::json!({ "inputs": group_inputs }))
                    },
                };

                let mut child =
                    CotTrieNode::new(content, format!("{}{}", prefix, first_step), node_id);
                child.terminal = terminal;
                children.push(child);
            }
        }

        Ok(children)
    }
}

fn node_at<'a>(root: &'a CotTrieNode, path: &[usize]) -> &'a CotTrieNode {
    path.iter().fold(root, |node, &i| &node.children[i])
}

fn node_at_mut<'a>(root: &'a mut CotTrieNode, path: &[usize]) -> &'a mut CotTrieNode {
    path.iter().fold(root, |node, &i| &mut node.children[i])
}
