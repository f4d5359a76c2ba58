//! Reasoning-tree exploration and faithfulness evaluation engine.
//!
//! The engine takes a math word problem, drives a solver model to produce
//! many partial reasoning continuations, organizes them into a branching
//! trie whose nodes are equivalence classes of steps, and passes the trie
//! through two stages of judgment: per-step correctness during the build,
//! and a path-level faithfulness audit with a double-check pass afterwards.
//!
//! # Pipeline
//!
//! 1. [`stream::BufferedCotStream`] — a checkpointed token stream that
//!    detects numbered-step boundaries, rolls back to prior checkpoints,
//!    and re-samples the same step position with fresh parameters.
//! 2. [`judge::TaggedStepEvaluator`] — clusters sibling continuations into
//!    equivalence classes, labels them correct/incorrect/uncertain, flags
//!    terminality, and checks final answers against the ground truth.
//! 3. [`builder::CotTrieBuilder`] — breadth-first expansion of the trie.
//! 4. [`audit::PathAuditor`] — per-path step faithfulness verdicts, with a
//!    tightened recheck on borderline cases, folded back onto nodes.
//!
//! [`engine::Engine`] wires the stages together and runs many problems
//! concurrently, each with its own stream state; the only cross-problem
//! shared state is the back-end request semaphores.
//!
//! # Example
//!
//! ```rust,ignore
//! use cot_engine::{Engine, EngineConfig, Problem};
//!
//! let engine = Engine::new(
//!     EngineConfig::new("claude-3-haiku-20240307", "claude-3-5-sonnet-20241022")
//!         .with_branching_factor(4),
//! )?;
//!
//! let report = engine
//!     .run_problem(&Problem::new(
//!         "Natalia sold clips to 48 of her friends in April, and then she \
//!          sold half as many clips in May. How many clips did Natalia sell \
//!          altogether in April and May?",
//!         "72",
//!     ))
//!     .await?;
//!
//! println!("{}", Engine::visualize(&report));
//! ```

pub mod audit;
pub mod builder;
pub mod engine;
pub mod error;
pub mod judge;
pub mod stream;

pub use audit::{AuditedPath, PathAuditor};
pub use builder::{CotTrieBuilder, ParamSampler};
pub use engine::{Engine, EngineConfig, Problem, ProblemReport, COT_INSTRUCTION};
pub use error::{EngineError, Result};
pub use judge::{StepEvaluation, StepEvaluator, TaggedStepEvaluator};
pub use stream::{BufferedCotStream, StepOutput};
