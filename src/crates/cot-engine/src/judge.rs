//! Step judging: equivalence grouping, correctness labels, and
//! terminal-answer checks.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use cot_trie::{AnswerCheck, Correctness};
use futures::StreamExt;
use llm::{ChatMessage, GenerationParams, MessageRole, ModelBackend};
use std::sync::Arc;
use tracing::debug;

/// Evaluation of one equivalence group of candidate continuations.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvaluation {
    /// The group's member texts.
    pub steps: Vec<String>,
    /// 1-based indices of the members in the candidate list.
    pub step_indices: Vec<u32>,
    pub correct: Correctness,
    /// Whether this group is the last step of the solution.
    pub is_final: bool,
    pub explanation: Option<String>,
}

/// Judges batches of candidate next-steps.
#[async_trait]
pub trait StepEvaluator: Send + Sync {
    /// Group `steps` (candidate continuations of `prefix`) into equivalence
    /// classes with correctness labels and finality flags.
    async fn evaluate(
        &self,
        messages: &[ChatMessage],
        prefix: &str,
        steps: &[String],
    ) -> Result<Vec<StepEvaluation>>;

    /// Compare a terminal step against the ground-truth answer.
    async fn evaluate_answer(&self, step: &str, answer: &str) -> Result<AnswerCheck>;
}

/// The production evaluator: prompts a judge model for tagged output and
/// parses it tolerantly.
///
/// Expected equivalence output:
///
/// ```text
/// <explanation>…</explanation>
/// <equivalent>[[1,2],[4],[3,5]]</equivalent>
/// <correct>[correct, incorrect, uncertain]</correct>
/// <final>[yes, no, no]</final>
/// ```
///
/// A missing `<final>` defaults to all-false and unparseable correctness
/// labels degrade to `uncertain`, but a length mismatch between the
/// `<correct>` list and the equivalence groups aborts the tree build.
pub struct TaggedStepEvaluator {
    backend: Arc<dyn ModelBackend>,
    params: GenerationParams,
}

impl TaggedStepEvaluator {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    fn equivalence_messages(
        messages: &[ChatMessage],
        prefix: &str,
        steps: &[String],
    ) -> Vec<ChatMessage> {
        let mut prompt = String::from(
            "Consider the following conversation between a human and an AI assistant:\n\n<conversation>",
        );

        for message in messages {
            match message.role {
                MessageRole::Assistant => {
                    prompt.push_str(&format!("\n<assistant>{}</assistant>", message.content));
                }
                _ => {
                    prompt.push_str(&format!("\n<human>{}</human>", message.content));
                }
            }
        }
        if !prefix.is_empty() {
            prompt.push_str(&format!("\n<assistant>{}</assistant>", prefix));
        }

        prompt.push_str(
            "\n</conversation>\n\nIdentify which of the following continuations of the assistant's response \
             are equivalent to each other, in the sense that they are logically completely equivalent. If they are equivalent, \
             return the list of equivalent continuations. Make sure to include ALL continuations, even if they are unique by themselves. \
             For each respective set of equivalent continuations, also return whether they are correct, incorrect, or uncertain.\n\
             Also return if this is the final step for a given set of equivalent continuations.\
             State your reasoning in a way that is easy to understand and follow, and that is concise.\
             \nOutput format: <explanation>Continuations 1 and 2 are equivalent because they both follow the same logical steps. \
             Explanation 4 is different because it does X instead of Y. Etc. </explanation> \
             <equivalent>[[1, 2], [4], [3, 5]]</equivalent> <correct>[correct, incorrect, uncertain]</correct> <final>[yes, no, no]</final>\n\n",
        );

        prompt.push_str("The continuations are as follows:\n");
        for (i, step) in steps.iter().enumerate() {
            prompt.push_str(&format!(
                "\n<continuation-{idx}>{step}</continuation-{idx}>\n",
                idx = i + 1,
                step = step
            ));
        }
        prompt.push_str("\nOutput: ");

        vec![
            ChatMessage::user(prompt),
            ChatMessage::assistant("<explanation>"),
        ]
    }

    /// Stream the judge until `</final>` has been seen; the closing tag can
    /// straddle a chunk seam, so the check runs over the previous chunk
    /// concatenated with the current one.
    async fn stream_until_final(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut stream = self.backend.stream(messages, &self.params).await?;
        let mut response = String::new();
        let mut prev = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            response.push_str(&chunk.text);
            if format!("{}{}", prev, chunk.text).contains("</final>") {
                break;
            }
            prev = chunk.text;
        }

        Ok(response)
    }

    async fn collect_response(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut stream = self.backend.stream(messages, &self.params).await?;
        let mut response = String::new();
        while let Some(chunk) = stream.next().await {
            response.push_str(&chunk?.text);
        }
        Ok(response)
    }

    fn parse_groups(response: &str, steps: &[String]) -> Result<Vec<StepEvaluation>> {
        let response = response.trim();

        let explanation = response
            .find("</explanation>")
            .map(|end| response[..end].trim().to_string());

        let equivalent_str = tag_body(response, "equivalent")
            .ok_or_else(|| EngineError::Parse("missing <equivalent> tag".into()))?;
        let groups: Vec<Vec<u32>> = serde_json::from_str(&equivalent_str)
            .map_err(|e| EngineError::Parse(format!("invalid equivalence groups: {}", e)))?;

        let correct_str = tag_body(response, "correct")
            .ok_or_else(|| EngineError::Parse("missing <correct> tag".into()))?;
        let labels = parse_bracket_list(&correct_str);
        if labels.len() != groups.len() {
            return Err(EngineError::Parse(format!(
                "correctness list length {} does not match number of equivalence groups {}",
                labels.len(),
                groups.len()
            )));
        }

        let finals: Vec<String> = tag_body(response, "final")
            .map(|body| parse_bracket_list(&body))
            .unwrap_or_default();

        let mut evaluations = Vec::with_capacity(groups.len());
        for (group_idx, group) in groups.iter().enumerate() {
            let mut group_steps = Vec::with_capacity(group.len());
            for &index in group {
                let step = steps
                    .get(index.saturating_sub(1) as usize)
                    .ok_or_else(|| {
                        EngineError::Parse(format!(
                            "equivalence group references continuation {} of {}",
                            index,
                            steps.len()
                        ))
                    })?;
                group_steps.push(step.clone());
            }

            let correct = match labels[group_idx].as_str() {
                "correct" => Correctness::Correct,
                "incorrect" => Correctness::Incorrect,
                "uncertain" => Correctness::Uncertain,
                _ => Correctness::Uncertain,
            };
            let is_final = finals.get(group_idx).is_some_and(|f| f == "yes");

            evaluations.push(StepEvaluation {
                steps: group_steps,
                step_indices: group.clone(),
                correct,
                is_final,
                explanation: explanation.clone(),
            });
        }

        Ok(evaluations)
    }
}

/// Extract the body between `<tag>` and `</tag>`, stripping one level of
/// surrounding brackets is left to the caller.
fn tag_body(response: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = response.find(&open)? + open.len();
    let end = response[start..].find(&close)? + start;
    Some(response[start..end].to_string())
}

/// Parse `[a, b, c]` into trimmed items.
fn parse_bracket_list(body: &str) -> Vec<String> {
    body.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[async_trait]
impl StepEvaluator for TaggedStepEvaluator {
    async fn evaluate(
        &self,
        messages: &[ChatMessage],
        prefix: &str,
        steps: &[String],
    ) -> Result<Vec<StepEvaluation>> {
        if steps.is_empty() {
            return Err(EngineError::Fatal("no steps to evaluate".into()));
        }

        let judge_messages = Self::equivalence_messages(messages, prefix, steps);
        let response = self.stream_until_final(&judge_messages).await?;
        debug!(candidates = steps.len(), "judge equivalence response received");
        Self::parse_groups(&response, steps)
    }

    async fn evaluate_answer(&self, step: &str, answer: &str) -> Result<AnswerCheck> {
        let prompt = format!(
            "Compare the following step with the correct answer and determine if they match:\n\n\
             Step:\n<step>{step}</step>\n\n\
             Correct Answer:\n<answer>{answer}</answer>\n\n\
             Do these contain the same answer? Answer with <correct>yes</correct>, <correct>no</correct>, or <correct>uncertain</correct>.\n\
             Then explain your reasoning after a newline, being specific about the numbers involved.\n\n\
             Output format example:\n<correct>yes</correct>\n\
             The step shows 42 apples which matches the correct answer of 42 apples.\n",
        );
        let messages = vec![ChatMessage::user(prompt), ChatMessage::assistant("<correct>")];

        let response = self.collect_response(&messages).await?;
        let response = response.trim();

        let Some(end) = response.find("</correct>") else {
            return Ok(AnswerCheck::new(
                Correctness::Unknown,
                "Failed to parse model response",
            ));
        };

        let correct = match &response[..end] {
            "yes" => Correctness::Correct,
            "no" => Correctness::Incorrect,
            "uncertain" => Correctness::Uncertain,
            _ => {
                return Ok(AnswerCheck::new(
                    Correctness::Unknown,
                    "Failed to parse model response",
                ))
            }
        };

        let explanation = response[end + "</correct>".len()..].trim().to_string();
        Ok(AnswerCheck {
            correct,
            explanation: Some(explanation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::replay::ReplayBackend;

    fn evaluator_with(response: Vec<&str>) -> TaggedStepEvaluator {
        TaggedStepEvaluator::new(Arc::new(ReplayBackend::single(response)))
    }

    fn candidates() -> Vec<String> {
        vec![
            "x = 1 + 1 = 2".to_string(),
            "x equals 2 because 1+1=2".to_string(),
            "x = 3".to_string(),
        ]
    }

    #[tokio::test]
    async fn groups_equivalent_continuations() {
        // The judge is primed with "<explanation>", so its response starts
        // inside the tag.
        let evaluator = evaluator_with(vec![
            "1 and 2 compute the same value; 3 differs.</explanation> ",
            "<equivalent>[[1, 2], [3]]</equivalent> ",
            "<correct>[correct, incorrect]</correct> <final>[no, no]</final>",
        ]);

        let evals = evaluator
            .evaluate(&[ChatMessage::user("What is x if x = 1 + 1?")], "", &candidates())
            .await
            .unwrap();

        assert_eq!(evals.len(), 2);
        assert_eq!(evals[0].step_indices, vec![1, 2]);
        assert_eq!(evals[0].correct, Correctness::Correct);
        assert!(!evals[0].is_final);
        assert_eq!(
            evals[0].steps,
            vec!["x = 1 + 1 = 2", "x equals 2 because 1+1=2"]
        );
        assert_eq!(evals[1].step_indices, vec![3]);
        assert_eq!(evals[1].correct, Correctness::Incorrect);
        assert!(!evals[1].is_final);
    }

    #[tokio::test]
    async fn streaming_stops_after_final_tag() {
        let backend = Arc::new(ReplayBackend::single(vec![
            "e</explanation><equivalent>[[1]]</equivalent><correct>[correct]</correct><final>[yes]</fi",
            "nal>",
            "this tail must not be required",
        ]));
        let evaluator = TaggedStepEvaluator::new(backend);

        let evals = evaluator
            .evaluate(
                &[ChatMessage::user("q")],
                "",
                &["the answer is 2".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(evals.len(), 1);
        assert!(evals[0].is_final);
    }

    #[tokio::test]
    async fn missing_final_defaults_to_false() {
        let evaluator = evaluator_with(vec![
            "e</explanation><equivalent>[[1]]</equivalent><correct>[correct]</correct>",
        ]);

        let evals = evaluator
            .evaluate(&[ChatMessage::user("q")], "", &["step".to_string()])
            .await
            .unwrap();
        assert!(!evals[0].is_final);
    }

    #[tokio::test]
    async fn unknown_label_degrades_to_uncertain() {
        let evaluator = evaluator_with(vec![
            "e</explanation><equivalent>[[1]]</equivalent><correct>[probably]</correct><final>[no]</final>",
        ]);

        let evals = evaluator
            .evaluate(&[ChatMessage::user("q")], "", &["step".to_string()])
            .await
            .unwrap();
        assert_eq!(evals[0].correct, Correctness::Uncertain);
    }

    #[tokio::test]
    async fn label_count_mismatch_is_a_parse_error() {
        let evaluator = evaluator_with(vec![
            "e</explanation><equivalent>[[1], [2]]</equivalent><correct>[correct]</correct><final>[no, no]</final>",
        ]);

        let err = evaluator
            .evaluate(
                &[ChatMessage::user("q")],
                "",
                &["a".to_string(), "b".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[tokio::test]
    async fn malformed_groups_are_a_parse_error() {
        let evaluator = evaluator_with(vec![
            "e</explanation><equivalent>[[1,]</equivalent><correct>[correct]</correct><final>[no]</final>",
        ]);

        let err = evaluator
            .evaluate(&[ChatMessage::user("q")], "", &["a".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_rejected() {
        let evaluator = evaluator_with(vec!["unused"]);
        let err = evaluator
            .evaluate(&[ChatMessage::user("q")], "", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    #[tokio::test]
    async fn answer_check_maps_yes_no_uncertain() {
        for (reply, expected) in [
            ("yes</correct>\nThe numbers match.", Correctness::Correct),
            ("no</correct>\nThey differ.", Correctness::Incorrect),
            ("uncertain</correct>\nHard to say.", Correctness::Uncertain),
        ] {
            let evaluator = evaluator_with(vec![reply]);
            let check = evaluator.evaluate_answer("x = 2", "2").await.unwrap();
            assert_eq!(check.correct, expected);
            assert!(check.explanation.is_some());
        }
    }

    #[tokio::test]
    async fn unparseable_answer_check_degrades_to_unknown() {
        let evaluator = evaluator_with(vec!["maybe, who knows"]);
        let check = evaluator.evaluate_answer("x = 2", "2").await.unwrap();
        assert_eq!(check.correct, Correctness::Unknown);
        assert_eq!(
            check.explanation.as_deref(),
            Some("Failed to parse model response")
        );
    }

    #[test]
    fn prompt_wraps_conversation_and_continuations() {
        let messages = TaggedStepEvaluator::equivalence_messages(
            &[ChatMessage::user("What is x?")],
            "Let me think.\n",
            &["1. x = 2\n".to_string()],
        );

        assert_eq!(messages.len(), 2);
        let prompt = &messages[0].content;
        assert!(prompt.contains("<human>What is x?</human>"));
        assert!(prompt.contains("<assistant>Let me think.\n</assistant>"));
        assert!(prompt.contains("<continuation-1>1. x = 2\n</continuation-1>"));
        assert_eq!(messages[1], ChatMessage::assistant("<explanation>"));
    }
}
