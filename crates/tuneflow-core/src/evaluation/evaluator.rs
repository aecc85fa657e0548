//! Drives one candidate through generation and judging.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::client::{ChatMessage, CompletionClient, ScoringOracle};
use super::questions::BenchmarkQuestion;
use crate::domain::score::{CandidateScoreReport, QaScore};

/// Candidate answers to one question, one entry per turn.
///
/// An entry is `None` when generation failed for that turn or an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAnswer {
    pub question_id: String,
    pub answers: Vec<Option<String>>,
}

/// Generation and judging against a fixed question set.
///
/// Requests fan out up to `concurrency` in flight. Each request is
/// independent; results are merged in question order after all complete.
#[derive(Debug, Clone)]
pub struct CandidateEvaluator {
    questions: Arc<Vec<BenchmarkQuestion>>,
    concurrency: usize,
}

impl CandidateEvaluator {
    pub fn new(questions: Vec<BenchmarkQuestion>, concurrency: usize) -> Self {
        Self {
            questions: Arc::new(questions),
            concurrency: concurrency.max(1),
        }
    }

    pub fn questions(&self) -> &[BenchmarkQuestion] {
        &self.questions
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Answer every question against the served candidate.
    pub async fn generate(&self, client: &dyn CompletionClient) -> Vec<GeneratedAnswer> {
        stream::iter(self.questions.iter())
            .map(|question| answer_question(client, question))
            .buffered(self.concurrency)
            .boxed()
            .collect()
            .await
    }

    /// Judge generated answers and build the candidate's report.
    pub async fn judge(
        &self,
        candidate: &str,
        generated: &[GeneratedAnswer],
        oracle: &dyn ScoringOracle,
    ) -> CandidateScoreReport {
        let mut jobs = Vec::new();
        for (question, answer) in self.questions.iter().zip(generated) {
            for turn in 1..=question.turns.len() {
                jobs.push((question, answer, turn));
            }
        }

        let qa_scores: Vec<QaScore> = stream::iter(jobs)
            .map(|(question, answer, turn)| async move {
                let score = judge_turn(oracle, question, answer, turn).await;
                QaScore {
                    question_id: question.question_id.clone(),
                    category: question.category.clone(),
                    turn,
                    score,
                }
            })
            .buffered(self.concurrency)
            .boxed()
            .collect()
            .await;

        CandidateScoreReport::from_judgements(candidate, oracle.judge_model(), qa_scores)
    }

    /// Generation then judging for one candidate.
    pub async fn evaluate(
        &self,
        candidate: &str,
        client: &dyn CompletionClient,
        oracle: &dyn ScoringOracle,
    ) -> CandidateScoreReport {
        let generated = self.generate(client).await;
        self.judge(candidate, &generated, oracle).await
    }
}

async fn answer_question(
    client: &dyn CompletionClient,
    question: &BenchmarkQuestion,
) -> GeneratedAnswer {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(question.turns.len() * 2);
    let mut answers = Vec::with_capacity(question.turns.len());
    let mut failed = false;

    for (idx, turn) in question.turns.iter().enumerate() {
        if failed {
            answers.push(None);
            continue;
        }
        messages.push(ChatMessage::user(turn.clone()));
        match client.complete(&messages).await {
            Ok(reply) => {
                messages.push(ChatMessage::assistant(reply.clone()));
                answers.push(Some(reply));
            }
            Err(err) => {
                warn!(question = %question.question_id, turn = idx + 1, error = %err, "generation failed");
                failed = true;
                answers.push(None);
            }
        }
    }

    GeneratedAnswer {
        question_id: question.question_id.clone(),
        answers,
    }
}

async fn judge_turn(
    oracle: &dyn ScoringOracle,
    question: &BenchmarkQuestion,
    answer: &GeneratedAnswer,
    turn: usize,
) -> Option<f64> {
    let answers: Option<Vec<String>> = answer.answers.iter().take(turn).cloned().collect();
    let answers = match answers {
        Some(a) if a.len() == turn => a,
        _ => {
            debug!(question = %question.question_id, turn = turn, "no answer to judge");
            return None;
        }
    };

    match oracle.score(question, &answers, turn).await {
        Ok(score) => Some(score),
        Err(err) => {
            warn!(question = %question.question_id, turn = turn, error = %err, "judging failed");
            None
        }
    }
}

/// In-memory fakes for testing.
pub mod fakes {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::error::{Result, TuneflowError};

    /// Echoes the last user message, prefixed with the model name.
    pub struct EchoCompletionClient {
        model: String,
        fail_containing: Option<String>,
        pub calls: AtomicUsize,
    }

    impl EchoCompletionClient {
        pub fn new(model: impl Into<String>) -> Self {
            Self {
                model: model.into(),
                fail_containing: None,
                calls: AtomicUsize::new(0),
            }
        }

        /// Fail any request whose last message contains `needle`.
        pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
            self.fail_containing = Some(needle.into());
            self
        }
    }

    #[async_trait]
    impl CompletionClient for EchoCompletionClient {
        fn model(&self) -> &str {
            &self.model
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
            if let Some(needle) = &self.fail_containing {
                if last.contains(needle.as_str()) {
                    return Err(TuneflowError::TransientNetwork("injected".to_string()));
                }
            }
            Ok(format!("{}: {}", self.model, last))
        }
    }

    /// Returns a fixed score, failing for listed question ids.
    pub struct FixedScoreOracle {
        pub judge_model: String,
        pub score: f64,
        pub failing_questions: HashSet<String>,
    }

    impl FixedScoreOracle {
        pub fn new(score: f64) -> Self {
            Self {
                judge_model: "fixed-judge".to_string(),
                score,
                failing_questions: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl ScoringOracle for FixedScoreOracle {
        fn judge_model(&self) -> &str {
            &self.judge_model
        }

        async fn score(
            &self,
            question: &BenchmarkQuestion,
            _answers: &[String],
            _turn: usize,
        ) -> Result<f64> {
            if self.failing_questions.contains(&question.question_id) {
                return Err(TuneflowError::TransientNetwork("judge down".to_string()));
            }
            Ok(self.score)
        }
    }
}
