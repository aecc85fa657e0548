//! OpenAI-compatible chat clients for generation and judging.
//!
//! - `CompletionClient`: one chat completion against a served model
//! - `ScoringOracle`: rates one answer turn; opaque to the evaluator

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::questions::BenchmarkQuestion;
use crate::domain::error::{Result, TuneflowError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier requests are addressed to.
    fn model(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    /// Judge model identifier recorded in reports.
    fn judge_model(&self) -> &str;

    /// Rate answer turn `turn` (1-based). `answers` holds every answer up to
    /// and including that turn.
    async fn score(
        &self,
        question: &BenchmarkQuestion,
        answers: &[String],
        turn: usize,
    ) -> Result<f64>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Chat completions over HTTP (`POST {endpoint}/chat/completions`).
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatClient {
    /// `ca_cert`, when given, is added to the trusted roots.
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        ca_cert: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(600));
        if let Some(path) = ca_cert {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            client: builder.build()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            temperature: 0.0,
            max_tokens: 2048,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl CompletionClient for OpenAiChatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TuneflowError::TransientNetwork(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TuneflowError::TransientNetwork(format!(
                "chat completion returned HTTP {}",
                status
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                TuneflowError::TransientNetwork("chat completion had no choices".to_string())
            })
    }
}

const JUDGE_SYSTEM_PROMPT: &str = "Please act as an impartial judge and evaluate the quality \
of the response provided by an AI assistant to the user question displayed below. Your \
evaluation should consider factors such as the helpfulness, relevance, accuracy, depth, \
creativity, and level of detail of the response. Begin your evaluation by providing a short \
explanation. Be as objective as possible. After providing your explanation, you must rate the \
response on a scale of 1 to 10 by strictly following this format: \"[[rating]]\", for \
example: \"Rating: [[5]]\".";

const JUDGE_MULTI_TURN_SYSTEM_PROMPT: &str = "Please act as an impartial judge and evaluate \
the quality of the response provided by an AI assistant to the user question displayed below. \
You should focus on the assistant's answer to the second user question. Begin your evaluation \
by providing a short explanation. Be as objective as possible. After providing your \
explanation, you must rate the response on a scale of 1 to 10 by strictly following this \
format: \"[[rating]]\", for example: \"Rating: [[5]]\".";

/// Extract the rating from a judge reply (`[[7]]` or `[[7.5]]`).
pub fn parse_rating(reply: &str) -> Option<f64> {
    static RATING: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = RATING
        .get_or_init(|| Regex::new(r"\[\[(\d+(?:\.\d+)?)\]\]").ok())
        .as_ref()?;
    pattern
        .captures_iter(reply)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Build the judge prompt for one answer turn.
pub fn judge_messages(
    question: &BenchmarkQuestion,
    answers: &[String],
    turn: usize,
    merge_system_user_message: bool,
) -> Vec<ChatMessage> {
    let (system, user) = if turn <= 1 {
        let q = question.turns.first().map(String::as_str).unwrap_or("");
        let a = answers.first().map(String::as_str).unwrap_or("");
        (
            JUDGE_SYSTEM_PROMPT,
            format!(
                "[Question]\n{}\n\n[The Start of Assistant's Answer]\n{}\n[The End of Assistant's Answer]",
                q, a
            ),
        )
    } else {
        let mut transcript = String::from("<|The Start of Assistant A's Conversation with User|>\n");
        for (idx, q) in question.turns.iter().take(turn).enumerate() {
            let a = answers.get(idx).map(String::as_str).unwrap_or("");
            transcript.push_str(&format!(
                "\n### User:\n{}\n\n### Assistant A:\n{}\n",
                q, a
            ));
        }
        transcript.push_str("\n<|The End of Assistant A's Conversation with User|>");
        (JUDGE_MULTI_TURN_SYSTEM_PROMPT, transcript)
    };

    if merge_system_user_message {
        vec![ChatMessage::user(format!("{}\n\n{}", system, user))]
    } else {
        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

/// Rubric judge backed by a chat completion endpoint.
pub struct ChatJudge<C> {
    client: C,
    merge_system_user_message: bool,
}

impl<C: CompletionClient> ChatJudge<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            merge_system_user_message: false,
        }
    }

    /// Fold the system prompt into the first user message.
    pub fn merge_system_user_message(mut self, merge: bool) -> Self {
        self.merge_system_user_message = merge;
        self
    }
}

#[async_trait]
impl<C: CompletionClient> ScoringOracle for ChatJudge<C> {
    fn judge_model(&self) -> &str {
        self.client.model()
    }

    async fn score(
        &self,
        question: &BenchmarkQuestion,
        answers: &[String],
        turn: usize,
    ) -> Result<f64> {
        let messages = judge_messages(question, answers, turn, self.merge_system_user_message);
        let reply = self.client.complete(&messages).await?;
        parse_rating(&reply).ok_or_else(|| {
            TuneflowError::InvalidBenchmark(format!(
                "judge reply for question {} turn {} has no rating",
                question.question_id, turn
            ))
        })
    }
}
