//! Candidate evaluation: benchmark questions, chat clients, judging.

pub mod client;
pub mod concurrency;
pub mod evaluator;
pub mod questions;

pub use client::{
    judge_messages, parse_rating, ChatJudge, ChatMessage, CompletionClient, OpenAiChatClient,
    ScoringOracle,
};
pub use concurrency::WorkerCount;
pub use evaluator::{CandidateEvaluator, GeneratedAnswer};
pub use questions::{load_questions, parse_questions, BenchmarkQuestion};
