//! Benchmark question set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, TuneflowError};

/// One multi-turn benchmark question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkQuestion {
    #[serde(deserialize_with = "id_as_string")]
    pub question_id: String,
    #[serde(default)]
    pub category: String,
    pub turns: Vec<String>,
}

fn id_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "question_id must be a string or number, got {}",
            other
        ))),
    }
}

/// Parse a JSONL question file. Blank lines are ignored.
pub fn parse_questions(raw: &str) -> Result<Vec<BenchmarkQuestion>> {
    let mut questions = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let question: BenchmarkQuestion = serde_json::from_str(line).map_err(|e| {
            TuneflowError::InvalidBenchmark(format!("line {}: {}", idx + 1, e))
        })?;
        if question.turns.is_empty() {
            return Err(TuneflowError::InvalidBenchmark(format!(
                "question {} has no turns",
                question.question_id
            )));
        }
        questions.push(question);
    }
    if questions.is_empty() {
        return Err(TuneflowError::InvalidBenchmark(
            "question set is empty".to_string(),
        ));
    }
    Ok(questions)
}

pub async fn load_questions(path: &Path) -> Result<Vec<BenchmarkQuestion>> {
    let raw = tokio::fs::read_to_string(path).await?;
    parse_questions(&raw)
}
