//! Batch question answering for evaluating a collection.
//!
//! Every question runs in a fresh conversation so answers don't leak into
//! each other. Results are written as a JSON array of
//! `{ "id", "question", "answer" }` records.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::conversation::{ConversationHandler, EventSink, LogSink};
use crate::models::InputMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaRecord {
    pub id: String,
    pub question: String,
    pub answer: String,
}

/// Questions from a JSON array of strings, or one per non-empty line.
pub fn parse_questions(content: &str) -> Result<Vec<String>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        let questions: Vec<String> =
            serde_json::from_str(trimmed).context("questions file is not a JSON array of strings")?;
        return Ok(questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect());
    }
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn question_conversation_id(run_id: &str, index: usize) -> String {
    format!("eval-{}-q{:02}", run_id, index + 1)
}

/// Answer every question in its own conversation. A failed question is
/// recorded with the error as its answer.
pub async fn answer_questions(
    handler: &ConversationHandler,
    questions: &[String],
    run_id: &str,
    user_id: &str,
    sink: &dyn EventSink,
) -> Vec<QaRecord> {
    let mut records = Vec::with_capacity(questions.len());
    for (i, question) in questions.iter().enumerate() {
        let id = question_conversation_id(run_id, i);
        let input = InputMessage::new(id.as_str(), user_id, question.as_str());
        let answer = match handler.handle(&input, sink).await {
            Ok(output) => output.message,
            Err(e) => {
                warn!(conversation_id = %id, "question failed: {:#}", e);
                format!("ERROR: {:#}", e)
            }
        };
        records.push(QaRecord {
            id,
            question: question.clone(),
            answer,
        });
    }
    records
}

pub async fn run_eval(config: &Config, questions_file: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let content = std::fs::read_to_string(questions_file)
        .with_context(|| format!("Failed to read {}", questions_file.display()))?;
    let questions = parse_questions(&content)?;
    if questions.is_empty() {
        bail!("No questions in {}", questions_file.display());
    }

    let handler = ConversationHandler::from_config(config)?;
    let run_id = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    info!(questions = questions.len(), %run_id, "evaluation started");

    let records = answer_questions(
        &handler,
        &questions,
        &run_id,
        &config.agent.user_id,
        &LogSink,
    )
    .await;

    let path = match output {
        Some(p) => p.to_path_buf(),
        None => {
            let collection = config.vector_store.collection.as_deref().unwrap_or("default");
            PathBuf::from("tmp").join(format!("qa_{}_{}.json", collection, run_id))
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&records)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let usage = handler.model().usage();
    info!(
        model = handler.model().model_name(),
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "evaluation finished"
    );
    println!("{} answers written to {}", records.len(), path.display());
    Ok(path)
}
