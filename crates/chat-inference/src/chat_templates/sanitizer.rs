//! Response sanitizer
//!
//! Strips leaked control tokens from generated text and decides whether what
//! remains is usable. `sanitize` is idempotent: every pass only deletes
//! characters, and passes repeat until nothing changes.

use crate::memory::{Message, Role};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const STOPPED_PLACEHOLDER: &str = "[Generation stopped by user]";
pub const EMPTY_PLACEHOLDER: &str =
    "[Model generated an empty response. Please try again or use a different model.]";
pub const ARTIFACT_PLACEHOLDER: &str =
    "[Model generated an invalid response with template artifacts. Please try again.]";
pub const UNUSABLE_PLACEHOLDER: &str =
    "[Unable to generate a valid response. Please try again or adjust generation parameters.]";

lazy_static! {
    /// Removal patterns, applied in order. Composite header+role forms come
    /// before the bare tokens so no orphaned role word is left behind.
    static ref ARTIFACT_PATTERNS: Vec<Regex> = [
        // ChatML / Llama 3 / GPT style
        r"(?i)<\|start_header_id\|>\s*(?:system|user|assistant)?\s*<\|end_header_id\|>",
        r"(?i)<\|im_start\|>(?:(?:system|user|assistant)\b)?",
        r"(?i)<\|im_end\|>",
        r"(?i)<\|begin_of_text\|>",
        r"(?i)<\|end_of_text\|>",
        r"(?i)<\|eot_id\|>",
        r"(?i)<\|start_header_id\|>",
        r"(?i)<\|end_header_id\|>",
        r"(?i)<\|endoftext\|>",
        // Llama 2 / Mistral
        r"(?i)</?s>",
        r"(?i)\[/?INST\]",
        r"(?i)<</?SYS>>",
        r"(?i)</?SYS>",
        r"(?i)</?INST>",
        // Phi
        r"(?i)<\|(?:system|user|assistant|end)\|>",
        // Gemma
        r"(?i)<start_of_turn>(?:(?:user|model)\b)?",
        r"(?i)<end_of_turn>",
        r"(?i)<bos>",
        r"(?i)<eos>",
        // Command-R
        r"(?i)<BOS_TOKEN>",
        r"(?i)<\|(?:START|END)_OF_TURN_TOKEN\|>",
        r"(?i)<\|(?:USER|CHATBOT|SYSTEM)_TOKEN\|>",
        // Vicuna / Alpaca role prefixes at line start
        r"(?m)^[ \t]*(?:USER|ASSISTANT):[ \t]*",
        r"(?m)^[ \t]*###[ \t]*(?:Instruction|Input|Response):[ \t]*",
        // Hallucinated control tags such as <ASSISTER>
        r"</?[A-Z]{3,}>",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("artifact pattern"))
    .collect();

    static ref NOISE_LINE: Regex = Regex::new(r"^[\[\]<>/|#]+$").expect("noise pattern");
    static ref SPACE_RUN: Regex = Regex::new(r" {2,}").expect("space pattern");

    static ref ERROR_MARKERS: Vec<Regex> = [
        r"(?i)^\[Model generated",
        r"(?i)^\[Generation stopped",
        r"(?i)^\[Unable to generate",
        r"(?i)^\[NEVER\]",
        r"(?i)^\[ERROR\]",
        r"(?i)^\[FAILED\]",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("marker pattern"))
    .collect();

    /// Delimiters whose presence means the text is not safe to show or re-feed.
    static ref RESIDUAL_DELIMITERS: Vec<Regex> = [
        r"\[/?INST\]",
        r"(?i)</INST>",
        r"<</?SYS>>",
        r"<\|im_start\|>",
        r"<\|im_end\|>",
        r"<\|eot_id\|>",
        r"<start_of_turn>",
        r"<\|START_OF_TURN_TOKEN\|>",
        r"</[A-Z]{3,}>",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("delimiter pattern"))
    .collect();
}

/// Outcome of checking a whole conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub filtered: Vec<Message>,
}

pub struct ResponseSanitizer;

impl ResponseSanitizer {
    /// Removes template artifacts and normalizes whitespace.
    pub fn sanitize(text: &str) -> String {
        let mut current = text.to_string();
        loop {
            let next = Self::sanitize_pass(&current);
            if next == current {
                return next;
            }
            current = next;
        }
    }

    fn sanitize_pass(text: &str) -> String {
        let mut cleaned = text.to_string();
        for pattern in ARTIFACT_PATTERNS.iter() {
            if pattern.is_match(&cleaned) {
                cleaned = pattern.replace_all(&cleaned, "").into_owned();
            }
        }

        let mut lines: Vec<String> = Vec::new();
        for line in cleaned.split('\n') {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                // At most one blank line in a row.
                if lines.last().map_or(false, |l| !l.is_empty()) {
                    lines.push(String::new());
                }
                continue;
            }
            if NOISE_LINE.is_match(trimmed) {
                continue;
            }
            lines.push(collapse_spaces(line.trim_end()));
        }

        lines.join("\n").trim().to_string()
    }

    /// True when `text` is a usable model answer.
    pub fn validate(text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }
        if ERROR_MARKERS.iter().any(|p| p.is_match(trimmed)) {
            return false;
        }
        !Self::has_residual_delimiters(text)
    }

    pub fn has_residual_delimiters(text: &str) -> bool {
        RESIDUAL_DELIMITERS.iter().any(|p| p.is_match(text))
    }

    /// Deterministic placeholder for a response that failed validation.
    pub fn failure_message(raw: &str) -> &'static str {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            EMPTY_PLACEHOLDER
        } else if Self::has_residual_delimiters(trimmed)
            || ERROR_MARKERS.iter().any(|p| p.is_match(trimmed))
        {
            ARTIFACT_PLACEHOLDER
        } else {
            UNUSABLE_PLACEHOLDER
        }
    }

    /// Drops prior assistant turns that would not pass validation.
    pub fn filter_history(messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .filter(|m| m.role != Role::Assistant || Self::validate(&m.content))
            .cloned()
            .collect()
    }

    pub fn history_report(messages: &[Message]) -> HistoryReport {
        let filtered = Self::filter_history(messages);
        HistoryReport {
            total: messages.len(),
            valid: filtered.len(),
            invalid: messages.len() - filtered.len(),
            filtered,
        }
    }
}

/// Collapses interior runs of spaces, leaving leading indentation alone.
fn collapse_spaces(line: &str) -> String {
    let body_start = line
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(line.len());
    let (indent, body) = line.split_at(body_start);
    format!("{}{}", indent, SPACE_RUN.replace_all(body, " "))
}
