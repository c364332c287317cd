//! Prompt formatter
//!
//! Renders a conversation into the exact prompt text a model family expects.
//! Pure functions; the template decides everything.

use super::template::{PromptSpec, SpecialHandling, Template, CONTENT_PLACEHOLDER, ROLE_PLACEHOLDER};
use crate::memory::{Message, Role};
use serde::{Deserialize, Serialize};

/// Prompt text plus the stop strings that go with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedPrompt {
    pub prompt: String,
    pub stop_tokens: Vec<String>,
}

pub struct PromptFormatter;

impl PromptFormatter {
    /// Render `messages` with `template`. Stop tokens come back verbatim.
    pub fn format(messages: &[Message], template: &Template) -> FormattedPrompt {
        let messages = normalize_messages(messages);
        let spec = &template.prompt;

        let mut prompt = String::with_capacity(256);
        prompt.push_str(&spec.prefix);

        match spec.special_handling {
            SpecialHandling::None => render_turns(&mut prompt, &messages, spec),
            SpecialHandling::SystemFirstUserMerge => render_merged(&mut prompt, &messages, spec),
            SpecialHandling::AlpacaFormat => render_alpaca(&mut prompt, &messages, spec),
            SpecialHandling::T5Concatenate => render_concatenated(&mut prompt, &messages),
        }

        prompt.push_str(&spec.suffix);

        FormattedPrompt {
            prompt,
            stop_tokens: template.stop_tokens.clone(),
        }
    }

    /// Stop tokens of the template followed by caller extras, without duplicates
    /// or empty entries.
    pub fn merge_stop_tokens(template_stops: &[String], extra: &[String]) -> Vec<String> {
        let mut merged: Vec<String> = Vec::with_capacity(template_stops.len() + extra.len());
        for stop in template_stops.iter().chain(extra) {
            if !stop.is_empty() && !merged.contains(stop) {
                merged.push(stop.clone());
            }
        }
        merged
    }
}

/// Drops blank messages and collapses consecutive user turns down to the
/// last one. Content is kept as written.
pub fn normalize_messages(messages: &[Message]) -> Vec<Message> {
    let mut cleaned: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        if msg.content.trim().is_empty() {
            continue;
        }
        if msg.role == Role::User && cleaned.last().map(|m| m.role) == Some(Role::User) {
            cleaned.pop();
        }
        cleaned.push(msg.clone());
    }

    cleaned
}

fn fill(format: &str, content: &str) -> String {
    format.replacen(CONTENT_PLACEHOLDER, content, 1)
}

fn role_format<'a>(spec: &'a PromptSpec, role: Role) -> &'a str {
    match role {
        Role::System => &spec.system_message,
        Role::User => &spec.user_message,
        Role::Assistant => &spec.assistant_message,
    }
}

fn render_message(out: &mut String, msg: &Message, spec: &PromptSpec) {
    let format = role_format(spec, msg.role);
    if !format.is_empty() {
        out.push_str(&fill(format, &msg.content));
    } else if let Some(generic) = spec.message.as_deref() {
        out.push_str(&fill(&generic.replacen(ROLE_PLACEHOLDER, msg.role.as_str(), 1), &msg.content));
    }
}

fn render_turns(out: &mut String, messages: &[Message], spec: &PromptSpec) {
    for msg in messages {
        render_message(out, msg, spec);
    }
}

fn render_merged(out: &mut String, messages: &[Message], spec: &PromptSpec) {
    let system_idx = messages.iter().position(|m| m.role == Role::System);
    let first_turn_idx = messages.iter().position(|m| m.role != Role::System);

    let (system_idx, user_idx) = match (system_idx, first_turn_idx) {
        (Some(s), Some(u)) if messages[u].role == Role::User => (s, u),
        _ => return render_turns(out, messages, spec),
    };

    // The system block opens the user turn; only the tail after the user
    // placeholder closes it.
    out.push_str(&fill(&spec.system_message, &messages[system_idx].content));
    out.push_str(&messages[user_idx].content);
    let closing = spec
        .user_message
        .split_once(CONTENT_PLACEHOLDER)
        .map(|(_, tail)| tail)
        .unwrap_or("");
    out.push_str(closing);

    for (idx, msg) in messages.iter().enumerate() {
        if idx != system_idx && idx != user_idx {
            render_message(out, msg, spec);
        }
    }
}

fn render_alpaca(out: &mut String, messages: &[Message], spec: &PromptSpec) {
    let join = |role: Role| {
        messages
            .iter()
            .filter(|m| m.role == role)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let instruction = join(Role::System);
    let input = join(Role::User);

    if !instruction.is_empty() && !spec.system_message.is_empty() {
        out.push_str(&fill(&spec.system_message, &instruction));
    }
    if !input.is_empty() && !spec.user_message.is_empty() {
        out.push_str(&fill(&spec.user_message, &input));
    }
}

fn render_concatenated(out: &mut String, messages: &[Message]) {
    let joined = messages
        .iter()
        .filter(|m| m.role != Role::Assistant)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    out.push_str(&joined);
}
