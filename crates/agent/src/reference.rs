//! Contextual reference resolution: "the first one", "that lead", "tell me
//! about it" resolved against the numbered list in the previous assistant
//! reply.
//!
//! Resolution fails closed: a missing prior message, an unparseable list,
//! or an out-of-range position all return `None`, and the caller must ask
//! the user to disambiguate rather than guess.

use leadline_core::domain::history::{HistoryMessage, Role};

use crate::conversation::normalize_query;

/// Position extracted from the utterance. `Last` indexes from the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferencePosition {
    Index(usize),
    Last,
}

const ORDINALS: &[(&str, usize)] = &[
    ("first", 0),
    ("second", 1),
    ("third", 2),
    ("fourth", 3),
    ("fifth", 4),
    ("sixth", 5),
    ("seventh", 6),
    ("eighth", 7),
    ("ninth", 8),
    ("tenth", 9),
];

const DEMONSTRATIVE_PHRASES: &[&str] = &[
    "that lead",
    "this lead",
    "that one",
    "this one",
    "that prospect",
    "this prospect",
    "that record",
    "this record",
];

const PRONOUN_ACTION_VERBS: &[&str] =
    &["tell", "show", "about", "describe", "give", "explain", "what", "details", "open"];

fn has_token(normalized: &str, word: &str) -> bool {
    normalized.split_whitespace().any(|token| token == word)
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    format!(" {normalized} ").contains(&format!(" {phrase} "))
}

/// Detects a positional or pronoun reference in the utterance.
pub fn detect_reference(message: &str) -> Option<ReferencePosition> {
    let normalized = normalize_query(message);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    for (index, token) in tokens.iter().enumerate() {
        if let Some((_, position)) = ORDINALS.iter().find(|(word, _)| word == token) {
            let followed_by_one = tokens.get(index + 1).map(|next| *next == "one").unwrap_or(false);
            let preceded_by_the = index > 0 && tokens[index - 1] == "the";
            let mentions_lead = has_token(&normalized, "lead") || has_token(&normalized, "leads");
            if followed_by_one || preceded_by_the || mentions_lead {
                return Some(ReferencePosition::Index(*position));
            }
        }

        if *token == "last" {
            let followed_by_one = tokens.get(index + 1).map(|next| *next == "one").unwrap_or(false);
            let mentions_lead = has_token(&normalized, "lead") || has_token(&normalized, "leads");
            if followed_by_one || mentions_lead {
                return Some(ReferencePosition::Last);
            }
        }
    }

    if DEMONSTRATIVE_PHRASES.iter().any(|phrase| contains_phrase(&normalized, phrase)) {
        return Some(ReferencePosition::Index(0));
    }

    // Bare pronouns count only next to an action verb ("tell me about it").
    let has_pronoun = has_token(&normalized, "it") || has_token(&normalized, "them");
    let has_action_verb = PRONOUN_ACTION_VERBS.iter().any(|verb| has_token(&normalized, verb));
    if has_pronoun && has_action_verb {
        return Some(ReferencePosition::Index(0));
    }

    None
}

/// One entry extracted from a rendered numbered list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListItem {
    pub name: String,
    pub id: Option<i64>,
}

fn parse_id_annotation(line: &str) -> Option<i64> {
    let lowered = line.to_lowercase();
    let position = lowered.find("id:")?;
    let digits: String = lowered[position + 3..]
        .chars()
        .skip_while(|character| character.is_whitespace())
        .take_while(|character| character.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn parse_numbered_line(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let digits: String = trimmed.chars().take_while(|character| character.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = trimmed[digits.len()..].strip_prefix('.')?;
    Some(rest.trim().to_string())
}

/// Parses an assistant reply as a numbered list. Lines matching `N. text`
/// start an item; later unnumbered lines belonging to the same item may
/// carry an `ID: <n>` annotation.
pub fn parse_numbered_list(text: &str) -> Vec<ListItem> {
    let mut items: Vec<ListItem> = Vec::new();

    for line in text.lines() {
        if let Some(mut name) = parse_numbered_line(line) {
            let id = parse_id_annotation(&name);
            if let Some(position) = name.to_lowercase().find("(id:") {
                name.truncate(position);
            }
            items.push(ListItem { name: name.trim().to_string(), id });
        } else if let Some(current) = items.last_mut() {
            if current.id.is_none() {
                current.id = parse_id_annotation(line);
            }
        }
    }

    items
}

/// Resolves a reference in `message` against the most recent
/// assistant-rendered list, preferring the numeric id over the name.
pub fn resolve(message: &str, history: &[HistoryMessage]) -> Option<String> {
    let position = detect_reference(message)?;

    let last_assistant =
        history.iter().rev().find(|entry| entry.role == Role::Assistant)?;
    let items = parse_numbered_list(&last_assistant.content);
    if items.is_empty() {
        return None;
    }

    let index = match position {
        ReferencePosition::Index(index) => index,
        ReferencePosition::Last => items.len() - 1,
    };
    let item = items.get(index)?;

    match item.id {
        Some(id) => Some(id.to_string()),
        None if !item.name.is_empty() => Some(item.name.clone()),
        None => None,
    }
}
