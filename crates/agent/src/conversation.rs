//! Utterance classification: intent routing, the history-skip heuristic,
//! and action-intent detection.
//!
//! Two normalizers live here and must not be conflated: [`normalize_query`]
//! (lowercase, punctuation stripped) feeds intent matching, while
//! [`normalize_table_terms`] additionally collapses plurals and is used only
//! for table-name detection in the CRM fetch path.

use leadline_core::domain::turn::SourceType;
use leadline_db::repositories::CrmTable;

const GREETING_PHRASES: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hii",
    "hiii",
    "good morning",
    "good afternoon",
    "good evening",
    "morning",
    "afternoon",
    "evening",
    "greetings",
    "greeting",
    "hi there",
    "hello there",
    "hey there",
];

pub const GREETING_RESPONSE: &str = "Hi 👋\nWhat's up? How can I help you today?";

const SEND_EMAIL_PHRASES: &[&str] = &[
    "send email",
    "send mail",
    "send this email",
    "send this mail",
    "email now",
    "mail now",
    "send it",
    "dispatch email",
    "dispatch mail",
    "send the email",
    "send the mail",
];

const FOLLOWUP_PHRASES: &[&str] = &[
    "follow up",
    "followup",
    "pending lead",
    "pending leads",
    "lead to call",
    "leads to call",
    "requiring follow",
    "need follow",
    "due follow",
    "overdue follow",
    "reminder",
    "reminders",
];

const EMAIL_DRAFT_PHRASES: &[&str] = &[
    "draft email",
    "draft mail",
    "write email",
    "write mail",
    "compose email",
    "compose mail",
    "create email",
    "create mail",
    "email draft",
    "mail draft",
    "follow up email",
    "followup email",
    "follow up mail",
    "followup mail",
];

const SUMMARY_PHRASES: &[&str] = &[
    "summary",
    "full summary",
    "activity summary",
    "lead summary",
    "full history",
    "activity history",
    "lead activity",
    "lead history",
    "complete summary",
    "show activity",
];

const LEAD_TERMS: &[&str] = &["lead", "leads", "prospect", "prospects", "customer", "customers"];

const ACTION_KEYWORDS: &[&str] = &[
    "create", "add", "new", "insert", "make", "update", "change", "modify", "edit", "set",
    "delete", "remove", "cancel", "drop",
];

/// Tokens that end a confirmation exchange either way. Matched by substring
/// containment, mirroring the original keyword behavior.
pub const CONFIRMATION_TOKENS: &[&str] =
    &["yes", "confirm", "proceed", "delete", "ok", "okay", "yep", "sure"];

pub const CANCELLATION_TOKENS: &[&str] = &["no", "cancel", "abort"];

/// Lowercase, strip punctuation to spaces, collapse whitespace. No plural
/// handling here.
pub fn normalize_query(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let mut sanitized = String::with_capacity(lowered.len());
    for character in lowered.chars() {
        if character.is_alphanumeric() {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// [`normalize_query`] plus a trailing-`s` collapse for words longer than
/// three characters (`leads` -> `lead`, but `is` stays `is`). Only used for
/// table-name detection.
pub fn normalize_table_terms(text: &str) -> String {
    normalize_query(text)
        .split_whitespace()
        .map(|word| {
            if word.len() > 3 && word.ends_with('s') {
                word[..word.len() - 1].to_string()
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn has_token(normalized: &str, word: &str) -> bool {
    normalized.split_whitespace().any(|token| token == word)
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let padded = format!(" {normalized} ");
    padded.contains(&format!(" {phrase} "))
}

pub fn is_greeting(message: &str) -> bool {
    let normalized = message.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    GREETING_PHRASES
        .iter()
        .any(|phrase| normalized == *phrase || normalized.starts_with(&format!("{phrase} ")))
}

fn detect_send_email(normalized: &str) -> bool {
    let has_phrase = SEND_EMAIL_PHRASES.iter().any(|phrase| contains_phrase(normalized, phrase));
    // "send follow-up email": a send-family token anywhere plus an
    // email/mail token also counts.
    let has_pair = has_token(normalized, "send")
        && (has_token(normalized, "email") || has_token(normalized, "mail"));
    has_phrase || has_pair
}

fn detect_followup(normalized: &str) -> bool {
    // Send takes priority: "send follow-up email" is an action, not a query.
    if has_token(normalized, "send") {
        return false;
    }
    FOLLOWUP_PHRASES.iter().any(|phrase| contains_phrase(normalized, phrase))
}

fn detect_email_draft(normalized: &str) -> bool {
    let has_draft = EMAIL_DRAFT_PHRASES.iter().any(|phrase| contains_phrase(normalized, phrase));
    let has_dispatch = ["send", "dispatch", "now"].iter().any(|word| has_token(normalized, word));
    has_draft && !has_dispatch
}

fn detect_lead_summary(normalized: &str) -> bool {
    let has_summary = SUMMARY_PHRASES.iter().any(|phrase| contains_phrase(normalized, phrase));
    let has_lead_term = LEAD_TERMS.iter().any(|term| has_token(normalized, term));
    if has_summary && has_lead_term {
        return true;
    }

    // "history of lead X" / "summary for lead Y" style patterns.
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    tokens.windows(3).any(|window| {
        matches!(window[0], "history" | "summary" | "activity" | "full")
            && matches!(window[1], "of" | "for")
            && matches!(window[2], "lead" | "leads")
    })
}

/// Maps a raw utterance to its routing tag. Pure, total, never fails:
/// anything that matches nothing is a CRM query, because this assistant has
/// no other domain.
pub fn classify(message: &str) -> SourceType {
    if is_greeting(message) {
        return SourceType::None;
    }

    let normalized = normalize_query(message);
    if detect_send_email(&normalized) {
        SourceType::SendEmail
    } else if detect_followup(&normalized) {
        SourceType::Followup
    } else if detect_email_draft(&normalized) {
        SourceType::EmailDraft
    } else if detect_lead_summary(&normalized) {
        SourceType::LeadSummary
    } else {
        SourceType::Crm
    }
}

const FOLLOW_UP_INDICATORS: &[&str] = &[
    "that", "those", "them", "it", "this", "these", "more", "also", "next", "previous", "above",
    "below", "before", "after", "same", "similar", "other", "another", "different", "related",
    "associated", "connected",
];

const LIST_QUERY_STARTERS: &[&str] =
    &["show", "list", "get", "give", "display", "fetch", "all", "what"];

const CLOSING_PHRASES: &[&str] =
    &["thanks", "thank you", "bye", "goodbye", "see you", "how are you", "whats up", "what s up"];

/// Latency hint only: decides whether loading history is worth it for this
/// query. Getting it wrong must never change the final answer, except that
/// a contextual reference against skipped history fails closed into a
/// disambiguation prompt.
pub fn needs_history(message: &str) -> bool {
    if is_greeting(message) {
        return false;
    }

    let normalized = normalize_query(message);
    if CLOSING_PHRASES
        .iter()
        .any(|phrase| normalized == *phrase || normalized.starts_with(&format!("{phrase} ")))
    {
        return false;
    }

    let first_token = normalized.split_whitespace().next().unwrap_or("");
    let is_simple_list = LIST_QUERY_STARTERS.contains(&first_token);
    let has_follow_up_vocab =
        FOLLOW_UP_INDICATORS.iter().any(|indicator| has_token(&normalized, indicator));

    if is_simple_list && !has_follow_up_vocab {
        return false;
    }

    true
}

/// Whether the user wants to perform a mutating action. While a pending
/// action awaits confirmation, a short confirmation/cancellation reply is
/// NOT a new action.
pub fn detect_action_intent(message: &str, has_pending_action: bool) -> bool {
    if has_pending_action && is_confirmation_reply(message) {
        return false;
    }

    let lowered = message.to_lowercase();
    ACTION_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
}

/// A short reply that answers a confirmation prompt (either way).
pub fn is_confirmation_reply(message: &str) -> bool {
    let lowered = message.trim().to_lowercase();
    if lowered.split_whitespace().count() > 3 {
        return false;
    }
    let reply_tokens = ["y", "go ahead", "do it"];
    CONFIRMATION_TOKENS
        .iter()
        .chain(CANCELLATION_TOKENS.iter())
        .chain(reply_tokens.iter())
        .any(|token| lowered.contains(token))
}

/// Whether the utterance confirms the pending destructive action. Substring
/// containment over the original token list is preserved deliberately; see
/// the design notes on its false-positive potential.
pub fn is_confirmed(message: &str) -> bool {
    let lowered = message.trim().to_lowercase();
    CONFIRMATION_TOKENS.iter().any(|token| lowered.contains(token))
}

/// Table detection for the generic CRM fetch, over the plural-collapsed
/// normalizer. First matching term wins; leads are the default.
pub fn detect_table(message: &str) -> CrmTable {
    let normalized = normalize_table_terms(message);
    normalized
        .split_whitespace()
        .find_map(CrmTable::parse_term)
        .unwrap_or(CrmTable::Leads)
}

const SEARCH_STOPWORDS: &[&str] = &[
    "show", "list", "get", "give", "display", "fetch", "find", "me", "my", "all", "the", "a",
    "an", "of", "for", "in", "on", "with", "what", "are", "is", "crm", "data", "record", "info",
    "detail", "please",
];

/// Residual free-text search term after table words and query scaffolding
/// are removed. `None` means an unfiltered listing.
pub fn extract_search_term(message: &str) -> Option<String> {
    let normalized = normalize_table_terms(message);
    let residual: Vec<&str> = normalized
        .split_whitespace()
        .filter(|token| !SEARCH_STOPWORDS.contains(token))
        .filter(|token| CrmTable::parse_term(token).is_none())
        .collect();

    if residual.is_empty() {
        None
    } else {
        Some(residual.join(" "))
    }
}
