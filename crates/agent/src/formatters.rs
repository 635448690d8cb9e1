//! Deterministic response rendering for the routes that bypass the
//! completion service, plus the fallback phrasing of action results.
//!
//! These formatters only restate data fetched from the record store; they
//! never invent identifiers or records.

use std::sync::OnceLock;

use serde_json::Value;
use tera::{Context, Tera};

use leadline_core::domain::turn::{ActionResult, ActionStatus};
use leadline_db::repositories::LeadActivity;

fn field<'a>(record: &'a Value, name: &str) -> Option<&'a str> {
    record.get(name).and_then(Value::as_str).filter(|value| !value.trim().is_empty())
}

fn date_only(raw: &str) -> &str {
    raw.split('T').next().unwrap_or(raw)
}

/// Renders the leads-requiring-follow-up list as a numbered list. Each item
/// carries an `ID:` annotation so a later turn can refer back by position.
pub fn format_followup_leads(leads: &[Value]) -> String {
    if leads.is_empty() {
        return "No leads require follow-up today.".to_string();
    }

    let mut lines = vec!["Here are the leads requiring follow-up today:".to_string(), String::new()];

    for (index, lead) in leads.iter().enumerate() {
        let name = field(lead, "name").unwrap_or("N/A");
        lines.push(format!("{}. {}", index + 1, name));
        lines.push(format!("   Phone: {}", field(lead, "phone").unwrap_or("N/A")));
        if let Some(email) = field(lead, "email") {
            lines.push(format!("   Email: {email}"));
        }
        lines.push(format!("   Status: {}", field(lead, "lead_status").unwrap_or("N/A")));
        lines.push(format!(
            "   Follow-Up: {}",
            field(lead, "next_follow_up").map(date_only).unwrap_or("N/A")
        ));
        if let Some(owner) = field(lead, "lead_owner") {
            lines.push(format!("   Owner: {owner}"));
        }
        if let Some(id) = lead.get("id").and_then(Value::as_i64) {
            lines.push(format!("   ID: {id}"));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Renders the lead activity summary.
pub fn format_lead_summary(lead: &Value, activity: &LeadActivity) -> String {
    let name = field(lead, "name").unwrap_or("Unknown lead");
    let mut lines = vec![format!("Summary for lead {name}:")];

    if let Some(id) = lead.get("id").and_then(Value::as_i64) {
        lines.push(format!("ID: {id}"));
    }
    if let Some(status) = field(lead, "lead_status") {
        lines.push(format!("Status: {status}"));
    }
    if let Some(phone) = field(lead, "phone") {
        lines.push(format!("Phone: {phone}"));
    }
    if let Some(email) = field(lead, "email") {
        lines.push(format!("Email: {email}"));
    }
    if let Some(owner) = field(lead, "lead_owner") {
        lines.push(format!("Owner: {owner}"));
    }
    if let Some(follow_up) = field(lead, "next_follow_up") {
        lines.push(format!("Next follow-up: {}", date_only(follow_up)));
    }

    lines.push(String::new());
    lines.push(format!(
        "Activity: {} tasks, {} notes, {} emails",
        activity.tasks.len(),
        activity.notes.len(),
        activity.emails.len()
    ));

    let mut recent: Vec<(&str, &Value)> = Vec::new();
    recent.extend(activity.tasks.iter().map(|task| ("Task", task)));
    recent.extend(activity.notes.iter().map(|note| ("Note", note)));
    recent.extend(activity.emails.iter().map(|email| ("Email", email)));
    recent.sort_by(|left, right| {
        let left_date = field(left.1, "created_at").unwrap_or("");
        let right_date = field(right.1, "created_at").unwrap_or("");
        right_date.cmp(left_date)
    });

    if !recent.is_empty() {
        lines.push(String::new());
        lines.push("Recent activity:".to_string());
        for (kind, record) in recent.iter().take(5) {
            let label = field(record, "subject")
                .or_else(|| field(record, "content"))
                .unwrap_or("(no detail)");
            let date = field(record, "created_at").map(date_only).unwrap_or("unknown date");
            lines.push(format!("- {kind} ({date}): {label}"));
        }
    }

    lines.join("\n")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

const EMAIL_SUBJECT_TEMPLATE: &str = "Following up, {{ lead_name }}";

const EMAIL_BODY_TEMPLATE: &str = "\
Hi {{ lead_name }},

I wanted to follow up on our recent conversation{% if next_follow_up %} ahead of \
{{ next_follow_up }}{% endif %}. \
{% if lead_status %}I see you're currently marked as \"{{ lead_status }}\" with us. {% endif %}\
Is there anything I can help clarify, or a good time this week for a quick call?

Best regards,
{{ sender_name }}";

fn email_templates() -> &'static Tera {
    static TERA: OnceLock<Tera> = OnceLock::new();
    TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template("email_subject", EMAIL_SUBJECT_TEMPLATE)
            .and_then(|_| tera.add_raw_template("email_body", EMAIL_BODY_TEMPLATE))
            .unwrap_or_else(|error| panic!("email templates failed to parse: {error}"));
        tera
    })
}

/// Renders a professional follow-up draft from lead context. No database
/// writes happen here.
pub fn render_email_draft(lead: &Value, sender_name: &str) -> Result<EmailDraft, tera::Error> {
    let mut context = Context::new();
    context.insert("lead_name", field(lead, "name").unwrap_or("there"));
    context.insert("lead_status", &field(lead, "lead_status"));
    context.insert("next_follow_up", &field(lead, "next_follow_up").map(date_only));
    context.insert("sender_name", sender_name);

    let tera = email_templates();
    Ok(EmailDraft {
        subject: tera.render("email_subject", &context)?,
        body: tera.render("email_body", &context)?,
    })
}

fn humanize_tool_name(tool_name: &str) -> String {
    let mut words: Vec<String> = tool_name
        .split('_')
        .map(|word| {
            let mut characters = word.chars();
            match characters.next() {
                Some(first) => first.to_uppercase().collect::<String>() + characters.as_str(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        words.push("Action".to_string());
    }
    words.join(" ")
}

/// Deterministic phrasing of action results. Only identifiers that came
/// back from the record store are mentioned; a success without one is
/// reported as a failure.
pub fn format_action_results(results: &[ActionResult]) -> String {
    let mut lines = Vec::new();

    for result in results {
        let action_name = humanize_tool_name(&result.tool_name);
        match result.status {
            ActionStatus::Success => {
                let record = result.result.as_ref();
                let deleted = record
                    .and_then(|value| value.get("deleted"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if deleted {
                    lines.push(format!("Successfully completed {action_name}."));
                    continue;
                }

                let id = record.and_then(|value| value.get("id")).and_then(|value| match value {
                    Value::Number(number) => Some(number.to_string()),
                    Value::String(raw) if !raw.is_empty() => Some(raw.clone()),
                    _ => None,
                });
                match id {
                    Some(id) => {
                        let name = record.and_then(|value| {
                            field(value, "name")
                                .or_else(|| field(value, "subject"))
                                .or_else(|| field(value, "title"))
                        });
                        match name {
                            Some(name) => lines
                                .push(format!("Successfully {action_name}: {name} (ID: {id})")),
                            None => {
                                lines.push(format!("Successfully completed {action_name} (ID: {id})"))
                            }
                        }
                    }
                    None => lines.push(format!(
                        "{action_name} failed - no record returned from the database"
                    )),
                }
            }
            ActionStatus::Cancelled => lines.push("Action was cancelled.".to_string()),
            ActionStatus::Error => {
                let error = result.error.as_deref().unwrap_or("Unknown error");
                lines.push(format!("Error: {error}"));
            }
        }
    }

    if lines.is_empty() {
        "Action completed.".to_string()
    } else {
        lines.join("\n")
    }
}
