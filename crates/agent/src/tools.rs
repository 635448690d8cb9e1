//! Declarative catalog of the mutating operations the completion service
//! may request, bound to record-store calls.
//!
//! Each descriptor names its parameter schema, required fields, and whether
//! the operation is destructive. Destructive operations never execute
//! without the confirmation protocol in `actions`.

use serde_json::{json, Map, Value};

use leadline_db::repositories::{ColumnKind, CrmRepository, CrmTable, RepositoryError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub kind: ToolKind,
    pub table: CrmTable,
    description: &'static str,
}

impl ToolDescriptor {
    pub fn entity(&self) -> &'static str {
        self.table.entity()
    }

    /// The identifier argument for update/delete calls (`lead_id`, ...).
    pub fn id_field(&self) -> String {
        format!("{}_id", self.entity())
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self.kind, ToolKind::Delete)
    }

    pub fn required_fields(&self) -> Vec<String> {
        match self.kind {
            ToolKind::Create => match self.table {
                CrmTable::Leads => vec!["name".to_string(), "phone".to_string()],
                CrmTable::Campaigns => {
                    vec!["name".to_string(), "status".to_string(), "type".to_string()]
                }
                CrmTable::Tasks => {
                    vec!["subject".to_string(), "priority".to_string(), "status".to_string()]
                }
                CrmTable::Notes => vec!["content".to_string()],
                CrmTable::Emails => {
                    vec!["subject".to_string(), "recipient".to_string(), "sender".to_string()]
                }
            },
            ToolKind::Update | ToolKind::Delete => vec![self.id_field()],
        }
    }

    /// OpenAI-style function schema for this tool.
    pub fn schema(&self) -> Value {
        let mut properties = Map::new();

        if matches!(self.kind, ToolKind::Update | ToolKind::Delete) {
            properties.insert(
                self.id_field(),
                json!({
                    "type": "string",
                    "description": format!("ID of the {} to {}", self.entity(), verb(self.kind)),
                }),
            );
        }

        if !matches!(self.kind, ToolKind::Delete) {
            for column in self.table.columns() {
                if matches!(column.name, "id" | "created_at" | "updated_at") {
                    continue;
                }
                let json_type = match column.kind {
                    ColumnKind::Integer => "integer",
                    ColumnKind::Text => "string",
                };
                properties.insert(
                    column.name.to_string(),
                    json!({"type": json_type, "description": field_description(column.name)}),
                );
            }
        }

        json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": self.required_fields(),
            },
        })
    }
}

fn verb(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::Create => "create",
        ToolKind::Update => "update",
        ToolKind::Delete => "delete",
    }
}

fn field_description(field: &str) -> &'static str {
    match field {
        "name" => "Full name",
        "email" => "Email address",
        "phone" => "Phone number",
        "lead_status" => "Lead status (e.g. 'Not Contacted', 'Contacted', 'Qualified')",
        "lead_stage" => "Stage of the lead (e.g. 'lead', 'opportunity')",
        "lead_source" => "Where the lead came from (e.g. 'Website', 'Referral')",
        "lead_owner" => "Owner of the lead",
        "next_follow_up" => "Next follow-up date, ISO format",
        "status" => "Status value",
        "type" => "Campaign type (e.g. 'Email', 'Webinar')",
        "campaign_owner" => "Owner of the campaign",
        "campaign_date" => "Campaign start date, ISO format",
        "end_date" => "Campaign end date, ISO format",
        "subject" => "Subject line",
        "priority" => "Priority (Low, Medium, High, Urgent)",
        "task_type" => "Type of task (e.g. 'Call', 'Email', 'Follow-up')",
        "due_date" => "Due date, ISO format",
        "lead_id" => "Associated lead ID",
        "content" => "Free-form content",
        "recipient" => "Recipient email address",
        "sender" => "Sender email address",
        "body" => "Message body",
        "description" => "Free-form description",
        _ => "Field value",
    }
}

/// The raw result of a bound record-store call, before the no-fabrication
/// checks in the action executor.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    /// Delete operations: whether any row was actually removed.
    Deleted(bool),
    /// Create/update operations: the returned record, if any.
    Record(Option<Value>),
}

pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl ToolRegistry {
    /// The full catalog: create/update/delete for leads, campaigns, tasks,
    /// and notes.
    pub fn standard() -> Self {
        let entities = [CrmTable::Leads, CrmTable::Campaigns, CrmTable::Tasks, CrmTable::Notes];
        let mut tools = Vec::new();
        for table in entities {
            tools.push(ToolDescriptor {
                name: create_name(table),
                kind: ToolKind::Create,
                table,
                description: create_description(table),
            });
            tools.push(ToolDescriptor {
                name: update_name(table),
                kind: ToolKind::Update,
                table,
                description: update_description(table),
            });
            tools.push(ToolDescriptor {
                name: delete_name(table),
                kind: ToolKind::Delete,
                table,
                description: delete_description(table),
            });
        }
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(ToolDescriptor::schema).collect()
    }

    pub fn is_destructive(&self, name: &str) -> bool {
        self.get(name).map(ToolDescriptor::is_destructive).unwrap_or(false)
    }

    /// Required-field validation before execution. Missing or empty
    /// required arguments are reported by name and nothing executes.
    pub fn validate_call(&self, name: &str, arguments: &Value) -> Result<(), String> {
        let Some(tool) = self.get(name) else {
            return Err(format!("Unknown tool: {name}"));
        };

        let arguments = arguments.as_object().cloned().unwrap_or_default();
        for field in tool.required_fields() {
            let missing = match arguments.get(&field) {
                None | Some(Value::Null) => true,
                Some(Value::String(raw)) => raw.trim().is_empty(),
                Some(_) => false,
            };
            if missing {
                return Err(format!("Missing required parameter: {field}"));
            }
        }
        Ok(())
    }

    /// Executes a validated call against the record store. The outcome is
    /// raw; success-shape checks live in the action executor.
    pub async fn execute(
        &self,
        crm: &dyn CrmRepository,
        name: &str,
        arguments: &Value,
    ) -> Result<ToolOutcome, RepositoryError> {
        let tool = self
            .get(name)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown tool `{name}`")))?;
        let mut fields = arguments.as_object().cloned().unwrap_or_default();

        match tool.kind {
            ToolKind::Create => {
                let rows = crm.insert(tool.table, &fields).await?;
                Ok(ToolOutcome::Record(rows.into_iter().next()))
            }
            ToolKind::Update => {
                let id = take_id(&mut fields, &tool.id_field()).ok_or_else(|| {
                    RepositoryError::Decode(format!("missing `{}`", tool.id_field()))
                })?;
                let rows = crm.update(tool.table, &id, &fields).await?;
                Ok(ToolOutcome::Record(rows.into_iter().next()))
            }
            ToolKind::Delete => {
                let id = take_id(&mut fields, &tool.id_field()).ok_or_else(|| {
                    RepositoryError::Decode(format!("missing `{}`", tool.id_field()))
                })?;
                let rows = crm.delete(tool.table, &id).await?;
                Ok(ToolOutcome::Deleted(!rows.is_empty()))
            }
        }
    }
}

fn take_id(fields: &mut Map<String, Value>, id_field: &str) -> Option<String> {
    match fields.remove(id_field)? {
        Value::String(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn create_name(table: CrmTable) -> &'static str {
    match table {
        CrmTable::Leads => "create_lead",
        CrmTable::Campaigns => "create_campaign",
        CrmTable::Tasks => "create_task",
        CrmTable::Notes => "create_note",
        CrmTable::Emails => "create_email",
    }
}

fn update_name(table: CrmTable) -> &'static str {
    match table {
        CrmTable::Leads => "update_lead",
        CrmTable::Campaigns => "update_campaign",
        CrmTable::Tasks => "update_task",
        CrmTable::Notes => "update_note",
        CrmTable::Emails => "update_email",
    }
}

fn delete_name(table: CrmTable) -> &'static str {
    match table {
        CrmTable::Leads => "delete_lead",
        CrmTable::Campaigns => "delete_campaign",
        CrmTable::Tasks => "delete_task",
        CrmTable::Notes => "delete_note",
        CrmTable::Emails => "delete_email",
    }
}

fn create_description(table: CrmTable) -> &'static str {
    match table {
        CrmTable::Leads => {
            "Create a new lead in the CRM. Use when the user wants to add a lead, prospect, or \
             potential customer."
        }
        CrmTable::Campaigns => "Create a new marketing campaign in the CRM.",
        CrmTable::Tasks => {
            "Create a new task in the CRM. Use for todos, reminders, or follow-up tasks."
        }
        CrmTable::Notes => "Create a new note in the CRM.",
        CrmTable::Emails => "Create a new email record in the CRM.",
    }
}

fn update_description(table: CrmTable) -> &'static str {
    match table {
        CrmTable::Leads => "Update an existing lead's details such as status or contact info.",
        CrmTable::Campaigns => "Update an existing campaign's details.",
        CrmTable::Tasks => "Update an existing task's details.",
        CrmTable::Notes => "Update an existing note's content.",
        CrmTable::Emails => "Update an existing email record.",
    }
}

fn delete_description(table: CrmTable) -> &'static str {
    match table {
        CrmTable::Leads => {
            "Delete a lead from the CRM. This is a destructive action and requires confirmation."
        }
        CrmTable::Campaigns => {
            "Delete a campaign from the CRM. This is a destructive action and requires \
             confirmation."
        }
        CrmTable::Tasks => {
            "Delete a task from the CRM. This is a destructive action and requires confirmation."
        }
        CrmTable::Notes => {
            "Delete a note from the CRM. This is a destructive action and requires confirmation."
        }
        CrmTable::Emails => {
            "Delete an email record from the CRM. This is a destructive action and requires \
             confirmation."
        }
    }
}
