use serde_json::{json, Map, Value};

use crate::repositories::{CrmRepository, CrmTable, RepositoryError};

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Seeds a small, deterministic CRM data set for demos and tests.
pub async fn seed_demo_data<R: CrmRepository + ?Sized>(crm: &R) -> Result<(), RepositoryError> {
    let leads = [
        json!({
            "name": "Asha Rao",
            "email": "asha@example.com",
            "phone": "555-0101",
            "lead_status": "Contacted",
            "lead_source": "Website",
            "lead_owner": "priya",
            "next_follow_up": "2020-01-15T09:00:00+00:00",
        }),
        json!({
            "name": "Ravi Kumar",
            "email": "ravi@example.com",
            "phone": "555-0102",
            "lead_status": "Not Contacted",
            "lead_source": "Referral",
        }),
        json!({
            "name": "Meena Iyer",
            "email": "meena@example.com",
            "phone": "555-0103",
            "lead_status": "Qualified",
            "lead_owner": "priya",
        }),
    ];
    for lead in leads {
        crm.insert(CrmTable::Leads, &fields(lead)).await?;
    }

    crm.insert(
        CrmTable::Campaigns,
        &fields(json!({
            "name": "Spring Webinar",
            "status": "Active",
            "type": "Webinar",
            "campaign_owner": "priya",
        })),
    )
    .await?;

    crm.insert(
        CrmTable::Tasks,
        &fields(json!({
            "subject": "Send pricing deck",
            "priority": "High",
            "status": "Not Started",
            "task_type": "Email",
            "lead_id": 1,
        })),
    )
    .await?;

    crm.insert(
        CrmTable::Notes,
        &fields(json!({"content": "Asked about the enterprise plan", "lead_id": 1})),
    )
    .await?;

    Ok(())
}
