use crate::commands::open_store;
use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use instanceflow_config::Settings;
use instanceflow_controlplane::{InstanceRecord, LifecycleState, RecordStore};

pub async fn handle(settings: &Settings) -> anyhow::Result<()> {
    let store = open_store(settings);
    let records = store.list().await?;

    if records.is_empty() {
        println!("{}", "No records".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<12} {:<24} {:<14} {:<22} {:<16} {:<6}",
            "NAMESPACE", "NAME", "STATE", "INSTANCE", "PUBLIC-IP", "AGE"
        )
        .bold()
    );
    println!("{}", "─".repeat(98).dimmed());

    let now = Utc::now();
    for record in &records {
        println!(
            "{:<12} {:<24} {:<14} {:<22} {:<16} {:<6}",
            record.metadata.namespace,
            record.metadata.name,
            colored_state(record),
            record.status.instance_id.as_deref().unwrap_or("-"),
            record.status.public_ip.as_deref().unwrap_or("-"),
            age(record.metadata.creation_timestamp, now),
        );
    }
    Ok(())
}

pub(crate) fn colored_state(record: &InstanceRecord) -> ColoredString {
    let label = if record.metadata.is_deleting() && record.status.state != LifecycleState::Terminating {
        "deleting".to_string()
    } else {
        record.status.state.to_string()
    };
    // pad before coloring so escape codes do not break the column width
    let label = format!("{:<14}", label);
    if record.status.last_error.is_some() {
        return label.red();
    }
    match record.status.state {
        LifecycleState::Running => label.green(),
        LifecycleState::Provisioning | LifecycleState::Terminating => label.yellow(),
        LifecycleState::Unprovisioned | LifecycleState::Terminated => label.dimmed(),
    }
}

fn age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(created) = created else {
        return "-".to_string();
    };
    let secs = (now - created).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
