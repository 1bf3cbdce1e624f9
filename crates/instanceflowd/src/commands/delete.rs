use crate::commands::open_store;
use colored::Colorize;
use instanceflow_config::Settings;
use instanceflow_controlplane::{RecordKey, RecordStore, WriteOutcome};

/// Request deletion of a record; a record still holding a finalizer is only marked
pub async fn delete_record(store: &dyn RecordStore, key: &RecordKey) -> anyhow::Result<WriteOutcome> {
    if store.get(key).await?.is_none() {
        anyhow::bail!("record {} not found", key);
    }
    Ok(store.delete(key).await?)
}

pub async fn handle(settings: &Settings, namespace: &str, name: &str) -> anyhow::Result<()> {
    let key = RecordKey::new(namespace, name);
    let store = open_store(settings);

    match delete_record(&store, &key).await? {
        WriteOutcome::Removed => println!("{} {}", key.to_string().cyan(), "deleted".green()),
        WriteOutcome::Stored(_) => {
            println!(
                "{} {}",
                key.to_string().cyan(),
                "deletion requested".yellow()
            );
            println!(
                "{}",
                "  the record is removed once its instance has been terminated".dimmed()
            );
        }
    }
    Ok(())
}
