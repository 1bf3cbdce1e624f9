use crate::commands::open_store;
use crate::manifest;
use colored::Colorize;
use instanceflow_config::Settings;
use instanceflow_controlplane::{ControllerError, RecordStore};
use std::path::Path;

#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Unchanged,
}

pub async fn apply_all(store: &dyn RecordStore, path: &Path) -> anyhow::Result<Vec<(String, Applied)>> {
    let manifests = manifest::load(path)?;
    if manifests.is_empty() {
        anyhow::bail!("{} contains no manifests", path.display());
    }

    let mut results = Vec::new();
    for manifest in manifests {
        let key = manifest.key();
        let record = manifest.into_record();
        let outcome = match store.create(record.clone()).await {
            Ok(_) => Applied::Created,
            Err(ControllerError::AlreadyExists(_)) => {
                let existing = store.get(&key).await?;
                match existing {
                    Some(existing) if existing.spec == record.spec => Applied::Unchanged,
                    Some(_) => return Err(ControllerError::ImmutableSpec(key).into()),
                    // removed between the two calls
                    None => {
                        store.create(record).await?;
                        Applied::Created
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };
        results.push((key.to_string(), outcome));
    }
    Ok(results)
}

pub async fn handle(settings: &Settings, file: &Path) -> anyhow::Result<()> {
    let store = open_store(settings);
    for (key, outcome) in apply_all(&store, file).await? {
        match outcome {
            Applied::Created => println!("{} {}", key.cyan(), "created".green()),
            Applied::Unchanged => println!("{} {}", key.cyan(), "unchanged".dimmed()),
        }
    }
    Ok(())
}
