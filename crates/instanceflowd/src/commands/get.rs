use crate::commands::open_store;
use colored::Colorize;
use instanceflow_config::Settings;
use instanceflow_controlplane::{InstanceRecord, RecordKey, RecordStore};

pub async fn handle(
    settings: &Settings,
    namespace: &str,
    name: &str,
    output: Option<&str>,
) -> anyhow::Result<()> {
    let key = RecordKey::new(namespace, name);
    let store = open_store(settings);
    let record = store
        .get(&key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("record {} not found", key))?;

    match output {
        Some("json") => println!("{}", serde_json::to_string_pretty(&record)?),
        Some("yaml") => print!("{}", serde_yaml::to_string(&record)?),
        _ => print_summary(&record),
    }
    Ok(())
}

fn print_summary(record: &InstanceRecord) {
    let status = &record.status;
    println!("{}", record.key().to_string().cyan().bold());
    println!("  state:       {}", super::list::colored_state(record));
    println!("  instance:    {}", status.instance_id.as_deref().unwrap_or("-"));
    println!("  image:       {}", record.spec.ami_id);
    println!("  type:        {}", record.spec.instance_type);
    println!("  region:      {}", record.spec.region);
    println!("  public ip:   {}", status.public_ip.as_deref().unwrap_or("-"));
    println!("  private ip:  {}", status.private_ip.as_deref().unwrap_or("-"));
    if let Some(dns) = &status.public_dns {
        println!("  public dns:  {}", dns);
    }
    if let Some(dns) = &status.private_dns {
        println!("  private dns: {}", dns);
    }
    if let Some(error) = &status.last_error {
        println!("  last error:  {}", error.red());
    }
}
