//! History command implementation

use anyhow::{Result, bail};
use doc_store::DocumentStore;
use migrator::{HistoryEntry, Migrator};

use crate::cli::HistoryArgs;

/// Lists history entries, newest first within each unit.
pub async fn execute<S>(args: &HistoryArgs, migrator: &Migrator<S>) -> Result<()>
where
    S: DocumentStore + Clone + 'static,
{
    let mut history = migrator.history_store()?.load_all().await?;

    if let Some(unit) = &args.unit {
        let Some(entries) = history.remove(unit) else {
            bail!("no history recorded for unit {unit}");
        };
        history.clear();
        history.insert(unit.clone(), entries);
    }

    let entries: Vec<&HistoryEntry> = history.values().flatten().collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("no history entries");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{:<25} {:<24} {:<16} {} ({} rollback commands)",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.unit_name,
            entry.change_id,
            entry.author,
            entry.rollback_commands.len()
        );
    }
    Ok(())
}
