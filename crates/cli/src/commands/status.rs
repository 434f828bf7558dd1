//! Status command implementation

use anyhow::Result;
use doc_store::DocumentStore;
use migrator::Migrator;

/// Prints the lock state and the number of history entries per unit.
pub async fn execute<S>(migrator: &Migrator<S>) -> Result<()>
where
    S: DocumentStore + Clone + 'static,
{
    let config = migrator.config();
    let lock = migrator.lock_coordinator()?;

    match lock.state().await? {
        None => println!("lock ({}): not initialized", config.lock_collection),
        Some(state) => {
            println!("lock ({}): {}", config.lock_collection, state.status);
            if let Some(holder) = state.holder {
                println!("  holder:      {holder}");
            }
            if let Some(acquired_at) = state.acquired_at {
                println!("  acquired at: {acquired_at}");
            }
        }
    }

    let history = migrator.history_store()?.load_all().await?;
    let total: usize = history.values().map(Vec::len).sum();
    println!("history ({}): {total} entries", config.history_collection);
    for (unit, entries) in &history {
        let latest = entries
            .first()
            .map(|entry| entry.timestamp.to_rfc3339())
            .unwrap_or_default();
        println!("  {unit:<32} {:>5}  last applied {latest}", entries.len());
    }

    Ok(())
}
