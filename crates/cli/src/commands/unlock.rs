//! Unlock command implementation

use anyhow::Result;
use doc_store::DocumentStore;
use migrator::Migrator;

/// Releases the migration lock regardless of its holder.
pub async fn execute<S>(migrator: &Migrator<S>) -> Result<()>
where
    S: DocumentStore + Clone + 'static,
{
    let lock = migrator.lock_coordinator()?;
    let previous = lock.state().await?.and_then(|state| state.holder);

    if lock.force_release().await? {
        match previous {
            Some(holder) => println!("released lock held by {holder}"),
            None => println!("released lock"),
        }
    } else {
        println!("lock was not held, nothing to do");
    }
    Ok(())
}
