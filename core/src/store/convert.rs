use super::MetadataStore;
use crate::Result;
use tracing::info;

/// Copies every record of `from` into `to`. Returns how many were copied.
pub fn convert(from: &dyn MetadataStore, to: &dyn MetadataStore) -> Result<usize> {
    let backups = from.list()?;
    for backup in &backups {
        to.save(backup)?;
    }

    info!(count = backups.len(), "Converted backup records");
    Ok(backups.len())
}
