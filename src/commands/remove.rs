use crate::errors::{RedjobError, Result};
use crate::events::{publish, JobEvent};
use crate::store::{to_sortable_token, Store};

/// Deletes job `id` with its log, search entries and every index entry.
///
/// Removing an id that no longer exists fails with [`RedjobError::JobNotFound`] and changes
/// nothing.
#[tracing::instrument(skip(store), err)]
pub async fn remove(store: &Store, id: u64) -> Result<()> {
    let removed: i64 = store
        .scripts()
        .remove
        .arg(store.keys().prefix())
        .arg(id)
        .arg(to_sortable_token(id))
        .invoke_async(&mut store.conn())
        .await?;

    if removed == 0 {
        return Err(RedjobError::JobNotFound(id));
    }

    publish(store, id, JobEvent::Remove, vec![]).await
}

