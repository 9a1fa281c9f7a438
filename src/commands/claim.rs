use chrono::Utc;
use tracing::trace;

use crate::errors::Result;
use crate::store::{from_sortable_token, Store};

/// Takes the lowest scored ready job of `job_type` and makes it active for `worker_id`.
///
/// One script pops the job from the ready set, moves it into the active indices and stamps
/// `started_at` and `workerId`, so a claimed job is never out of every index. `None` means
/// another worker won the race or the wake-up was spurious.
pub async fn claim(store: &Store, job_type: &str, worker_id: &str) -> Result<Option<u64>> {
    let token: Option<String> = store
        .scripts()
        .claim
        .arg(store.keys().prefix())
        .arg(job_type)
        .arg(worker_id)
        .arg(Utc::now().timestamp_millis())
        .invoke_async(&mut store.conn())
        .await?;

    let id = token.as_deref().and_then(from_sortable_token);
    trace!(job_type, worker_id, job_id = id, "Claim attempt");
    Ok(id)
}
