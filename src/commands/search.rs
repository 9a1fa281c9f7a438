use std::collections::BTreeSet;

use redjob_job::Job;

use crate::errors::{RedjobError, Result};
use crate::store::Store;

/// Lower-cased alphanumeric words of `text`, without duplicates.
pub(crate) fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Indexes the searchable text of a saved job under each of its words.
pub(crate) async fn index(store: &Store, job: &Job) -> Result<()> {
    let id = job.id().ok_or(RedjobError::UnsavedJob)?;
    let keys = store.keys();

    let words: BTreeSet<String> = job
        .searchable_text()?
        .iter()
        .flat_map(|text| tokenize(text))
        .collect();
    if words.is_empty() {
        return Ok(());
    }

    let mut pipe = redis::pipe();
    pipe.atomic();
    for word in &words {
        pipe.sadd(keys.search_word(word), id).ignore();
    }
    pipe.sadd(keys.search_job(id), words.iter().collect::<Vec<_>>())
        .ignore();
    pipe.query_async::<()>(&mut store.conn()).await?;
    Ok(())
}

/// Ids of the jobs whose indexed text contains every word of `query`.
pub async fn search(store: &Store, query: &str) -> Result<Vec<u64>> {
    let words = tokenize(query);
    if words.is_empty() {
        return Ok(vec![]);
    }

    let keys: Vec<String> = words
        .iter()
        .map(|word| store.keys().search_word(word))
        .collect();
    let mut ids: Vec<u64> = redis::cmd("SINTER")
        .arg(keys)
        .query_async(&mut store.conn())
        .await?;
    ids.sort_unstable();
    Ok(ids)
}
