use std::sync::Arc;

use redis::aio::{MultiplexedConnection, PubSub};
use redis::Script;
use redjob_job::JobState;
use tracing::debug;

use crate::errors::Result;

const TRANSITION_LUA: &str = include_str!("lua/transition.lua");
const ATTEMPT_LUA: &str = include_str!("lua/attempt.lua");
const REMOVE_LUA: &str = include_str!("lua/remove.lua");
const RELEASE_LOCK_LUA: &str = include_str!("lua/release_lock.lua");
const WRITE_FIELDS_LUA: &str = include_str!("lua/write_fields.lua");
const LOG_LUA: &str = include_str!("lua/log.lua");
const UPDATE_LUA: &str = include_str!("lua/update.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");

/// Encodes an id as an ordered-set member that sorts in numeric order.
///
/// Members with equal scores are ordered lexicographically by Redis, so the id is prefixed with
/// its zero-padded decimal length: `7` becomes `"01|7"` and `123` becomes `"03|123"`.
pub fn to_sortable_token(id: u64) -> String {
    let id = id.to_string();
    format!("{:02}|{}", id.len(), id)
}

/// Reads the id back out of a sortable token.
pub fn from_sortable_token(token: &str) -> Option<u64> {
    let (_, id) = token.split_once('|')?;
    id.parse().ok()
}

/// Names of every key the queue uses, under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Keys {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Id counter
    pub fn ids(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    pub fn job(&self, id: u64) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    pub fn job_log(&self, id: u64) -> String {
        format!("{}:job:{}:log", self.prefix, id)
    }

    /// Every job, ordered by priority
    pub fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    pub fn jobs_by_state(&self, state: JobState) -> String {
        format!("{}:jobs:{}", self.prefix, state)
    }

    pub fn jobs_by_type(&self, job_type: &str, state: JobState) -> String {
        format!("{}:jobs:{}:{}", self.prefix, job_type, state)
    }

    pub fn job_types(&self) -> String {
        format!("{}:job:types", self.prefix)
    }

    /// Blocking list used to wake the workers of a type. Its values carry no meaning.
    pub fn wake_list(&self, job_type: &str) -> String {
        format!("{}:{}:jobs", self.prefix, job_type)
    }

    pub fn work_time(&self) -> String {
        format!("{}:stats:work-time", self.prefix)
    }

    /// Pub/sub channel carrying job events
    pub fn events(&self) -> String {
        format!("{}:events", self.prefix)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    pub fn search_word(&self, word: &str) -> String {
        format!("{}:search:{}", self.prefix, word)
    }

    /// Words a job has been indexed under
    pub fn search_job(&self, id: u64) -> String {
        format!("{}:search:job:{}", self.prefix, id)
    }
}

/// Lua scripts run by the job commands, loaded once per store.
///
/// Every script writing to a job hash first checks the hash still has its `type`, so a job
/// removed while a worker holds it is never brought back.
pub(crate) struct Scripts {
    pub(crate) transition: Script,
    pub(crate) attempt: Script,
    pub(crate) remove: Script,
    pub(crate) release_lock: Script,
    pub(crate) write_fields: Script,
    pub(crate) log: Script,
    pub(crate) update: Script,
    pub(crate) claim: Script,
}

impl Scripts {
    fn new() -> Self {
        Scripts {
            transition: Script::new(TRANSITION_LUA),
            attempt: Script::new(ATTEMPT_LUA),
            remove: Script::new(REMOVE_LUA),
            release_lock: Script::new(RELEASE_LOCK_LUA),
            write_fields: Script::new(WRITE_FIELDS_LUA),
            log: Script::new(LOG_LUA),
            update: Script::new(UPDATE_LUA),
            claim: Script::new(CLAIM_LUA),
        }
    }
}

/// Redis handles shared by the queue.
///
/// Ordinary commands share one multiplexed connection. Blocking pops and pub/sub each need a
/// connection of their own, handed out by [`Store::blocking_connection`] and [`Store::pubsub`].
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    conn: MultiplexedConnection,
    keys: Keys,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("keys", &self.keys).finish()
    }
}

impl Store {
    /// Opens the shared connection and checks the server answers.
    pub async fn connect(client: redis::Client, prefix: &str) -> Result<Store> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(pong, prefix, "Connected to redis");

        Ok(Store {
            client,
            conn,
            keys: Keys::new(prefix),
            scripts: Arc::new(Scripts::new()),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub(crate) fn scripts(&self) -> &Scripts {
        &self.scripts
    }

    /// A handle on the shared connection. Cloning it is cheap.
    pub fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    /// A fresh connection that may be blocked by `BLPOP` without stalling other commands.
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn pubsub(&self) -> Result<PubSub> {
        Ok(self.client.get_async_pubsub().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_length_prefixed() {
        assert_eq!(to_sortable_token(7), "01|7");
        assert_eq!(to_sortable_token(123), "03|123");
        assert_eq!(to_sortable_token(u64::MAX), "20|18446744073709551615");
    }

    #[test]
    fn tokens_sort_like_their_ids() {
        let mut tokens: Vec<String> = [1000, 9, 10, 99, 100, 1]
            .into_iter()
            .map(to_sortable_token)
            .collect();
        tokens.sort();
        let ids: Vec<u64> = tokens
            .iter()
            .filter_map(|t| from_sortable_token(t))
            .collect();
        assert_eq!(ids, vec![1, 9, 10, 99, 100, 1000]);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert_eq!(from_sortable_token("03|123"), Some(123));
        assert_eq!(from_sortable_token("123"), None);
        assert_eq!(from_sortable_token("02|ab"), None);
    }

    #[test]
    fn keys_are_namespaced() {
        let keys = Keys::new("q");
        assert_eq!(keys.ids(), "q:ids");
        assert_eq!(keys.job(5), "q:job:5");
        assert_eq!(keys.job_log(5), "q:job:5:log");
        assert_eq!(keys.jobs(), "q:jobs");
        assert_eq!(keys.jobs_by_state(JobState::Delayed), "q:jobs:delayed");
        assert_eq!(
            keys.jobs_by_type("email", JobState::Inactive),
            "q:jobs:email:inactive"
        );
        assert_eq!(keys.job_types(), "q:job:types");
        assert_eq!(keys.wake_list("email"), "q:email:jobs");
        assert_eq!(keys.work_time(), "q:stats:work-time");
        assert_eq!(keys.events(), "q:events");
        assert_eq!(keys.lock("promotion"), "q:lock:promotion");
        assert_eq!(keys.search_word("ada"), "q:search:ada");
        assert_eq!(keys.search_job(5), "q:search:job:5");
    }
}
