//! Job commands. Each one is a small set of Redis round-trips keeping the job hash and its
//! indices consistent; multi-key writes go through a MULTI/EXEC pipeline or a Lua script.

mod attempt;
mod claim;
mod get;
mod progress;
mod ranges;
mod remove;
mod save;
pub(crate) mod search;
mod transition;

pub use attempt::{attempt, failed_attempt, Attempt, FailedAttempt};
pub use claim::claim;
pub use get::{get, remove_bad_job};
pub use progress::{log, logs, set_error, set_progress, touch_active, update_fields};
pub use ranges::{
    card, card_by_type, range, range_by_state, range_by_type, state_ids, types, work_time, Order,
};
pub use remove::remove;
pub use save::{assign_id, insert, save, update};
pub use search::search;
pub use transition::{active, complete, delayed, failed, inactive, transition};
