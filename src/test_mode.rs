use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use redjob_job::Job;

/// Captures the jobs saved through [`crate::QueueUtils`] so that producer code can be tested
/// without a worker.
///
/// Once entered, saved jobs are recorded in memory and nothing reaches Redis; ids come from a
/// local counter. Entered with `process`, jobs are recorded and saved as usual. The promotion
/// and stalled loops of a queue skip their ticks while test mode is on.
#[derive(Debug, Default)]
pub struct TestMode {
    state: Mutex<TestModeState>,
}

#[derive(Debug, Default)]
struct TestModeState {
    active: bool,
    process: bool,
    jobs: Vec<Job>,
    last_id: u64,
}

/// What a save should do under the current test mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Capture {
    Off,
    /// Record the job, write nothing
    Record,
    /// Save the job, then record it
    RecordAndSave,
}

impl TestMode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts recording saved jobs. With `process`, they are also saved and processed.
    pub fn enter(&self, process: bool) {
        let mut state = self.lock();
        state.active = true;
        state.process = process;
    }

    /// Stops recording. Jobs recorded so far stay available until [`TestMode::clear`].
    pub fn exit(&self) {
        let mut state = self.lock();
        state.active = false;
        state.process = false;
    }

    /// Forgets the recorded jobs.
    pub fn clear(&self) {
        self.lock().jobs.clear();
    }

    /// The recorded jobs, in the order they were first saved.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub(crate) fn capture(&self) -> Capture {
        let state = self.lock();
        match (state.active, state.process) {
            (false, _) => Capture::Off,
            (true, false) => Capture::Record,
            (true, true) => Capture::RecordAndSave,
        }
    }

    /// Does in memory what a save does in Redis: id, creation time, initial state and
    /// promotion time. Returns the id.
    pub(crate) fn save(&self, job: &mut Job) -> u64 {
        let mut state = self.lock();
        let now = Utc::now();

        let id = match *job.id() {
            Some(id) => id,
            None => {
                state.last_id += 1;
                job.set_id(Some(state.last_id));
                job.set_created_at(Some(now));
                state.last_id
            }
        };
        if job.state().is_none() {
            job.set_state(Some(job.initial_state()));
        }
        job.set_updated_at(Some(now));
        job.set_promote_at(job.compute_promote_at());

        upsert(&mut state.jobs, job);
        id
    }

    /// Keeps the recorded copy of `job` in line with a saved job.
    pub(crate) fn record(&self, job: &Job) {
        upsert(&mut self.lock().jobs, job);
    }

    fn lock(&self) -> MutexGuard<'_, TestModeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn upsert(jobs: &mut Vec<Job>, job: &Job) {
    match jobs.iter_mut().find(|recorded| recorded.id() == job.id()) {
        Some(recorded) => *recorded = job.clone(),
        None => jobs.push(job.clone()),
    }
}

#[cfg(test)]
mod tests {
    use redjob_job::JobState;
    use serde_json::json;

    use super::*;

    fn job(job_type: &str) -> Job {
        Job::builder()
            .job_type(job_type)
            .data(json!({ "foo": "bar" }))
            .build()
    }

    #[test]
    fn captures_nothing_until_entered() {
        let test_mode = TestMode::new();
        assert_eq!(test_mode.capture(), Capture::Off);
        assert!(!test_mode.is_active());

        test_mode.enter(false);
        assert_eq!(test_mode.capture(), Capture::Record);
        test_mode.enter(true);
        assert_eq!(test_mode.capture(), Capture::RecordAndSave);

        test_mode.exit();
        assert_eq!(test_mode.capture(), Capture::Off);
    }

    #[test]
    fn saved_jobs_are_recorded_with_local_ids() {
        let test_mode = TestMode::new();
        test_mode.enter(false);

        let mut first = job("email");
        let mut second = job("report");
        assert_eq!(test_mode.save(&mut first), 1);
        assert_eq!(test_mode.save(&mut second), 2);

        assert_eq!(*first.state(), Some(JobState::Inactive));
        assert!(first.created_at().is_some());

        let jobs = test_mode.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_type(), "email");
        assert_eq!(jobs[0].data(), &json!({ "foo": "bar" }));
        assert_eq!(jobs[1].job_type(), "report");
    }

    #[test]
    fn saving_again_replaces_the_recorded_job() {
        let test_mode = TestMode::new();
        test_mode.enter(false);

        let mut job = job("email");
        let id = test_mode.save(&mut job);
        job.set_priority(-10);
        assert_eq!(test_mode.save(&mut job), id);

        let jobs = test_mode.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(*jobs[0].priority(), -10);
    }

    #[test]
    fn clear_forgets_jobs_but_keeps_counting() {
        let test_mode = TestMode::new();
        test_mode.enter(false);
        test_mode.save(&mut job("email"));
        test_mode.clear();
        assert!(test_mode.jobs().is_empty());

        assert_eq!(test_mode.save(&mut job("email")), 2);
    }
}
