use serde_json::Value;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RunTaskError {
    /// The handler panicked, with the panic message when it was a string
    TaskPanic(String),
    /// The run was cancelled before the handler returned
    TaskAborted,
    TaskError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnTaskResult {
    pub duration: std::time::Duration,
    pub result: Result<Option<Value>, RunTaskError>,
}

impl SpawnTaskResult {
    pub fn duration(&self) -> std::time::Duration {
        self.duration
    }

    pub fn result(&self) -> &Result<Option<Value>, RunTaskError> {
        &self.result
    }
}

impl RunTaskError {
    pub fn is_panic(&self) -> bool {
        matches!(self, RunTaskError::TaskPanic(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunTaskError::TaskAborted)
    }

    pub fn is_task_error(&self) -> bool {
        matches!(self, RunTaskError::TaskError(_))
    }
}
