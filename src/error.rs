use std::time::Duration;

use thiserror::Error;

/// Failures of a single external call (literature command or agent request).
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with status {status}: {stderr}")]
    ExitStatus {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{what} did not finish within {}s", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("{what} was cancelled")]
    Cancelled { what: String },

    #[error("agent request failed: {0}")]
    Agent(String),
}

impl InvokeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Stage-level conditions that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed false-assertion response for {cl_id}: {reason}")]
    MalformedSeedResponse { cl_id: String, reason: String },

    #[error("validation answer for {cl_id} has no {delimiter:?} delimiter")]
    MissingDelimiter { cl_id: String, delimiter: String },

    #[error("stage {stage} returned transition to {next}, which is not in the stage graph")]
    IllegalTransition { stage: String, next: String },

    #[error("run cancelled before stage {stage}")]
    Cancelled { stage: String },
}
