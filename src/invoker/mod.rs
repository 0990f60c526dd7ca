use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::InvokeError;

mod agent;
mod command;

pub use agent::{AgentSettings, DEFAULT_AGENT_BASE_URL, DEFAULT_AGENT_MODEL, OpenAiAgent};
pub use command::CommandLiteratureTool;

/// Shared flag checked by every external call; tripped by Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Retrieval-augmented query tool over a per-term literature directory.
pub trait LiteratureTool {
    fn index(&self, literature_dir: &Path, cancel: &CancelToken) -> Result<(), InvokeError>;

    fn ask(
        &self,
        literature_dir: &Path,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<String, InvokeError>;
}

/// LLM-backed prompt call returning the model's text output.
pub trait Agent {
    fn run(&self, prompt: &str, cancel: &CancelToken) -> Result<String, InvokeError>;
}
