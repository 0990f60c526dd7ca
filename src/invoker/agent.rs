use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::debug;

use super::{Agent, CancelToken};
use crate::error::InvokeError;

pub const DEFAULT_AGENT_MODEL: &str = "gpt-4o-2024-11-20";
pub const DEFAULT_AGENT_BASE_URL: &str = "https://api.openai.com/v1";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CELL_SYSTEM_PROMPT: &str = "You are an AI assistant that helps Cell Ontology curators. \
Follow the requested output format exactly and do not add commentary.";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Agent backed by an OpenAI-compatible `chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiAgent {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiAgent {
    pub fn new(settings: AgentSettings) -> Self {
        let base = settings.base_url.trim().trim_end_matches('/');
        let base = if base.is_empty() {
            DEFAULT_AGENT_BASE_URL
        } else {
            base
        };
        Self {
            endpoint: format!("{base}/chat/completions"),
            model: settings.model,
            api_key: settings.api_key.filter(|key| !key.trim().is_empty()),
            timeout: settings.timeout,
        }
    }

    fn request_payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": CELL_SYSTEM_PROMPT },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.2
        })
    }
}

impl Agent for OpenAiAgent {
    fn run(&self, prompt: &str, cancel: &CancelToken) -> Result<String, InvokeError> {
        let what = format!("agent call to {}", self.endpoint);
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled { what });
        }

        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let payload = self.request_payload(prompt);
        let timeout = self.timeout;

        // request runs on a worker; this thread watches the deadline and token
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let _ = sender.send(post_chat_completion(&endpoint, api_key.as_deref(), &payload, timeout));
        });

        let started = Instant::now();
        loop {
            match receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(result) => {
                    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "agent call finished");
                    return result.map_err(|err| match err {
                        RequestFailure::TimedOut => InvokeError::Timeout {
                            what: what.clone(),
                            after: timeout,
                        },
                        RequestFailure::Other(message) => InvokeError::Agent(message),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(InvokeError::Agent(
                        "agent worker exited without a response".to_string(),
                    ));
                }
            }

            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled { what });
            }
            if started.elapsed() >= timeout {
                return Err(InvokeError::Timeout {
                    what,
                    after: timeout,
                });
            }
        }
    }
}

enum RequestFailure {
    TimedOut,
    Other(String),
}

fn post_chat_completion(
    endpoint: &str,
    api_key: Option<&str>,
    payload: &Value,
    timeout: Duration,
) -> Result<String, RequestFailure> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RequestFailure::Other(format!("could not build HTTP client: {e}")))?;

    let mut request = client
        .post(endpoint)
        .header("Content-Type", "application/json");
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request.json(payload).send().map_err(|e| {
        if e.is_timeout() {
            RequestFailure::TimedOut
        } else {
            RequestFailure::Other(format!("request to {endpoint} failed: {e}"))
        }
    })?;

    let status = response.status();
    let body = response
        .text()
        .map_err(|e| RequestFailure::Other(format!("could not read response body: {e}")))?;
    if !status.is_success() {
        return Err(RequestFailure::Other(format!(
            "API error (status={status}): {}",
            body.trim()
        )));
    }

    let response_json = serde_json::from_str::<Value>(&body)
        .map_err(|e| RequestFailure::Other(format!("API returned invalid JSON: {e}")))?;
    extract_chat_completion_text(&response_json).ok_or_else(|| {
        RequestFailure::Other(
            "response did not contain choices[0].message.content".to_string(),
        )
    })
}

fn extract_chat_completion_text(response_json: &Value) -> Option<String> {
    let message = response_json.get("choices")?.as_array()?.first()?.get("message")?;

    if let Some(content) = message.get("content").and_then(Value::as_str) {
        let trimmed = content.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }

    let collected = message
        .get("content")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!collected.is_empty()).then_some(collected)
}
