use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;
    data.push(b'\n');
    write_atomic(path, &data)
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    write_atomic(path, text.as_bytes())
}

/// Writes `data` to a sibling temp file and renames it over `path`, so readers
/// never observe a partially written artifact.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let temp_path = temp_sibling(path);
    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create temp file: {}", temp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("failed to write temp file: {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to flush temp file: {}", temp_path.display()))?;
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("artifact");
    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}.{stamp}.tmp", std::process::id()))
}

static CODE_FENCE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\r?\n?```$"));

/// Removes a surrounding markdown code fence (```` ``` ```` or ```` ```json ````)
/// from a model response. Text without a fence is returned trimmed.
pub fn strip_code_fences(raw: &str) -> Result<String> {
    let pattern = CODE_FENCE
        .as_ref()
        .map_err(Clone::clone)
        .context("failed to compile code fence regex")?;

    let trimmed = raw.trim();
    Ok(match pattern.captures(trimmed).and_then(|captures| captures.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => trimmed.to_string(),
    })
}

pub fn is_blank_cell(value: &str) -> bool {
    let normalized = value.trim();
    normalized.is_empty() || normalized.eq_ignore_ascii_case("nan")
}
