use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cache::{FalseAssertionCache, JsonStore, TextStore};
use crate::cli::StatusArgs;
use crate::model::PipelineRunManifest;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| args.data_dir.join("output"));
    let false_assertions_file = args
        .false_assertions_file
        .clone()
        .unwrap_or_else(|| args.data_dir.join("cells_false_data.json"));
    let manifest_dir = out_dir.join("manifests");

    info!(out_dir = %out_dir.display(), "status requested");

    match latest_manifest(&manifest_dir)? {
        Some(path) => {
            let manifest: PipelineRunManifest = read_json(&path)?;
            info!(
                path = %path.display(),
                run_id = %manifest.run_id,
                status = %manifest.status,
                started_at = %manifest.started_at,
                updated_at = %manifest.updated_at,
                completed_stages = %manifest.completed_stages.join(","),
                failed_stage = %manifest.failed_stage.unwrap_or_default(),
                failure_reason = %manifest.failure_reason.unwrap_or_default(),
                seed = manifest.seed,
                definitions = manifest.counts.definitions_loaded,
                mutated = manifest.counts.mutated_test_cases,
                report_rows = manifest.counts.report_rows,
                skipped_terms = manifest.counts.skipped_terms,
                "loaded latest run manifest"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no run manifest found"),
    }

    let raw_results = TextStore::new(out_dir.join("paperqa"), "txt").len()?;
    let structured_results = JsonStore::new(out_dir.join("structured")).len()?;
    info!(raw_results, structured_results, "cached validation artifacts");

    if false_assertions_file.is_file() {
        let cache = FalseAssertionCache::load(&false_assertions_file)?;
        if cache.is_empty() {
            warn!(path = %false_assertions_file.display(), "false-assertion cache holds no records");
        }
        info!(
            path = %false_assertions_file.display(),
            records = cache.len(),
            "false-assertion cache"
        );
    } else {
        warn!(path = %false_assertions_file.display(), "false-assertion cache missing");
    }

    Ok(())
}

/// Run manifests carry a compact UTC timestamp, so the greatest file name is
/// the most recent run.
pub fn latest_manifest(manifest_dir: &Path) -> Result<Option<PathBuf>> {
    if !manifest_dir.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<PathBuf> = None;
    let entries = fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", manifest_dir.display()))?
            .path();
        let is_manifest = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("pipeline_run_") && name.ends_with(".json"));
        if is_manifest && latest.as_ref().is_none_or(|current| path > *current) {
            latest = Some(path);
        }
    }

    Ok(latest)
}
