use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::prompts::validation_prompt;
use super::{RunContext, RunState, Stage, Transition};
use crate::error::PipelineError;
use crate::model::{TestCase, ValidationRun};

pub fn run(ctx: &mut RunContext<'_>, state: &mut RunState) -> Result<Transition> {
    let mut runs = Vec::with_capacity(state.test_cases.len());
    for test_case in &state.test_cases {
        let result = validate_test_case(ctx, test_case)?;
        runs.push(ValidationRun {
            test_case: test_case.clone(),
            result,
        });
    }

    info!(validation_runs = runs.len(), "validated assertions");
    ctx.counts.validation_runs = runs.len();
    state.validation_runs.extend(runs);
    Ok(Transition::Next(Stage::GenerateReport))
}

/// Returns the validation answer for one test case, from the raw-result cache
/// when present, otherwise by querying the literature tool. The index is
/// only built on a cache miss, right before the query that needs it.
pub fn validate_test_case(ctx: &mut RunContext<'_>, test_case: &TestCase) -> Result<String> {
    let config = ctx.config;
    let raw_results = config.raw_results();
    if let Some(cached) = raw_results.get(&test_case.cl_id)? {
        debug!(cl_id = %test_case.cl_id, "using cached validation answer");
        return Ok(cached);
    }

    let literature_dir = config.literature_dir(&test_case.cl_id);
    ensure_index(ctx, &literature_dir, &test_case.cl_id)?;

    let prompt = validation_prompt(test_case);
    let log = ctx
        .literature
        .ask(&literature_dir, &prompt, &ctx.cancel)
        .with_context(|| format!("literature query failed for {}", test_case.cl_id))?;
    ctx.counts.literature_queries += 1;

    let answer = extract_answer(&log, &config.answer_delimiter).ok_or_else(|| {
        PipelineError::MissingDelimiter {
            cl_id: test_case.cl_id.clone(),
            delimiter: config.answer_delimiter.clone(),
        }
    })?;

    let path = raw_results.put(&test_case.cl_id, &answer)?;
    info!(cl_id = %test_case.cl_id, path = %path.display(), "cached validation answer");
    Ok(answer)
}

fn ensure_index(ctx: &mut RunContext<'_>, literature_dir: &Path, cl_id: &str) -> Result<()> {
    let marker = literature_dir.join(&ctx.config.index_marker);
    if marker.exists() {
        debug!(cl_id = %cl_id, marker = %marker.display(), "literature index present");
        return Ok(());
    }

    info!(cl_id = %cl_id, dir = %literature_dir.display(), "building literature index");
    ctx.literature
        .index(literature_dir, &ctx.cancel)
        .with_context(|| format!("literature indexing failed for {cl_id}"))?;
    ctx.counts.index_builds += 1;
    Ok(())
}

/// Returns the trimmed text after the last occurrence of `delimiter`.
pub fn extract_answer(log: &str, delimiter: &str) -> Option<String> {
    if delimiter.is_empty() {
        return None;
    }
    log.rfind(delimiter)
        .map(|position| log[position + delimiter.len()..].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::extract_answer;

    #[test]
    fn extract_answer_uses_last_delimiter() {
        let log = "Question: q\nAnswer: draft\nlogs...\nAnswer: | A | True |";
        assert_eq!(
            extract_answer(log, "Answer:").as_deref(),
            Some("| A | True |")
        );
    }

    #[test]
    fn extract_answer_reports_missing_delimiter() {
        assert!(extract_answer("no marker here", "Answer:").is_none());
        assert!(extract_answer("Answer: x", "").is_none());
    }
}
