use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::prompts::table_extraction_prompt;
use super::{RunContext, RunState, Transition};
use crate::model::{AssertionRecord, REPORT_COLUMNS, ReportRow, ValidationRun};
use crate::util::{strip_code_fences, write_atomic};

pub fn run(ctx: &mut RunContext<'_>, state: &mut RunState) -> Result<Transition> {
    let mut rows = Vec::new();
    let mut skipped = Vec::new();

    for validation_run in &state.validation_runs {
        let Some(assertions) = structured_assertions(ctx, validation_run)? else {
            skipped.push(validation_run.test_case.cl_id.clone());
            continue;
        };

        rows.extend(
            assertions
                .iter()
                .map(|record| ReportRow::from_assertion(&validation_run.test_case, record)),
        );
    }

    let report_path = &ctx.config.report_path;
    write_report(report_path, &rows)?;
    info!(
        path = %report_path.display(),
        rows = rows.len(),
        skipped = skipped.len(),
        "wrote validation report"
    );

    ctx.counts.report_rows = rows.len();
    ctx.counts.skipped_terms = skipped.len();
    state.report_rows.extend(rows);
    state.skipped_terms.extend(skipped);

    Ok(Transition::End(format!(
        "Validation report written to {}",
        report_path.display()
    )))
}

/// Loads or extracts the per-assertion records for one validation run.
/// `None` means the term was skipped: its extraction could not be parsed or
/// the agent call timed out.
fn structured_assertions(
    ctx: &mut RunContext<'_>,
    validation_run: &ValidationRun,
) -> Result<Option<Vec<AssertionRecord>>> {
    let cl_id = &validation_run.test_case.cl_id;
    let store = ctx.config.structured_results();

    if let Some(cached) = store.get::<Vec<AssertionRecord>>(cl_id)? {
        debug!(cl_id = %cl_id, "using cached structured assertions");
        return Ok(Some(cached));
    }

    let prompt = table_extraction_prompt(&validation_run.result);
    let raw = match ctx.agent.run(&prompt, &ctx.cancel) {
        Ok(raw) => raw,
        Err(err) if err.is_timeout() => {
            warn!(cl_id = %cl_id, error = %err, "table extraction timed out; skipping term");
            return Ok(None);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("table extraction failed for {cl_id}"));
        }
    };
    ctx.counts.agent_calls += 1;

    let assertions = match parse_assertion_table(&strip_code_fences(&raw)?) {
        Ok(assertions) => assertions,
        Err(err) => {
            error!(cl_id = %cl_id, raw = %raw, error = %err, "failed to parse structured assertions; skipping term");
            return Ok(None);
        }
    };

    let path = store.put(cl_id, &assertions)?;
    debug!(cl_id = %cl_id, path = %path.display(), "cached structured assertions");
    Ok(Some(assertions))
}

/// Parses an extraction body that has already had its code fence removed.
pub fn parse_assertion_table(body: &str) -> serde_json::Result<Vec<AssertionRecord>> {
    serde_json::from_str(body)
}

pub fn write_report(path: &Path, rows: &[ReportRow]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(Vec::new());

    // header written explicitly so an empty report still carries the columns
    writer
        .write_record(REPORT_COLUMNS)
        .context("failed to write report header")?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write report row for {}", row.cell_id))?;
    }
    let data = writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("failed to finish report buffer: {}", err.error()))?;

    write_atomic(path, &data)
}
