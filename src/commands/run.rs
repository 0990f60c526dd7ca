use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, info_span, warn};

use crate::cli::RunArgs;
use crate::invoker::{AgentSettings, CancelToken, CommandLiteratureTool, OpenAiAgent};
use crate::model::PipelineRunManifest;
use crate::pipeline::{DEFAULT_TEST_TERMS, PipelineConfig, RunContext, RunState, run_pipeline};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

const REPORT_FILE_NAME: &str = "cell_type_validation_report.tsv";

pub fn run(args: RunArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let config = resolve_config(&args);
    let manifest_dir = config.out_dir.join("manifests");
    ensure_directory(&manifest_dir)?;
    let manifest_path = manifest_dir.join(format!(
        "pipeline_run_{}.json",
        utc_compact_string(started_ts)
    ));

    let cells_data_sha256 = sha256_file(&config.cells_data_file)?;

    let literature = CommandLiteratureTool::from_command_line(
        &args.literature_command,
        Duration::from_secs(args.command_timeout_secs),
    )
    .context("literature command must not be empty")?;
    if args.api_key.is_none() {
        warn!("no API key configured; agent calls go out unauthenticated");
    }
    let agent = OpenAiAgent::new(AgentSettings {
        base_url: args.agent_base_url.clone(),
        model: args.agent_model.clone(),
        api_key: args.api_key.clone(),
        timeout: Duration::from_secs(args.agent_timeout_secs),
    });

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel)?;

    let seed = args.seed.unwrap_or_else(rand::random);
    let span = info_span!("pipeline", run_id = %run_id);

    info!(
        run_id = %run_id,
        cells_data = %config.cells_data_file.display(),
        out_dir = %config.out_dir.display(),
        probability = config.false_assertion_probability,
        test_mode = config.test_mode,
        seed,
        "starting validation pipeline"
    );

    let mut ctx = RunContext::new(
        &config,
        &agent,
        &literature,
        cancel,
        StdRng::seed_from_u64(seed),
        span,
    );
    let mut state = RunState::default();
    let outcome = run_pipeline(&mut ctx, &mut state);

    let manifest = PipelineRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        status: if outcome.is_ok() { "completed" } else { "failed" }.to_string(),
        started_at,
        updated_at: now_utc_string(),
        completed_stages: ctx
            .completed_stages
            .iter()
            .map(ToString::to_string)
            .collect(),
        failed_stage: ctx.failed_stage.map(|stage| stage.to_string()),
        failure_reason: outcome.as_ref().err().map(|err| format!("{err:#}")),
        summary: outcome.as_ref().ok().cloned(),
        command: render_run_command(&args),
        seed,
        false_assertion_probability: config.false_assertion_probability,
        test_mode: config.test_mode,
        cells_data_sha256,
        paths: config.paths(),
        counts: ctx.counts.clone(),
        skipped_terms: state.skipped_terms.clone(),
    };
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote pipeline run manifest");

    let summary = outcome?;
    info!(
        rows = state.report_rows.len(),
        skipped = state.skipped_terms.len(),
        "pipeline completed"
    );
    println!("{summary}");

    Ok(())
}

pub fn resolve_config(args: &RunArgs) -> PipelineConfig {
    let data_dir = &args.data_dir;
    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("output"));
    let test_terms = if args.test_terms.is_empty() {
        DEFAULT_TEST_TERMS.iter().map(|id| id.to_string()).collect()
    } else {
        args.test_terms.clone()
    };

    PipelineConfig {
        cells_data_file: args
            .cells_data_file
            .clone()
            .unwrap_or_else(|| data_dir.join("cells_data.json")),
        references_dir: args
            .references_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("reference")),
        false_assertions_file: args
            .false_assertions_file
            .clone()
            .unwrap_or_else(|| data_dir.join("cells_false_data.json")),
        report_path: args
            .report_path
            .clone()
            .unwrap_or_else(|| out_dir.join(REPORT_FILE_NAME)),
        out_dir,
        false_assertion_probability: args.false_assertion_probability,
        test_mode: args.test_mode,
        test_terms,
        index_marker: args.index_marker.clone(),
        answer_delimiter: args.answer_delimiter.clone(),
    }
}

fn install_interrupt_handler(cancel: &CancelToken) -> Result<()> {
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received; cancelling after the current external call");
        token.cancel();
    })
    .context("failed to install interrupt handler")
}

fn render_run_command(args: &RunArgs) -> String {
    let mut command = vec![
        "clvalidate".to_string(),
        "run".to_string(),
        "--data-dir".to_string(),
        args.data_dir.display().to_string(),
    ];

    if let Some(path) = &args.cells_data_file {
        command.push("--cells-data-file".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.references_dir {
        command.push("--references-dir".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.out_dir {
        command.push("--out-dir".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.false_assertions_file {
        command.push("--false-assertions-file".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.report_path {
        command.push("--report-path".to_string());
        command.push(path.display().to_string());
    }
    command.push("--false-assertion-probability".to_string());
    command.push(args.false_assertion_probability.to_string());
    if let Some(seed) = args.seed {
        command.push("--seed".to_string());
        command.push(seed.to_string());
    }
    if args.test_mode {
        command.push("--test-mode".to_string());
    }
    for term in &args.test_terms {
        command.push("--test-term".to_string());
        command.push(term.clone());
    }
    command.push("--agent-model".to_string());
    command.push(args.agent_model.clone());

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{render_run_command, resolve_config};
    use crate::cli::{Cli, Commands, RunArgs};

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["clvalidate", "run", "--data-dir", "/data"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("args").command {
            Commands::Run(args) => args,
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn resolve_config_defaults_paths_under_data_dir() {
        let config = resolve_config(&run_args(&[]));
        assert_eq!(config.cells_data_file, PathBuf::from("/data/cells_data.json"));
        assert_eq!(config.references_dir, PathBuf::from("/data/reference"));
        assert_eq!(
            config.report_path,
            PathBuf::from("/data/output/cell_type_validation_report.tsv")
        );
        assert_eq!(config.test_terms.len(), 6);
    }

    #[test]
    fn resolve_config_places_report_under_custom_out_dir() {
        let config = resolve_config(&run_args(&["--out-dir", "/tmp/out", "--test-term", "CL_9"]));
        assert_eq!(
            config.report_path,
            PathBuf::from("/tmp/out/cell_type_validation_report.tsv")
        );
        assert_eq!(config.test_terms, vec!["CL_9"]);
    }

    #[test]
    fn render_run_command_includes_seed_and_test_terms() {
        let command = render_run_command(&run_args(&["--seed", "42", "--test-term", "CL_1"]));
        assert!(command.starts_with("clvalidate run --data-dir /data"));
        assert!(command.contains("--seed 42"));
        assert!(command.contains("--test-term CL_1"));
    }
}
