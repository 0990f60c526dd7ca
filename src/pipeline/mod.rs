//! Four-stage validation pipeline: load definitions, seed negative tests,
//! validate assertions against literature, generate the curator report.
//!
//! Stages are a closed set with an explicit transition table. The driver owns
//! one [`RunState`] and threads it through every stage; each stage appends
//! only to its own collection.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use tracing::{Span, error, info, info_span};

use crate::cache::{JsonStore, TextStore, encode_key};
use crate::error::PipelineError;
use crate::invoker::{Agent, CancelToken, LiteratureTool};
use crate::model::{
    PipelineCounts, PipelinePaths, ReportRow, TermDefinition, TestCase, ValidationRun,
};

pub mod loader;
pub mod prompts;
pub mod report;
pub mod seeder;
pub mod validator;


pub const DEFAULT_TEST_TERMS: [&str; 6] = [
    "CL_4052001",
    "CL_4033092",
    "CL_4033088",
    "CL_4052055",
    "CL_4033094",
    "CL_4033084",
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    LoadDefinitions,
    SeedNegativeTests,
    ValidateAssertions,
    GenerateReport,
}

impl Stage {
    pub const FIRST: Stage = Stage::LoadDefinitions;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadDefinitions => "load_definitions",
            Self::SeedNegativeTests => "seed_negative_tests",
            Self::ValidateAssertions => "validate_assertions",
            Self::GenerateReport => "generate_report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edges of the stage graph; `None` marks the terminal stage.
pub const STAGE_TRANSITIONS: [(Stage, Option<Stage>); 4] = [
    (Stage::LoadDefinitions, Some(Stage::SeedNegativeTests)),
    (Stage::SeedNegativeTests, Some(Stage::ValidateAssertions)),
    (Stage::ValidateAssertions, Some(Stage::GenerateReport)),
    (Stage::GenerateReport, None),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(Stage),
    End(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cells_data_file: PathBuf,
    pub references_dir: PathBuf,
    pub out_dir: PathBuf,
    pub false_assertions_file: PathBuf,
    pub report_path: PathBuf,
    pub false_assertion_probability: f64,
    pub test_mode: bool,
    pub test_terms: Vec<String>,
    pub index_marker: String,
    pub answer_delimiter: String,
}

impl PipelineConfig {
    /// Per-term literature folder. The id is encoded the same way as cache
    /// keys, so it always names one child of `references_dir`.
    pub fn literature_dir(&self, cl_id: &str) -> PathBuf {
        self.references_dir.join(encode_key(cl_id))
    }

    pub fn raw_results_dir(&self) -> PathBuf {
        self.out_dir.join("paperqa")
    }

    pub fn structured_results_dir(&self) -> PathBuf {
        self.out_dir.join("structured")
    }

    pub fn raw_results(&self) -> TextStore {
        TextStore::new(self.raw_results_dir(), "txt")
    }

    pub fn structured_results(&self) -> JsonStore {
        JsonStore::new(self.structured_results_dir())
    }

    pub fn paths(&self) -> PipelinePaths {
        PipelinePaths {
            cells_data_file: self.cells_data_file.display().to_string(),
            references_dir: self.references_dir.display().to_string(),
            out_dir: self.out_dir.display().to_string(),
            false_assertions_file: self.false_assertions_file.display().to_string(),
            raw_results_dir: self.raw_results_dir().display().to_string(),
            structured_results_dir: self.structured_results_dir().display().to_string(),
            report_path: self.report_path.display().to_string(),
        }
    }
}

/// Shared mutable state of one run. Each collection has exactly one writing
/// stage.
#[derive(Debug, Default)]
pub struct RunState {
    pub definitions: Vec<TermDefinition>,
    pub test_cases: Vec<TestCase>,
    pub validation_runs: Vec<ValidationRun>,
    pub report_rows: Vec<ReportRow>,
    pub skipped_terms: Vec<String>,
}

/// Collaborators and run-scoped bookkeeping handed to every stage.
pub struct RunContext<'a> {
    pub config: &'a PipelineConfig,
    pub agent: &'a dyn Agent,
    pub literature: &'a dyn LiteratureTool,
    pub cancel: CancelToken,
    pub rng: StdRng,
    pub span: Span,
    pub counts: PipelineCounts,
    pub completed_stages: Vec<Stage>,
    pub failed_stage: Option<Stage>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        agent: &'a dyn Agent,
        literature: &'a dyn LiteratureTool,
        cancel: CancelToken,
        rng: StdRng,
        span: Span,
    ) -> Self {
        Self {
            config,
            agent,
            literature,
            cancel,
            rng,
            span,
            counts: PipelineCounts::default(),
            completed_stages: Vec::new(),
            failed_stage: None,
        }
    }
}

/// Runs stages from [`Stage::FIRST`] until one ends the run. Any stage error
/// aborts immediately; whatever the caches captured stays on disk.
pub fn run_pipeline(ctx: &mut RunContext<'_>, state: &mut RunState) -> Result<String> {
    let mut stage = Stage::FIRST;

    loop {
        if ctx.cancel.is_cancelled() {
            ctx.failed_stage = Some(stage);
            return Err(PipelineError::Cancelled {
                stage: stage.to_string(),
            }
            .into());
        }

        let span = info_span!(parent: &ctx.span, "stage", stage = stage.as_str());
        let _entered = span.enter();
        info!("stage started");

        let outcome = dispatch(stage, ctx, state)
            .and_then(|transition| check_transition(stage, &transition).map(|()| transition))
            .with_context(|| format!("stage {stage} failed"));

        let transition = match outcome {
            Ok(transition) => transition,
            Err(err) => {
                error!(error = %err, "stage aborted run");
                ctx.failed_stage = Some(stage);
                return Err(err);
            }
        };

        ctx.completed_stages.push(stage);
        info!("stage completed");

        match transition {
            Transition::Next(next) => stage = next,
            Transition::End(summary) => return Ok(summary),
        }
    }
}

fn dispatch(stage: Stage, ctx: &mut RunContext<'_>, state: &mut RunState) -> Result<Transition> {
    match stage {
        Stage::LoadDefinitions => loader::run(ctx, state),
        Stage::SeedNegativeTests => seeder::run(ctx, state),
        Stage::ValidateAssertions => validator::run(ctx, state),
        Stage::GenerateReport => report::run(ctx, state),
    }
}

pub fn next_stage(stage: Stage) -> Option<Stage> {
    STAGE_TRANSITIONS
        .iter()
        .find(|(from, _)| *from == stage)
        .and_then(|(_, to)| *to)
}

fn check_transition(stage: Stage, transition: &Transition) -> Result<()> {
    let expected = next_stage(stage);
    let legal = match transition {
        Transition::Next(next) => expected == Some(*next),
        Transition::End(_) => expected.is_none(),
    };

    if legal {
        return Ok(());
    }

    let next = match transition {
        Transition::Next(next) => next.to_string(),
        Transition::End(_) => "end".to_string(),
    };
    Err(PipelineError::IllegalTransition {
        stage: stage.to_string(),
        next,
    }
    .into())
}

/// Renders the stage graph as a Mermaid state diagram.
pub fn mermaid_diagram() -> String {
    let mut lines = vec!["stateDiagram-v2".to_string()];
    lines.push(format!("  [*] --> {}", Stage::FIRST));
    for (from, to) in STAGE_TRANSITIONS {
        match to {
            Some(to) => lines.push(format!("  {from} --> {to}")),
            None => lines.push(format!("  {from} --> [*]")),
        }
    }
    lines.join("\n")
}
