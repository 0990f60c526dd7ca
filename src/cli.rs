use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::invoker::{DEFAULT_AGENT_BASE_URL, DEFAULT_AGENT_MODEL};

#[derive(Parser, Debug)]
#[command(
    name = "clvalidate",
    version,
    about = "Validate cell ontology term definitions against literature"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the load, seed, validate and report stages.
    Run(RunArgs),
    /// Show the latest run manifest and cache population.
    Status(StatusArgs),
    /// Print the stage graph as a Mermaid diagram.
    Graph,
    /// Score agent validation against curator validation in a report.
    Stats(StatsArgs),
    /// Copy curator columns from one report into another.
    MergeCuration(MergeCurationArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, env = "CLVALIDATE_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Term database; defaults to <data-dir>/cells_data.json.
    #[arg(long)]
    pub cells_data_file: Option<PathBuf>,

    /// Per-term literature folders; defaults to <data-dir>/reference.
    #[arg(long)]
    pub references_dir: Option<PathBuf>,

    /// Caches and report; defaults to <data-dir>/output.
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Defaults to <data-dir>/cells_false_data.json.
    #[arg(long)]
    pub false_assertions_file: Option<PathBuf>,

    /// Defaults to <out-dir>/cell_type_validation_report.tsv.
    #[arg(long)]
    pub report_path: Option<PathBuf>,

    #[arg(long, default_value_t = 0.4, value_parser = parse_probability)]
    pub false_assertion_probability: f64,

    /// Seed for the mutation draw; random when omitted.
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value_t = false)]
    pub test_mode: bool,

    /// Allow-list used in test mode; the built-in list applies when empty.
    #[arg(long = "test-term")]
    pub test_terms: Vec<String>,

    #[arg(
        long,
        env = "CLVALIDATE_LITERATURE_COMMAND",
        default_value = "poetry run cellsem-agent paperqa"
    )]
    pub literature_command: String,

    #[arg(long, default_value = ".pqa")]
    pub index_marker: String,

    #[arg(long, default_value = "Answer:")]
    pub answer_delimiter: String,

    #[arg(long, default_value_t = 3600)]
    pub command_timeout_secs: u64,

    #[arg(long, env = "CLVALIDATE_AGENT_MODEL", default_value = DEFAULT_AGENT_MODEL)]
    pub agent_model: String,

    #[arg(long, env = "CLVALIDATE_AGENT_BASE_URL", default_value = DEFAULT_AGENT_BASE_URL)]
    pub agent_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, default_value_t = 300)]
    pub agent_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, env = "CLVALIDATE_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    #[arg(long)]
    pub false_assertions_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatsArgs {
    #[arg(long)]
    pub report: PathBuf,

    #[arg(long, default_value = "Curator Validation")]
    pub truth_column: String,

    #[arg(long, default_value = "Agent Validation")]
    pub prediction_column: String,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MergeCurationArgs {
    #[arg(long)]
    pub main: PathBuf,

    #[arg(long)]
    pub copy: PathBuf,

    #[arg(long)]
    pub target: PathBuf,
}

fn parse_probability(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("{raw:?} is not a number"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{value} is outside [0, 1]"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, parse_probability};

    #[test]
    fn parse_probability_accepts_bounds_and_rejects_outside() {
        assert_eq!(parse_probability("0"), Ok(0.0));
        assert_eq!(parse_probability("1"), Ok(1.0));
        assert!(parse_probability("1.5").is_err());
        assert!(parse_probability("-0.1").is_err());
        assert!(parse_probability("often").is_err());
    }

    #[test]
    fn run_args_collect_repeated_test_terms() {
        let cli = Cli::try_parse_from([
            "clvalidate",
            "run",
            "--test-mode",
            "--test-term",
            "CL_1",
            "--test-term",
            "CL_2",
            "--false-assertion-probability",
            "0.25",
        ])
        .expect("args should parse");

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.test_mode);
        assert_eq!(args.test_terms, vec!["CL_1", "CL_2"]);
        assert_eq!(args.false_assertion_probability, 0.25);
    }
}
