use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::StatsArgs;
use crate::util::is_blank_cell;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationStats {
    pub scored_rows: usize,
    pub ignored_rows: usize,
    pub counts: ConfusionCounts,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub fnr: f64,
}

pub fn run(args: StatsArgs) -> Result<()> {
    let stats = stats_for_report(&args.report, &args.truth_column, &args.prediction_column)?;
    info!(
        path = %args.report.display(),
        scored = stats.scored_rows,
        ignored = stats.ignored_rows,
        "scored validation report"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    if args.json {
        serde_json::to_writer_pretty(&mut output, &stats)
            .context("failed to serialize stats json output")?;
        writeln!(output)?;
    } else {
        let counts = stats.counts;
        writeln!(
            output,
            "tn={} fp={} fn={} tp={}",
            counts.true_negative, counts.false_positive, counts.false_negative, counts.true_positive
        )?;
        writeln!(
            output,
            "precision={:.4} recall={:.4} f1={:.4} accuracy={:.4} fnr={:.4}",
            stats.precision, stats.recall, stats.f1, stats.accuracy, stats.fnr
        )?;
    }
    output.flush()?;
    Ok(())
}

pub fn stats_for_report(
    path: &Path,
    truth_column: &str,
    prediction_column: &str,
) -> Result<ValidationStats> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open report {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|header| header == name)
            .with_context(|| format!("column {name:?} missing from {}", path.display()))
    };
    let truth_index = column(truth_column)?;
    let prediction_index = column(prediction_column)?;

    let mut pairs = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read row of {}", path.display()))?;
        pairs.push((
            record.get(truth_index).unwrap_or_default().to_string(),
            record.get(prediction_index).unwrap_or_default().to_string(),
        ));
    }

    if pairs.is_empty() {
        bail!("report {} has no rows", path.display());
    }

    Ok(compute_stats(
        pairs.iter().map(|(truth, prediction)| (truth.as_str(), prediction.as_str())),
    ))
}

/// Scores agent predictions against curator labels with TRUE as the positive
/// class. A blank curator cell means the curator accepted the assertion.
/// Rows whose prediction is not TRUE/FALSE are ignored.
pub fn compute_stats<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> ValidationStats {
    let mut counts = ConfusionCounts::default();
    let mut ignored_rows = 0;

    for (truth, prediction) in pairs {
        let Some(predicted) = parse_flag(prediction) else {
            ignored_rows += 1;
            continue;
        };
        let actual = if is_blank_cell(truth) {
            Some(true)
        } else {
            parse_flag(truth)
        };
        let Some(actual) = actual else {
            warn!(truth = %truth, "unrecognized curator label; row ignored");
            ignored_rows += 1;
            continue;
        };

        match (actual, predicted) {
            (true, true) => counts.true_positive += 1,
            (false, false) => counts.true_negative += 1,
            (false, true) => counts.false_positive += 1,
            (true, false) => counts.false_negative += 1,
        }
    }

    let tp = counts.true_positive as f64;
    let tn = counts.true_negative as f64;
    let fp = counts.false_positive as f64;
    let fn_ = counts.false_negative as f64;

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = ratio(2.0 * precision * recall, precision + recall);

    ValidationStats {
        scored_rows: counts.true_positive
            + counts.true_negative
            + counts.false_positive
            + counts.false_negative,
        ignored_rows,
        counts,
        precision,
        recall,
        f1,
        accuracy: ratio(tp + tn, tp + tn + fp + fn_),
        fnr: ratio(fn_, fn_ + tp),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TRUE" => Some(true),
        "FALSE" => Some(false),
        _ => None,
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{compute_stats, stats_for_report};

    #[test]
    fn compute_stats_fills_blank_truth_and_ignores_missing_predictions() {
        let pairs = [
            ("", "True"),
            ("FALSE", "false"),
            ("false", "TRUE"),
            ("TRUE", "False"),
            ("TRUE", ""),
            ("nan", "true"),
        ];
        let stats = compute_stats(pairs.into_iter());

        assert_eq!(stats.counts.true_positive, 2);
        assert_eq!(stats.counts.true_negative, 1);
        assert_eq!(stats.counts.false_positive, 1);
        assert_eq!(stats.counts.false_negative, 1);
        assert_eq!(stats.ignored_rows, 1);
        assert!((stats.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.recall - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.accuracy - 0.6).abs() < 1e-9);
        assert!((stats.fnr - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn compute_stats_returns_zero_for_empty_denominators() {
        let stats = compute_stats([("FALSE", "FALSE")].into_iter());
        assert_eq!(stats.precision, 0.0);
        assert_eq!(stats.recall, 0.0);
        assert_eq!(stats.f1, 0.0);
        assert_eq!(stats.accuracy, 1.0);
    }

    #[test]
    fn stats_for_report_reads_named_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.tsv");
        fs::write(
            &path,
            "Cell ID\tName\tAssertion\tAgent Validation\tCurator Validation\tReferences\tCurator Notes\tAgent Notes\n\
             CL_1\tn\ta\tTrue\t\tr\t\tnote\n\
             CL_1\tn\tb\tFalse\tFALSE\tr\t\tnote\n",
        )
        .expect("write report");

        let stats = stats_for_report(&path, "Curator Validation", "Agent Validation")
            .expect("stats");
        assert_eq!(stats.scored_rows, 2);
        assert_eq!(stats.accuracy, 1.0);
    }

    #[test]
    fn stats_for_report_requires_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.tsv");
        fs::write(&path, "Cell ID\tName\nCL_1\tn\n").expect("write report");
        assert!(stats_for_report(&path, "Curator Validation", "Agent Validation").is_err());
    }
}
