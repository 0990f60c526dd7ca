use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use tracing::{info, warn};

use crate::cli::MergeCurationArgs;
use crate::model::ReportRow;
use crate::pipeline::report::write_report;
use crate::util::is_blank_cell;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub rows: usize,
    pub matched: usize,
    pub filled_validations: usize,
    pub filled_notes: usize,
    pub conflicts: usize,
}

pub fn run(args: MergeCurationArgs) -> Result<()> {
    let counts = merge_curation(&args.main, &args.copy, &args.target)?;
    info!(
        path = %args.target.display(),
        rows = counts.rows,
        matched = counts.matched,
        filled_validations = counts.filled_validations,
        filled_notes = counts.filled_notes,
        conflicts = counts.conflicts,
        "merged curator columns"
    );
    Ok(())
}

/// Fills blank curator cells of `main` from rows of `copy` sharing the same
/// cell id and assertion, then writes the merged report to `target`.
pub fn merge_curation(main: &Path, copy: &Path, target: &Path) -> Result<MergeCounts> {
    let mut rows = read_report(main)?;
    let mut curated: IndexMap<(String, String), ReportRow> = IndexMap::new();
    for row in read_report(copy)? {
        curated
            .entry((row.cell_id.clone(), row.assertion.clone()))
            .or_insert(row);
    }

    let mut counts = MergeCounts {
        rows: rows.len(),
        ..MergeCounts::default()
    };
    for row in &mut rows {
        let Some(source) = curated.get(&(row.cell_id.clone(), row.assertion.clone())) else {
            continue;
        };
        counts.matched += 1;

        match merge_cell(&mut row.curator_validation, &source.curator_validation) {
            CellMerge::Filled => counts.filled_validations += 1,
            CellMerge::Conflict => {
                counts.conflicts += 1;
                warn!(
                    cell_id = %row.cell_id,
                    assertion = %row.assertion,
                    kept = %row.curator_validation,
                    other = %source.curator_validation,
                    "curator validation differs; keeping main report value"
                );
            }
            CellMerge::Unchanged => {}
        }
        match merge_cell(&mut row.curator_notes, &source.curator_notes) {
            CellMerge::Filled => counts.filled_notes += 1,
            CellMerge::Conflict => {
                counts.conflicts += 1;
                warn!(
                    cell_id = %row.cell_id,
                    assertion = %row.assertion,
                    "curator notes differ; keeping main report value"
                );
            }
            CellMerge::Unchanged => {}
        }
    }

    write_report(target, &rows)?;
    Ok(counts)
}

#[derive(Debug, PartialEq, Eq)]
enum CellMerge {
    Filled,
    Conflict,
    Unchanged,
}

fn merge_cell(current: &mut String, other: &str) -> CellMerge {
    if is_blank_cell(other) {
        return CellMerge::Unchanged;
    }
    if is_blank_cell(current) {
        *current = other.to_string();
        return CellMerge::Filled;
    }
    if current.trim() == other.trim() {
        CellMerge::Unchanged
    } else {
        CellMerge::Conflict
    }
}

fn read_report(path: &Path) -> Result<Vec<ReportRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("failed to open report {}", path.display()))?;

    reader
        .deserialize::<ReportRow>()
        .map(|row| row.with_context(|| format!("failed to parse report row in {}", path.display())))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{CellMerge, merge_cell, merge_curation, read_report};
    use crate::model::ReportRow;
    use crate::pipeline::report::write_report;

    fn row(cell_id: &str, assertion: &str, curator: &str, notes: &str) -> ReportRow {
        ReportRow {
            cell_id: cell_id.to_string(),
            name: "cell".to_string(),
            assertion: assertion.to_string(),
            agent_validation: "True".to_string(),
            curator_validation: curator.to_string(),
            references: "PMID:1".to_string(),
            curator_notes: notes.to_string(),
            agent_notes: "summary".to_string(),
        }
    }

    fn write(path: &Path, rows: &[ReportRow]) {
        write_report(path, rows).expect("write report");
    }

    #[test]
    fn merge_cell_treats_nan_as_blank() {
        let mut current = "nan".to_string();
        assert_eq!(merge_cell(&mut current, "FALSE"), CellMerge::Filled);
        assert_eq!(current, "FALSE");
        assert_eq!(merge_cell(&mut current, "nan"), CellMerge::Unchanged);
        assert_eq!(merge_cell(&mut current, "TRUE"), CellMerge::Conflict);
        assert_eq!(current, "FALSE");
    }

    #[test]
    fn merge_curation_fills_blank_cells_by_cell_and_assertion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = dir.path().join("main.tsv");
        let copy = dir.path().join("copy.tsv");
        let target = dir.path().join("merged.tsv");

        write(
            &main,
            &[
                row("CL_1", "It is a neuron.", "", ""),
                row("CL_1", "It fires.", "TRUE", ""),
                row("CL_2", "It is round.", "", ""),
            ],
        );
        write(
            &copy,
            &[
                row("CL_1", "It is a neuron.", "FALSE", "contradicted by PMID:2"),
                row("CL_1", "It fires.", "FALSE", ""),
                row("CL_3", "It is round.", "TRUE", ""),
            ],
        );

        let counts = merge_curation(&main, &copy, &target).expect("merge");
        assert_eq!(counts.rows, 3);
        assert_eq!(counts.matched, 2);
        assert_eq!(counts.filled_validations, 1);
        assert_eq!(counts.filled_notes, 1);
        assert_eq!(counts.conflicts, 1);

        let merged = read_report(&target).expect("read merged");
        assert_eq!(merged[0].curator_validation, "FALSE");
        assert_eq!(merged[0].curator_notes, "contradicted by PMID:2");
        assert_eq!(merged[1].curator_validation, "TRUE");
        assert_eq!(merged[2].curator_validation, "");
    }
}
