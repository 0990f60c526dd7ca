use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use indexmap::IndexMap;
use tracing::{debug, info};

use super::{RunContext, RunState, Stage, Transition};
use crate::model::{TermDefinition, TermRecord};
use crate::util::read_json;

pub fn run(ctx: &mut RunContext<'_>, state: &mut RunState) -> Result<Transition> {
    let config = ctx.config;
    let allow_list = config.test_mode.then_some(config.test_terms.as_slice());

    let definitions = load_definitions(&config.cells_data_file, allow_list)?;
    info!(
        path = %config.cells_data_file.display(),
        loaded = definitions.len(),
        test_mode = config.test_mode,
        "loaded term definitions"
    );

    ctx.counts.definitions_loaded = definitions.len();
    state.definitions.extend(definitions);
    Ok(Transition::Next(Stage::SeedNegativeTests))
}

/// Reads the term database and keeps entries with a complete, non-empty
/// reference set, in database order. With an allow-list, only listed ids
/// survive.
pub fn load_definitions(path: &Path, allow_list: Option<&[String]>) -> Result<Vec<TermDefinition>> {
    let database: IndexMap<String, TermRecord> = read_json(path)?;
    let allowed: Option<HashSet<&str>> =
        allow_list.map(|ids| ids.iter().map(String::as_str).collect());

    let mut definitions = Vec::new();
    for (key, record) in database {
        if let Some(allowed) = &allowed {
            if !allowed.contains(record.cell_id.as_str()) {
                continue;
            }
        }
        if record.cell_id.trim().is_empty() {
            debug!(key = %key, "skipping term without an id");
            continue;
        }
        if !record.has_all_references || record.references.trim().is_empty() {
            debug!(key = %key, cl_id = %record.cell_id, "skipping term without complete references");
            continue;
        }
        definitions.push(TermDefinition::from(record));
    }

    Ok(definitions)
}
