use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// One entry of the term database, as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct TermRecord {
    pub cell_id: String,
    pub name: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default, deserialize_with = "text_or_sentences")]
    pub relations: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub has_all_references: bool,
    #[serde(default, deserialize_with = "text_or_citations")]
    pub references: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermDefinition {
    pub cl_id: String,
    pub name: String,
    pub definition: String,
    pub logical_axioms: String,
    pub source: String,
    pub has_all_references: bool,
    pub references: String,
}

impl From<TermRecord> for TermDefinition {
    fn from(record: TermRecord) -> Self {
        Self {
            cl_id: record.cell_id,
            name: record.name,
            definition: record.definition,
            logical_axioms: record.relations,
            source: record.source,
            has_all_references: record.has_all_references,
            references: record.references,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub cl_id: String,
    pub name: String,
    pub definition: String,
    pub logical_axioms: String,
    pub references: String,
    pub source_id: String,
    pub false_assertion: Option<String>,
}

impl TestCase {
    pub fn unmodified(term: &TermDefinition) -> Self {
        Self {
            cl_id: term.cl_id.clone(),
            name: term.name.clone(),
            definition: term.definition.clone(),
            logical_axioms: term.logical_axioms.clone(),
            references: term.references.clone(),
            source_id: term.cl_id.clone(),
            false_assertion: None,
        }
    }

    pub fn mutated(term: &TermDefinition, definition: String, false_assertion: String) -> Self {
        Self {
            definition,
            false_assertion: Some(false_assertion),
            ..Self::unmodified(term)
        }
    }

    pub fn is_mutated(&self) -> bool {
        self.false_assertion.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FalseAssertionRecord {
    pub cell_id: String,
    pub label: String,
    pub false_assertion: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationRun {
    pub test_case: TestCase,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionRecord {
    pub assertion: String,
    #[serde(deserialize_with = "flexible_bool")]
    pub validated: bool,
    #[serde(default, alias = "summary")]
    pub summary_text: String,
    #[serde(default, deserialize_with = "text_or_citations")]
    pub references: String,
}

pub const REPORT_COLUMNS: [&str; 8] = [
    "Cell ID",
    "Name",
    "Assertion",
    "Agent Validation",
    "Curator Validation",
    "References",
    "Curator Notes",
    "Agent Notes",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    #[serde(rename = "Cell ID")]
    pub cell_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Assertion")]
    pub assertion: String,
    #[serde(rename = "Agent Validation")]
    pub agent_validation: String,
    #[serde(rename = "Curator Validation", default)]
    pub curator_validation: String,
    #[serde(rename = "References", default)]
    pub references: String,
    #[serde(rename = "Curator Notes", default)]
    pub curator_notes: String,
    #[serde(rename = "Agent Notes", default)]
    pub agent_notes: String,
}

impl ReportRow {
    pub fn from_assertion(test_case: &TestCase, record: &AssertionRecord) -> Self {
        Self {
            cell_id: test_case.cl_id.clone(),
            name: test_case.name.clone(),
            assertion: record.assertion.clone(),
            agent_validation: if record.validated { "True" } else { "False" }.to_string(),
            curator_validation: String::new(),
            references: test_case.references.clone(),
            curator_notes: String::new(),
            agent_notes: record.summary_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePaths {
    pub cells_data_file: String,
    pub references_dir: String,
    pub out_dir: String,
    pub false_assertions_file: String,
    pub raw_results_dir: String,
    pub structured_results_dir: String,
    pub report_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub definitions_loaded: usize,
    pub test_cases: usize,
    pub mutated_test_cases: usize,
    pub new_false_assertions: usize,
    pub validation_runs: usize,
    pub report_rows: usize,
    pub skipped_terms: usize,
    pub index_builds: usize,
    pub literature_queries: usize,
    pub agent_calls: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub completed_stages: Vec<String>,
    pub failed_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub summary: Option<String>,
    pub command: String,
    pub seed: u64,
    pub false_assertion_probability: f64,
    pub test_mode: bool,
    pub cells_data_sha256: String,
    pub paths: PipelinePaths,
    pub counts: PipelineCounts,
    pub skipped_terms: Vec<String>,
}

fn text_or_sentences<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    joined_text(deserializer, ". ")
}

fn text_or_citations<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    joined_text(deserializer, "; ")
}

fn joined_text<'de, D>(deserializer: D, separator: &str) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrList {
        Text(String),
        List(Vec<String>),
        Missing(()),
    }

    Ok(match TextOrList::deserialize(deserializer)? {
        TextOrList::Text(text) => text,
        TextOrList::List(items) => items
            .iter()
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
            .join(separator),
        TextOrList::Missing(()) => String::new(),
    })
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrText {
        Bool(bool),
        Text(String),
    }

    match BoolOrText::deserialize(deserializer)? {
        BoolOrText::Bool(value) => Ok(value),
        BoolOrText::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            other => Err(de::Error::custom(format!(
                "expected True/False validation flag, got {other:?}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{AssertionRecord, FalseAssertionRecord, TermDefinition, TermRecord};

    #[test]
    fn term_record_accepts_list_relations_and_references() {
        let raw = r#"
        {
          "cell_id": "CL_4033092",
          "name": "example cell",
          "definition": "A cell.",
          "relations": ["is_a: CL:0000000", "part_of: UBERON:0000955"],
          "source": "CL",
          "has_all_references": true,
          "references": ["PMID:1", "PMID:2"]
        }
        "#;

        let record: TermRecord = serde_json::from_str(raw).expect("record should deserialize");
        let term = TermDefinition::from(record);
        assert_eq!(term.cl_id, "CL_4033092");
        assert_eq!(
            term.logical_axioms,
            "is_a: CL:0000000. part_of: UBERON:0000955"
        );
        assert_eq!(term.references, "PMID:1; PMID:2");
    }

    #[test]
    fn term_record_treats_null_references_as_empty() {
        let raw = r#"{"cell_id": "CL_1", "name": "n", "references": null}"#;
        let record: TermRecord = serde_json::from_str(raw).expect("record should deserialize");
        assert!(record.references.is_empty());
        assert!(!record.has_all_references);
    }

    #[test]
    fn assertion_record_accepts_text_flags_and_summary_alias() {
        let raw = r#"{"assertion": "a", "validated": "False", "summary": "s", "references": "r"}"#;
        let record: AssertionRecord = serde_json::from_str(raw).expect("record should deserialize");
        assert!(!record.validated);
        assert_eq!(record.summary_text, "s");
    }

    #[test]
    fn assertion_record_rejects_unknown_flag_text() {
        let raw = r#"{"assertion": "a", "validated": "maybe"}"#;
        assert!(serde_json::from_str::<AssertionRecord>(raw).is_err());
    }

    #[test]
    fn false_assertion_record_keeps_fixed_schema() {
        let raw = r#"{"cell_id": "CL_1", "label": "n", "false_assertion": "f", "updated_definition": "d"}"#;
        let record: FalseAssertionRecord =
            serde_json::from_str(raw).expect("record with extra keys should deserialize");
        assert_eq!(record.false_assertion, "f");

        let value = serde_json::to_value(&record).expect("serialize");
        let keys: Vec<&str> = value
            .as_object()
            .expect("object")
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["cell_id", "label", "false_assertion"]);
    }
}
