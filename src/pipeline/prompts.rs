use crate::model::{TermDefinition, TestCase};

pub fn false_assertion_prompt(term: &TermDefinition) -> String {
    format!(
        "Insert a biologically plausible but false assertion into the following cell type \
definition in a natural and convincing way. Return only a JSON object with keys \
updated_definition and false_assertion. The value of updated_definition is the full \
rewritten definition; the value of false_assertion is the inserted false statement on its \
own. Do not include any additional text or explanation.\n\
Cell Type: \"{}\"\n\
Definition: \"{}\"",
        term.name, term.definition
    )
}

/// Splits logical-axiom text into one trimmed clause per line.
pub fn atomic_clauses(logical_axioms: &str) -> Vec<String> {
    logical_axioms
        .split('.')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

pub fn validation_prompt(test_case: &TestCase) -> String {
    let clauses = atomic_clauses(&test_case.logical_axioms).join("\n");
    format!(
        "For the following text, first break down the definition into individual, atomic \
assertions. Each assertion should be a single, verifiable statement. After extracting the \
assertions, create a markdown table with the following columns:\n\
\n\
- **Assertion**: A single, verifiable statement about the cell type.\n\
- **Validated**: A strict \"True\" or \"False\" value. Use \"True\" only if the entire \
assertion is stated and supported by the provided literature. If the literature contradicts \
the assertion, or does not support it, the value must be \"False\".\n\
- **Evidence**: A brief summary of the evidence from the literature that supports the \
\"Validated\" value.\n\
- **References**: The sources from the literature that were used for validation.\n\
\n\
Text:\n\
name: {}\n\
def: \"{}\"\n\
{}",
        test_case.name, test_case.definition, clauses
    )
}

pub fn table_extraction_prompt(raw_result: &str) -> String {
    format!(
        "Extract only the markdown table from the following validation report and return it \
as a JSON array. Each element must be an object with exactly these keys: \"assertion\" \
(string), \"validated\" (true or false), \"summary_text\" (string, the evidence summary) and \
\"references\" (string). Return only the JSON array, with no other text.\n\
Report:\n{raw_result}\n"
    )
}
