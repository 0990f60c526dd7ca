use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, info};

use super::prompts::false_assertion_prompt;
use super::{RunContext, RunState, Stage, Transition};
use crate::cache::FalseAssertionCache;
use crate::error::PipelineError;
use crate::invoker::{Agent, CancelToken};
use crate::model::{FalseAssertionRecord, TermDefinition, TestCase};
use crate::util::strip_code_fences;

#[derive(Debug, Deserialize)]
struct InjectionResponse {
    updated_definition: String,
    false_assertion: String,
}

pub fn run(ctx: &mut RunContext<'_>, state: &mut RunState) -> Result<Transition> {
    let config = ctx.config;
    let mut cache = FalseAssertionCache::load(&config.false_assertions_file)?;
    let cached_before = cache.len();

    let mut seeder = Seeder {
        probability: config.false_assertion_probability,
        agent: ctx.agent,
        cancel: &ctx.cancel,
        cache: &mut cache,
        agent_calls: 0,
    };

    let seeded: Result<Vec<TestCase>> = state
        .definitions
        .iter()
        .map(|definition| seeder.seed(definition, &mut ctx.rng))
        .collect();
    let agent_calls = seeder.agent_calls;
    ctx.counts.agent_calls += agent_calls;

    // written even when nothing was added, and before a seeding error aborts
    cache.save()?;
    let test_cases = seeded?;

    let mutated = test_cases.iter().filter(|case| case.is_mutated()).count();
    info!(
        path = %cache.path().display(),
        test_cases = test_cases.len(),
        mutated,
        new_records = cache.len() - cached_before,
        "seeded negative tests"
    );

    ctx.counts.test_cases = test_cases.len();
    ctx.counts.mutated_test_cases = mutated;
    ctx.counts.new_false_assertions = cache.len() - cached_before;
    state.test_cases.extend(test_cases);
    Ok(Transition::Next(Stage::ValidateAssertions))
}

pub struct Seeder<'a> {
    pub probability: f64,
    pub agent: &'a dyn Agent,
    pub cancel: &'a CancelToken,
    pub cache: &'a mut FalseAssertionCache,
    pub agent_calls: usize,
}

impl Seeder<'_> {
    /// Produces the test case for one definition. A cached record always wins,
    /// consumes no random draw, and its false-assertion text becomes the
    /// definition.
    pub fn seed<R: Rng>(&mut self, definition: &TermDefinition, rng: &mut R) -> Result<TestCase> {
        if let Some(record) = self.cache.get(&definition.cl_id) {
            debug!(cl_id = %definition.cl_id, "replaying cached false assertion");
            return Ok(TestCase::mutated(
                definition,
                record.false_assertion.clone(),
                record.false_assertion.clone(),
            ));
        }

        let draw: f64 = rng.random();
        if draw >= self.probability {
            return Ok(TestCase::unmodified(definition));
        }

        let prompt = false_assertion_prompt(definition);
        let raw = self.agent.run(&prompt, self.cancel).with_context(|| {
            format!("false-assertion agent call failed for {}", definition.cl_id)
        })?;
        self.agent_calls += 1;
        info!(cl_id = %definition.cl_id, response = %raw, "generated false assertion");

        let body = strip_code_fences(&raw)?;
        let response = parse_injection_response(definition, &body).inspect_err(|err| {
            error!(cl_id = %definition.cl_id, raw = %raw, error = %err, "failed to parse false-assertion response");
        })?;

        self.cache.append(FalseAssertionRecord {
            cell_id: definition.cl_id.clone(),
            label: definition.name.clone(),
            false_assertion: response.false_assertion.clone(),
        });

        Ok(TestCase::mutated(
            definition,
            response.updated_definition,
            response.false_assertion,
        ))
    }
}

fn parse_injection_response(
    definition: &TermDefinition,
    body: &str,
) -> Result<InjectionResponse, PipelineError> {
    let malformed = |reason: String| PipelineError::MalformedSeedResponse {
        cl_id: definition.cl_id.clone(),
        reason,
    };

    let response: InjectionResponse = serde_json::from_str(body)
        .map_err(|err| malformed(format!("not a JSON object with the expected keys: {err}")))?;

    let updated = response.updated_definition.trim();
    if updated.is_empty() || updated == definition.definition.trim() {
        return Err(malformed(
            "updated definition is empty or unchanged".to_string(),
        ));
    }
    if response.false_assertion.trim().is_empty() {
        return Err(malformed("false assertion is empty".to_string()));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::Seeder;
    use crate::cache::FalseAssertionCache;
    use crate::error::{InvokeError, PipelineError};
    use crate::invoker::{Agent, CancelToken};
    use crate::model::{FalseAssertionRecord, TermDefinition};

    struct ScriptedAgent {
        responses: RefCell<Vec<String>>,
        calls: RefCell<usize>,
    }

    impl ScriptedAgent {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: RefCell::new(responses.iter().rev().map(|r| r.to_string()).collect()),
                calls: RefCell::new(0),
            }
        }
    }

    impl Agent for ScriptedAgent {
        fn run(&self, _prompt: &str, _cancel: &CancelToken) -> Result<String, InvokeError> {
            *self.calls.borrow_mut() += 1;
            self.responses
                .borrow_mut()
                .pop()
                .ok_or_else(|| InvokeError::Agent("no scripted response left".to_string()))
        }
    }

    fn term(id: &str) -> TermDefinition {
        TermDefinition {
            cl_id: id.to_string(),
            name: format!("cell {id}"),
            definition: "A cell found in the retina.".to_string(),
            logical_axioms: "is_a: neuron".to_string(),
            source: "CL".to_string(),
            has_all_references: true,
            references: "PMID:1".to_string(),
        }
    }

    fn empty_cache() -> (tempfile::TempDir, FalseAssertionCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache =
            FalseAssertionCache::load(&dir.path().join("false.json")).expect("load cache");
        (dir, cache)
    }

    #[test]
    fn cached_record_wins_over_random_draw() {
        let (_dir, mut cache) = empty_cache();
        cache.append(FalseAssertionRecord {
            cell_id: "CL_1".to_string(),
            label: "cell CL_1".to_string(),
            false_assertion: "It secretes insulin.".to_string(),
        });
        let agent = ScriptedAgent::new(&[]);
        let cancel = CancelToken::new();

        let mut outputs = Vec::new();
        for seed in [1_u64, 2] {
            let mut seeder = Seeder {
                probability: 0.0,
                agent: &agent,
                cancel: &cancel,
                cache: &mut cache,
                agent_calls: 0,
            };
            let mut rng = StdRng::seed_from_u64(seed);
            outputs.push(seeder.seed(&term("CL_1"), &mut rng).expect("seed"));
        }

        assert_eq!(outputs[0].definition, "It secretes insulin.");
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(*agent.calls.borrow(), 0);
    }

    #[test]
    fn mutation_keeps_identity_and_changes_definition() {
        let (_dir, mut cache) = empty_cache();
        let agent = ScriptedAgent::new(&[
            "```json\n{\"updated_definition\": \"A cell found in the retina that secretes insulin.\", \"false_assertion\": \"It secretes insulin.\"}\n```",
        ]);
        let cancel = CancelToken::new();
        let mut seeder = Seeder {
            probability: 1.0,
            agent: &agent,
            cancel: &cancel,
            cache: &mut cache,
            agent_calls: 0,
        };
        let source = term("CL_2");

        let case = seeder
            .seed(&source, &mut StdRng::seed_from_u64(7))
            .expect("seed");

        assert_eq!(case.cl_id, source.cl_id);
        assert_eq!(case.name, source.name);
        assert_ne!(case.definition, source.definition);
        assert_eq!(case.false_assertion.as_deref(), Some("It secretes insulin."));
        assert_eq!(seeder.agent_calls, 1);
        assert_eq!(
            cache.get("CL_2").map(|record| record.false_assertion.as_str()),
            Some("It secretes insulin.")
        );
    }

    #[test]
    fn replayed_record_uses_false_assertion_text_as_definition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cells_false_data.json");
        std::fs::write(
            &path,
            r#"[{"cell_id": "CL_6", "label": "cell CL_6", "false_assertion": "It secretes insulin.",
                 "updated_definition": "A cell found in the retina that secretes insulin."}]"#,
        )
        .expect("write cache");
        let mut cache = FalseAssertionCache::load(&path).expect("load cache");
        let agent = ScriptedAgent::new(&[]);
        let cancel = CancelToken::new();
        let mut seeder = Seeder {
            probability: 1.0,
            agent: &agent,
            cancel: &cancel,
            cache: &mut cache,
            agent_calls: 0,
        };

        let case = seeder
            .seed(&term("CL_6"), &mut StdRng::seed_from_u64(5))
            .expect("seed");
        assert_eq!(case.definition, "It secretes insulin.");
        assert_eq!(case.false_assertion.as_deref(), Some("It secretes insulin."));
        assert_eq!(*agent.calls.borrow(), 0);
    }

    #[test]
    fn zero_probability_copies_definition_unchanged() {
        let (_dir, mut cache) = empty_cache();
        let agent = ScriptedAgent::new(&[]);
        let cancel = CancelToken::new();
        let mut seeder = Seeder {
            probability: 0.0,
            agent: &agent,
            cancel: &cancel,
            cache: &mut cache,
            agent_calls: 0,
        };
        let source = term("CL_3");

        let case = seeder
            .seed(&source, &mut StdRng::seed_from_u64(3))
            .expect("seed");
        assert!(!case.is_mutated());
        assert_eq!(case.definition, source.definition);
        assert!(cache.is_empty());
    }

    #[test]
    fn malformed_response_is_fatal() {
        let (_dir, mut cache) = empty_cache();
        let agent = ScriptedAgent::new(&["Sure! Here is the definition you asked for."]);
        let cancel = CancelToken::new();
        let mut seeder = Seeder {
            probability: 1.0,
            agent: &agent,
            cancel: &cancel,
            cache: &mut cache,
            agent_calls: 0,
        };

        let err = seeder
            .seed(&term("CL_4"), &mut StdRng::seed_from_u64(3))
            .expect_err("malformed response must abort");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedSeedResponse { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn unchanged_definition_counts_as_malformed() {
        let (_dir, mut cache) = empty_cache();
        let agent = ScriptedAgent::new(&[
            r#"{"updated_definition": "A cell found in the retina.", "false_assertion": "x"}"#,
        ]);
        let cancel = CancelToken::new();
        let mut seeder = Seeder {
            probability: 1.0,
            agent: &agent,
            cancel: &cancel,
            cache: &mut cache,
            agent_calls: 0,
        };

        assert!(
            seeder
                .seed(&term("CL_5"), &mut StdRng::seed_from_u64(3))
                .is_err()
        );
    }
}
