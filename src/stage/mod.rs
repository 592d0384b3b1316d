//! Pipeline stages.
//!
//! The orchestrator treats each stage as an opaque unit of work: it hands a
//! [`StageInput`] to a [`StageRunner`] and gets back a [`StageOutput`] or a
//! typed [`StageError`]. Output is then checked against the stage's
//! [`StageContract`]; structurally valid but insufficient output is a failure
//! just like a crash.

pub mod command;
pub mod logging;

pub use command::CommandStageRunner;
pub use logging::LoggingStageRunner;

use crate::config::StageConfig;
use crate::errors::StageError;
use crate::profile::Profile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Evaluator scores must fall in this range.
pub const SCORE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=10.0;

/// What a stage receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub cycle: u32,
    pub attempt: u32,
    pub stage: String,
    /// 1-based position of the stage within the pipeline.
    pub position: usize,
    pub profile: Profile,
    /// Output of the previous stage in this attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<StageOutput>,
}

/// What a stage produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: String,
    #[serde(default = "empty_object")]
    pub structured: serde_json::Value,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl StageOutput {
    pub fn text(stage: &str, text: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            structured: empty_object(),
            text: text.into(),
            score: None,
        }
    }

    pub fn with_structured(mut self, structured: serde_json::Value) -> Self {
        self.structured = structured;
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Per-invocation environment: the current dependency endpoints, re-read
/// from their slots right before the stage runs.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub env: BTreeMap<String, String>,
}

/// One external stage.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run the stage. Implementations must stop promptly when the returned
    /// future is dropped; that is how the cycle deadline cancels them.
    async fn run(&self, input: &StageInput, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

/// Minimum shape a stage's output must have.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageContract {
    pub required_fields: Vec<String>,
    pub min_chars: usize,
}

impl StageContract {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            required_fields: config.required_fields.clone(),
            min_chars: config.min_chars,
        }
    }

    pub fn validate(&self, output: &StageOutput) -> Result<(), StageError> {
        let stage = output.stage.as_str();

        if !output.structured.is_object() {
            return Err(StageError::validation(
                stage,
                "structured output is not a JSON object",
            ));
        }
        for field in &self.required_fields {
            match output.structured.get(field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(StageError::validation(
                        stage,
                        format!("missing required field '{}'", field),
                    ));
                }
                Some(_) => {}
            }
        }

        let chars = output.text.chars().count();
        if chars < self.min_chars {
            return Err(StageError::validation(
                stage,
                format!("text output has {} chars, minimum is {}", chars, self.min_chars),
            ));
        }

        if let Some(score) = output.score
            && !SCORE_RANGE.contains(&score)
        {
            return Err(StageError::validation(
                stage,
                format!("score {} outside {:?}", score, SCORE_RANGE),
            ));
        }

        Ok(())
    }
}

/// A runner paired with the contract its output must satisfy.
#[derive(Clone)]
pub struct PipelineStage {
    pub runner: Arc<dyn StageRunner>,
    pub contract: StageContract,
}

impl PipelineStage {
    pub fn new(runner: Arc<dyn StageRunner>, contract: StageContract) -> Self {
        Self { runner, contract }
    }

    pub fn name(&self) -> &str {
        self.runner.name()
    }
}

/// Ordered stages of one cycle.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self { stages }
    }

    /// Build command-backed stages, each wrapped in the logging decorator.
    pub fn from_config(configs: &[StageConfig]) -> Self {
        let stages = configs
            .iter()
            .map(|config| {
                let runner = LoggingStageRunner::new(CommandStageRunner::from_config(config));
                PipelineStage::new(Arc::new(runner), StageContract::from_config(config))
            })
            .collect();
        Self { stages }
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract(fields: &[&str], min_chars: usize) -> StageContract {
        StageContract {
            required_fields: fields.iter().map(|s| s.to_string()).collect(),
            min_chars,
        }
    }

    #[test]
    fn test_valid_output_passes() {
        let output = StageOutput::text("review", "looks good overall")
            .with_structured(json!({"verdict": "pass"}))
            .with_score(7.5);
        contract(&["verdict"], 5).validate(&output).unwrap();
    }

    #[test]
    fn test_missing_field_fails_validation() {
        let output = StageOutput::text("review", "text");
        let err = contract(&["verdict"], 0).validate(&output).unwrap_err();
        assert!(matches!(err, StageError::Validation { .. }));
        assert!(err.to_string().contains("verdict"));
    }

    #[test]
    fn test_null_field_counts_as_missing() {
        let output = StageOutput::text("review", "text").with_structured(json!({"verdict": null}));
        assert!(contract(&["verdict"], 0).validate(&output).is_err());
    }

    #[test]
    fn test_short_text_fails_validation() {
        let output = StageOutput::text("write", "too short");
        let err = contract(&[], 100).validate(&output).unwrap_err();
        assert!(err.to_string().contains("minimum is 100"));
    }

    #[test]
    fn test_out_of_range_score_fails_validation() {
        let output = StageOutput::text("review", "ok").with_score(11.0);
        assert!(contract(&[], 0).validate(&output).is_err());
        let output = StageOutput::text("review", "ok").with_score(-0.1);
        assert!(contract(&[], 0).validate(&output).is_err());
    }

    #[test]
    fn test_non_object_structured_fails_validation() {
        let output = StageOutput::text("audit", "ok").with_structured(json!([1, 2]));
        assert!(contract(&[], 0).validate(&output).is_err());
    }

    #[test]
    fn test_output_deserializes_with_defaults() {
        let output: StageOutput = serde_json::from_str(r#"{"stage": "audit"}"#).unwrap();
        assert!(output.structured.is_object());
        assert!(output.text.is_empty());
        assert!(output.score.is_none());
    }

    #[test]
    fn test_pipeline_from_config_preserves_order() {
        let order = ["interview", "audit", "research", "write", "review"];
        let configs: Vec<StageConfig> = order
            .iter()
            .map(|name| StageConfig {
                name: name.to_string(),
                command: "true".into(),
                required_fields: vec![],
                min_chars: 0,
                env: Default::default(),
            })
            .collect();
        let pipeline = Pipeline::from_config(&configs);
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, order);
    }
}
