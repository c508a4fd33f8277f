//! Workflow definitions: the ordered step templates a session runs
//!
//! Definitions come from a YAML file or from the built-in default pipeline.
//! They are immutable once a session starts; only step progress changes.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use stepflow_sdk::Step;

use crate::state::WorkflowState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,
    pub title: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Workflow-wide system instruction; the engine falls back to its
    /// built-in default when absent
    #[serde(default)]
    pub system_instruction: Option<String>,
    pub steps: Vec<StepTemplate>,
}

impl WorkflowDefinition {
    /// The built-in pipeline used when no definition file is given
    pub fn default_pipeline() -> Self {
        Self {
            name: "Product Development Pipeline".to_string(),
            system_instruction: None,
            steps: vec![
                StepTemplate {
                    id: "outline".to_string(),
                    title: "Product Outline".to_string(),
                    prompt: "Draft a concise product outline for a mobile app that helps \
                             distributed teams run asynchronous standups. Cover the core \
                             problem, the target users, and the top five features."
                        .to_string(),
                },
                StepTemplate {
                    id: "spec".to_string(),
                    title: "Functional Specification".to_string(),
                    prompt: "Write a functional specification for the features in the product \
                             outline. For each feature describe the user-facing behavior, the \
                             inputs and outputs, and the main edge cases."
                        .to_string(),
                },
                StepTemplate {
                    id: "architecture".to_string(),
                    title: "Technical Architecture".to_string(),
                    prompt: "Propose a technical architecture for the specified product: \
                             client structure, backend services, data model, and the key \
                             third-party integrations. Justify the major choices briefly."
                        .to_string(),
                },
                StepTemplate {
                    id: "plan".to_string(),
                    title: "Implementation Plan".to_string(),
                    prompt: "Break the architecture into a milestone-based implementation \
                             plan. Each milestone needs a goal, a rough scope, and the risks \
                             that could push it out."
                        .to_string(),
                },
                StepTemplate {
                    id: "announcement".to_string(),
                    title: "Launch Announcement".to_string(),
                    prompt: "Write a launch announcement blog post for the product, aimed at \
                             team leads. Lead with the problem, keep it under 600 words."
                        .to_string(),
                },
            ],
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow definition: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Self =
            serde_yaml::from_str(yaml).context("Failed to parse workflow definition YAML")?;
        definition.validate()?;
        Ok(definition)
    }

    /// A definition is usable when it has at least one step and every step
    /// id is non-empty and unique.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail!("workflow definition `{}` has no steps", self.name);
        }
        let mut seen = std::collections::HashSet::new();
        for template in &self.steps {
            if template.id.trim().is_empty() {
                bail!("workflow definition `{}` has a step with an empty id", self.name);
            }
            if !seen.insert(template.id.as_str()) {
                bail!(
                    "workflow definition `{}` has a duplicate step id `{}`",
                    self.name,
                    template.id
                );
            }
        }
        Ok(())
    }

    /// Fresh session state for this definition
    pub fn initial_state(&self, selected_model: impl Into<String>) -> WorkflowState {
        let steps = self
            .steps
            .iter()
            .map(|t| Step::new(t.id.clone(), t.title.clone(), t.prompt.clone()))
            .collect();
        WorkflowState::new(steps, selected_model)
    }
}
