//! Simulated providers for backends that are not wired up yet
//!
//! These obey the full provider contract, including a bounded artificial
//! delay, so the engine observes the same timing shape as a remote call.
//! Output is deterministic for a given prompt/context pair.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use stepflow_sdk::{async_trait, Provider, ProviderMetadata, ProviderResult};

const MIN_DELAY_MS: u64 = 250;
const DELAY_SPREAD_MS: u64 = 750;

pub struct SimulatedProvider {
    id: String,
    name: String,
    description: String,
}

impl SimulatedProvider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        }
    }

    /// Stand-in for an Anthropic backend
    pub fn claude() -> Self {
        Self::new(
            "claude-sonnet-sim",
            "Claude Sonnet (simulated)",
            "Offline stand-in for an Anthropic backend that is not integrated yet",
        )
    }

    /// Stand-in for an OpenAI backend
    pub fn gpt() -> Self {
        Self::new(
            "gpt-4o-sim",
            "GPT-4o (simulated)",
            "Offline stand-in for an OpenAI backend that is not integrated yet",
        )
    }
}

fn seed(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            local: true,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        _system_instruction: &str,
        context: &str,
    ) -> ProviderResult<String> {
        let delay_ms = MIN_DELAY_MS + seed(prompt) % DELAY_SPREAD_MS;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let headline: String = prompt
            .lines()
            .next()
            .unwrap_or("the requested task")
            .chars()
            .take(80)
            .collect();
        let prior_steps = context.matches("[Step:").count();
        let grounding = if prior_steps == 0 {
            "Starting from a clean slate with no prior step output.".to_string()
        } else {
            format!(
                "Building on the output of {} previously approved step(s).",
                prior_steps
            )
        };

        Ok(format!(
            "[{} — simulated response]\n\nDeliverable for: {}\n\n{}\n\nThis is placeholder \
             content produced by an offline backend. It follows the requested structure so the \
             review flow can be exercised end to end; swap in a live provider for real output.\n\
             (determinism token: {:x})",
            self.name,
            headline,
            grounding,
            seed(prompt) ^ seed(context)
        ))
    }
}
