//! Token budget enforcement.
//!
//! Every agent call carries a large fixed prompt overhead (system prompt,
//! tool and sub-agent descriptions, middleware scaffolding) on top of the
//! user's message. [`TokenBudgetManager`] estimates the full request size
//! and refuses requests that would exceed the provider's per-request
//! ceiling *before* any upstream call is made.
//!
//! Estimates are deliberately conservative. The manager never truncates;
//! a [`BudgetRejection`] tells the caller whether shortening the message
//! can help ([`RejectAdvice::Truncate`]) or not ([`RejectAdvice::Abandon`]).
//!
//! Providers with generous limits can have enforcement disabled. Disabling
//! skips the rejection only: estimates are still computed and recorded so
//! token metrics stay comparable across providers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::telemetry;

/// Strategy for counting tokens in text.
pub trait TokenEstimator: Send + Sync {
    /// Estimated token count. Must not under-count by more than a small margin.
    fn estimate(&self, text: &str) -> usize;
}

/// Character-ratio approximation.
///
/// ASCII text is counted at `chars_per_token` characters per token (rounded
/// up). Non-ASCII characters are counted as one token each, since scripts
/// such as CJK routinely tokenize at or near one token per character.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        let (ascii, other) = text.chars().fold((0usize, 0usize), |(a, o), c| {
            if c.is_ascii() { (a + 1, o) } else { (a, o + 1) }
        });
        ascii.div_ceil(self.chars_per_token) + other
    }
}

/// Fixed prompt overhead added to every agent request, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOverhead {
    pub system_prompt: usize,
    pub tool_descriptions: usize,
    pub subagent_descriptions: usize,
    pub filesystem_context: usize,
    pub middleware: usize,
    /// Added only when the request continues an existing conversation.
    pub memory_context: usize,
}

impl Default for RequestOverhead {
    fn default() -> Self {
        Self {
            system_prompt: 1120,
            tool_descriptions: 2000,
            subagent_descriptions: 2500,
            filesystem_context: 1000,
            middleware: 2500,
            memory_context: 300,
        }
    }
}

impl RequestOverhead {
    /// No overhead at all; useful for raw text budgets.
    pub fn none() -> Self {
        Self {
            system_prompt: 0,
            tool_descriptions: 0,
            subagent_descriptions: 0,
            filesystem_context: 0,
            middleware: 0,
            memory_context: 0,
        }
    }

    fn total(&self, continues_conversation: bool) -> usize {
        let base = self.system_prompt
            + self.tool_descriptions
            + self.subagent_descriptions
            + self.filesystem_context
            + self.middleware;
        if continues_conversation {
            base + self.memory_context
        } else {
            base
        }
    }
}

/// Per-provider budget settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderBudget {
    /// Ceiling for this provider; falls back to the global default.
    #[serde(default)]
    pub ceiling: Option<usize>,
    /// Whether rejection is enforced for this provider.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Budget manager configuration.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Global switch. When false, no provider is ever rejected. Default: true.
    pub enabled: bool,
    /// Ceiling used for providers without their own. Default: 100,000.
    pub default_ceiling: usize,
    /// Output tokens reserved on top of the input estimate. Default: 0.
    pub reserved_output_tokens: usize,
    pub overhead: RequestOverhead,
    pub providers: HashMap<String, ProviderBudget>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        // Local models and OpenRouter's high tiers don't need a client-side ceiling.
        for name in ["ollama", "openrouter"] {
            providers.insert(
                name.to_string(),
                ProviderBudget {
                    ceiling: None,
                    enabled: false,
                },
            );
        }
        Self {
            enabled: true,
            default_ceiling: 100_000,
            reserved_output_tokens: 0,
            overhead: RequestOverhead::default(),
            providers,
        }
    }
}

impl BudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn default_ceiling(mut self, ceiling: usize) -> Self {
        self.default_ceiling = ceiling;
        self
    }

    pub fn reserved_output_tokens(mut self, tokens: usize) -> Self {
        self.reserved_output_tokens = tokens;
        self
    }

    pub fn overhead(mut self, overhead: RequestOverhead) -> Self {
        self.overhead = overhead;
        self
    }

    pub fn provider(mut self, name: impl Into<String>, budget: ProviderBudget) -> Self {
        self.providers.insert(name.into(), budget);
        self
    }
}

/// Estimated size of one agent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestEstimate {
    /// Tokens attributable to the user's own text.
    pub user_tokens: usize,
    /// Fixed prompt overhead.
    pub overhead_tokens: usize,
    /// Tokens reserved for the response.
    pub output_tokens: usize,
}

impl RequestEstimate {
    pub fn input_tokens(&self) -> usize {
        self.user_tokens + self.overhead_tokens
    }

    pub fn total(&self) -> usize {
        self.input_tokens() + self.output_tokens
    }
}

/// What the caller should do about a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RejectAdvice {
    /// Shorten the user message by at least `reduce_by` tokens.
    Truncate {
        reduce_by: usize,
        max_user_tokens: usize,
    },
    /// The fixed overhead alone exceeds the ceiling; no truncation helps.
    Abandon,
}

/// Reason a request was refused by the budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetRejection {
    pub provider: String,
    pub estimated: usize,
    pub ceiling: usize,
    pub user_tokens: usize,
    pub overhead_tokens: usize,
    pub advice: RejectAdvice,
}

impl fmt::Display for BudgetRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request too large: estimated {} tokens (user message: ~{}, system overhead: ~{}) \
             exceeds limit of {} tokens.",
            self.estimated, self.user_tokens, self.overhead_tokens, self.ceiling
        )?;
        match self.advice {
            RejectAdvice::Truncate {
                reduce_by,
                max_user_tokens,
            } => {
                let pct = reduce_by * 100 / self.estimated.max(1);
                write!(
                    f,
                    " Please reduce your message size by approximately {reduce_by} tokens \
                     ({pct}% reduction needed). Maximum user message size: ~{max_user_tokens} tokens."
                )
            }
            RejectAdvice::Abandon => write!(
                f,
                " The request cannot be served by this provider at its current limit."
            ),
        }
    }
}

/// Per-call budget record.
///
/// Created when a request is granted; `consumed` is filled in after the call
/// from provider-reported usage and never blocks the in-flight call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBudget {
    pub request_id: String,
    pub provider: String,
    pub estimated_input_tokens: usize,
    pub estimated_output_tokens: usize,
    /// `None` when enforcement is disabled for the provider.
    pub max_allowed: Option<usize>,
    pub consumed: Option<usize>,
}

impl TokenBudget {
    /// Record provider-reported usage after the call completes.
    pub fn record_consumed(&mut self, input_tokens: usize, output_tokens: usize) {
        self.consumed = Some(input_tokens + output_tokens);
        metrics::counter!(telemetry::TOKENS_CONSUMED_TOTAL,
            "provider" => self.provider.clone(),
            "direction" => "input",
        )
        .increment(input_tokens as u64);
        metrics::counter!(telemetry::TOKENS_CONSUMED_TOTAL,
            "provider" => self.provider.clone(),
            "direction" => "output",
        )
        .increment(output_tokens as u64);
    }
}

/// Estimates request sizes and enforces per-provider ceilings.
pub struct TokenBudgetManager {
    config: BudgetConfig,
    estimator: Box<dyn TokenEstimator>,
}

impl TokenBudgetManager {
    /// Create a manager using the default character-ratio estimator.
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_estimator(config, Box::new(CharRatioEstimator::default()))
    }

    /// Create a manager with a custom estimator (e.g. a real tokenizer).
    pub fn with_estimator(config: BudgetConfig, estimator: Box<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Estimated token count for raw text.
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.estimator.estimate(text)
    }

    /// Estimate a full agent request, including prompt overhead.
    ///
    /// The user name is prepended to the message the same way the agent
    /// sees it, so it counts toward the user share.
    pub fn estimate_request(
        &self,
        message: &str,
        user_name: Option<&str>,
        conversation_id: Option<&str>,
    ) -> RequestEstimate {
        let user_tokens = match user_name.filter(|n| !n.is_empty()) {
            Some(name) => self.estimate(&format!("[User Name: {name}]\n\n{message}")),
            None => self.estimate(message),
        };
        RequestEstimate {
            user_tokens,
            overhead_tokens: self.config.overhead.total(conversation_id.is_some()),
            output_tokens: self.config.reserved_output_tokens,
        }
    }

    /// Effective ceiling for a provider, or `None` when enforcement is off.
    pub fn ceiling_for(&self, provider: &str) -> Option<usize> {
        if !self.config.enabled {
            return None;
        }
        match self.config.providers.get(provider) {
            Some(p) if !p.enabled => None,
            Some(p) => Some(p.ceiling.unwrap_or(self.config.default_ceiling)),
            None => Some(self.config.default_ceiling),
        }
    }

    /// Check an estimate against the provider's ceiling.
    ///
    /// On success returns the [`TokenBudget`] record for the call. Estimates
    /// are recorded even when enforcement is disabled.
    pub fn reserve(
        &self,
        request_id: impl Into<String>,
        provider: &str,
        estimate: &RequestEstimate,
    ) -> std::result::Result<TokenBudget, BudgetRejection> {
        let total = estimate.total();
        metrics::counter!(telemetry::TOKENS_ESTIMATED_TOTAL, "provider" => provider.to_owned())
            .increment(total as u64);

        let ceiling = self.ceiling_for(provider);
        if let Some(ceiling) = ceiling.filter(|c| total > *c) {
            metrics::counter!(telemetry::BUDGET_REJECTIONS_TOTAL, "provider" => provider.to_owned())
                .increment(1);
            let fixed = estimate.overhead_tokens + estimate.output_tokens;
            let advice = if fixed >= ceiling {
                RejectAdvice::Abandon
            } else {
                RejectAdvice::Truncate {
                    reduce_by: total - ceiling,
                    max_user_tokens: ceiling - fixed,
                }
            };
            return Err(BudgetRejection {
                provider: provider.to_owned(),
                estimated: total,
                ceiling,
                user_tokens: estimate.user_tokens,
                overhead_tokens: estimate.overhead_tokens,
                advice,
            });
        }

        debug!(
            provider,
            estimated = total,
            ceiling = ?ceiling,
            "token budget granted"
        );
        Ok(TokenBudget {
            request_id: request_id.into(),
            provider: provider.to_owned(),
            estimated_input_tokens: estimate.input_tokens(),
            estimated_output_tokens: estimate.output_tokens,
            max_allowed: ceiling,
            consumed: None,
        })
    }
}
