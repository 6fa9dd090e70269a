//! Token usage accumulation and cost estimation.
//!
//! Prices are USD per million tokens, looked up by exact model id. Models
//! missing from the table get no estimate rather than a guessed one.

use crate::inference::types::TokenUsage;

use super::types::TurnUsage;

/// `(model id, input per million, output per million)`.
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("gpt-4", 30.0, 60.0),
    ("gpt-4-32k", 60.0, 120.0),
    ("gpt-4-turbo", 10.0, 30.0),
    ("gpt-4o", 2.50, 10.0),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4.1", 2.0, 8.0),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-3.5-turbo", 0.50, 1.50),
];

/// `(input_per_million, output_per_million)` for an exact model id.
pub fn model_rates(model: &str) -> Option<(f64, f64)> {
    PRICE_TABLE
        .iter()
        .find(|(id, _, _)| *id == model)
        .map(|&(_, input, output)| (input, output))
}

/// Cost in USD, or `None` for a model without a price.
pub fn estimate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
    let (input_per_m, output_per_m) = model_rates(model)?;
    let input_cost = (prompt_tokens as f64 / 1_000_000.0) * input_per_m;
    let output_cost = (completion_tokens as f64 / 1_000_000.0) * output_per_m;
    Some(input_cost + output_cost)
}

/// Sums usage across every completion call of one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageAccumulator {
    prompt_tokens: u64,
    completion_tokens: u64,
    calls: u32,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, usage: &TokenUsage) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.calls += 1;
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn estimated_cost(&self, model: &str) -> Option<f64> {
        estimate_cost(model, self.prompt_tokens, self.completion_tokens)
    }

    pub fn finish(&self, model: &str) -> TurnUsage {
        TurnUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            completion_calls: self.calls,
            estimated_cost: self.estimated_cost(model),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32) -> TokenUsage {
        TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    #[test]
    fn test_accumulates_across_calls() {
        let mut acc = UsageAccumulator::new();
        acc.add(&usage(100, 20));
        acc.add(&usage(150, 30));
        assert_eq!(acc.prompt_tokens(), 250);
        assert_eq!(acc.completion_tokens(), 50);
        assert_eq!(acc.calls(), 2);
    }

    #[test]
    fn test_known_model_cost() {
        let cost = estimate_cost("gpt-4", 1_000_000, 500_000).unwrap();
        assert!((cost - 60.0).abs() < 1e-9);

        let cost = estimate_cost("gpt-4o-mini", 2_000_000, 1_000_000).unwrap();
        assert!((cost - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_is_exact() {
        assert!(model_rates("gpt-4o").is_some());
        assert!(model_rates("gpt-4o-2024-08-06").is_none());
        assert!(model_rates("GPT-4").is_none());
        assert!(estimate_cost("llama3", 1000, 1000).is_none());
    }

    #[test]
    fn test_finish_builds_turn_usage() {
        let mut acc = UsageAccumulator::new();
        acc.add(&usage(1000, 100));
        let turn = acc.finish("gpt-3.5-turbo");
        assert_eq!(turn.total_tokens(), 1100);
        assert_eq!(turn.completion_calls, 1);
        let cost = turn.estimated_cost.unwrap();
        assert!((cost - 0.00065).abs() < 1e-12);

        assert!(acc.finish("unknown-model").estimated_cost.is_none());
    }
}
