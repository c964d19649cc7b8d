//! Token-cost estimation.
//!
//! Providers that report usage but no dollar cost get an estimate from a
//! small prefix-matched pricing table (USD per million tokens). Unknown
//! models estimate to nothing; cost then stays unset on the session.

use crate::types::{GenerationCost, ModelRecord, Usage};

/// (model-id prefix, input $/mtok, output $/mtok)
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.00, 8.00),
    ("o3-mini", 1.10, 4.40),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
];

/// Estimate the dollar cost of one generation.
///
/// Per-record rates win over the static table; returns `None` when neither
/// is available.
pub fn estimate_cost(record: &ModelRecord, usage: &Usage) -> Option<GenerationCost> {
    let (input_rate, output_rate) = match (record.input_cost_per_mtok, record.output_cost_per_mtok)
    {
        (Some(input), Some(output)) => (input, output),
        _ => lookup(&record.provider_model_id)?,
    };

    let input_cost = usage.input_tokens as f64 / 1_000_000.0 * input_rate;
    let output_cost = usage.output_tokens as f64 / 1_000_000.0 * output_rate;
    Some(GenerationCost {
        input_cost_usd: Some(input_cost),
        output_cost_usd: Some(output_cost),
        total_cost_usd: Some(input_cost + output_cost),
    })
}

fn lookup(model_id: &str) -> Option<(f64, f64)> {
    PRICING
        .iter()
        .find(|(prefix, _, _)| model_id.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model_id: &str) -> ModelRecord {
        ModelRecord {
            id: format!("openai/{model_id}"),
            provider: "openai".into(),
            provider_model_id: model_id.into(),
            supports_tools: true,
            supports_vision: false,
            input_cost_per_mtok: None,
            output_cost_per_mtok: None,
        }
    }

    #[test]
    fn table_lookup_prefers_longer_prefix() {
        // gpt-4o-mini must not hit the gpt-4o row.
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            total_tokens: 1_000_000,
        };
        let cost = estimate_cost(&record("gpt-4o-mini-2024"), &usage).unwrap();
        assert!((cost.input_cost_usd.unwrap() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn record_rates_win_over_table() {
        let mut rec = record("gpt-4o");
        rec.input_cost_per_mtok = Some(1.0);
        rec.output_cost_per_mtok = Some(2.0);
        let usage = Usage {
            input_tokens: 500_000,
            output_tokens: 500_000,
            total_tokens: 1_000_000,
        };
        let cost = estimate_cost(&rec, &usage).unwrap();
        assert!((cost.total_cost_usd.unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_estimates_to_nothing() {
        let usage = Usage::default();
        assert!(estimate_cost(&record("mystery-model"), &usage).is_none());
    }
}
