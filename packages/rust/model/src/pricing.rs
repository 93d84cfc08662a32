//! Per-model token pricing (USD per million tokens).

/// Input/output price per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Look up pricing by model family. Unknown models are billed at the sonnet rate.
pub fn model_price(model_id: &str) -> ModelPrice {
    let id = model_id.to_lowercase();
    let (input, output) = if id.contains("opus") {
        (15.0, 75.0)
    } else if id.contains("haiku") {
        (0.8, 4.0)
    } else {
        (3.0, 15.0)
    };
    ModelPrice {
        input_per_mtok: input,
        output_per_mtok: output,
    }
}

/// Cost of a single call.
pub fn estimate_cost_usd(model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let price = model_price(model_id);
    (input_tokens as f64 * price.input_per_mtok + output_tokens as f64 * price.output_per_mtok)
        / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haiku_is_cheaper_than_sonnet() {
        let sonnet = estimate_cost_usd("claude-sonnet-4-20250514", 1_000_000, 1_000_000);
        let haiku = estimate_cost_usd("claude-haiku-4-5-20251001", 1_000_000, 1_000_000);
        assert!((sonnet - 18.0).abs() < 1e-9);
        assert!((haiku - 4.8).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_default_rate() {
        assert_eq!(model_price("mystery-model"), model_price("claude-sonnet-4"));
    }
}
