//! Thinking-budget and max-tokens interaction.
//!
//! The thinking budget and the visible output share one hard cap on some
//! backends; exceeding it is answered with a rate-limit error rather than a
//! validation error, so the clamp happens here, pre-send.

use aero_core::config::{MIN_MAX_TOKENS, MIN_OUTPUT_TOKENS, THINKING_HARD_CAP};
use tracing::debug;

/// Result of clamping a (max_tokens, thinking_budget) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustedBudget {
    pub max_tokens: u32,
    pub thinking_budget: u32,
}

/// Enforce `budget + MIN_OUTPUT_TOKENS <= THINKING_HARD_CAP` by lowering the
/// budget, then raise `max_tokens` to cover the budget plus output headroom,
/// flooring it at `MIN_MAX_TOKENS` so long-form answers are not truncated.
pub fn adjust(max_tokens: u32, thinking_budget: u32) -> AdjustedBudget {
    let mut budget = thinking_budget;
    if budget + MIN_OUTPUT_TOKENS > THINKING_HARD_CAP {
        budget = THINKING_HARD_CAP - MIN_OUTPUT_TOKENS;
        debug!(
            requested = thinking_budget,
            clamped = budget,
            "thinking budget lowered to fit the hard cap"
        );
    }

    let mut max = max_tokens.max(budget + MIN_OUTPUT_TOKENS);
    if max < MIN_MAX_TOKENS {
        max = MIN_MAX_TOKENS;
    }

    AdjustedBudget {
        max_tokens: max,
        thinking_budget: budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_equal_to_cap_is_lowered() {
        let adjusted = adjust(THINKING_HARD_CAP, THINKING_HARD_CAP);
        assert!(adjusted.thinking_budget < THINKING_HARD_CAP);
        assert_eq!(
            adjusted.thinking_budget,
            THINKING_HARD_CAP - MIN_OUTPUT_TOKENS
        );
        assert!(adjusted.max_tokens >= adjusted.thinking_budget + MIN_OUTPUT_TOKENS);
    }

    #[test]
    fn small_budget_untouched() {
        let adjusted = adjust(20_000, 4_096);
        assert_eq!(adjusted.thinking_budget, 4_096);
        assert_eq!(adjusted.max_tokens, 20_000);
    }

    #[test]
    fn max_tokens_raised_over_budget() {
        let adjusted = adjust(2_048, 20_000);
        assert_eq!(adjusted.thinking_budget, 20_000);
        assert!(adjusted.max_tokens >= 20_000 + MIN_OUTPUT_TOKENS);
    }

    #[test]
    fn max_tokens_floored_for_thinking_requests() {
        let adjusted = adjust(1_024, 1_024);
        assert_eq!(adjusted.max_tokens, MIN_MAX_TOKENS);
    }
}
