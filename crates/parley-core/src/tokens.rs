use serde::{Deserialize, Serialize};

/// Per-turn token usage, raw from provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_creation_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Total prompt-side consumption. Cache reads and writes are reported
    /// separately from `input_tokens` and are mutually exclusive with it.
    pub fn total_input(&self) -> u64 {
        u64::from(self.input_tokens)
            + u64::from(self.cache_read_tokens)
            + u64::from(self.cache_creation_tokens)
    }
}

/// Session-level accumulated totals. Only ever grows; updated once per
/// completed assistant turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turn_count: u32,
}

impl TokenAccount {
    pub fn record(&mut self, usage: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.total_input());
        self.output_tokens = self.output_tokens.saturating_add(u64::from(usage.output_tokens));
        self.turn_count = self.turn_count.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}
