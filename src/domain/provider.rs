use serde::{Deserialize, Serialize};

/// Upstream model provider backing an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    OpenAi,
    Google,
}

/// Per-provider request and token ceilings, per organization.
///
/// These are the advertised platform limits, not the per-account tier
/// limits (see [`AccountTier`](super::account::AccountTier)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Requests per minute
    pub rpm: u64,
    /// Requests per hour
    pub rph: u64,
    /// Tokens per minute
    pub tpm: u64,
    /// Tokens per day
    pub tpd: u64,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
        }
    }

    /// Baked-in platform limits for this provider
    pub fn limits(&self) -> ProviderLimits {
        match self {
            Provider::Anthropic => ProviderLimits {
                rpm: 60,
                rph: 2_000,
                tpm: 100_000,
                tpd: 5_000_000,
            },
            Provider::OpenAi => ProviderLimits {
                rpm: 500,
                rph: 10_000,
                tpm: 200_000,
                tpd: 10_000_000,
            },
            Provider::Google => ProviderLimits {
                rpm: 360,
                rph: 6_000,
                tpm: 120_000,
                tpd: 6_000_000,
            },
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
