//! Quota policy: daily allotments per plan and token cost per generation.
//!
//! Everything here is pure. The consumption service consults the policy before it touches the
//! store, so nothing in this module performs I/O or can fail.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentinel reported for balances and limits of unlimited plans.
pub const UNLIMITED_TOKENS: u64 = 999_999_999;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Standard,
    Plus,
    Premium,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Standard => "standard",
            Plan::Plus => "plus",
            Plan::Premium => "premium",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "standard" => Ok(Plan::Standard),
            "plus" => Ok(Plan::Plus),
            "premium" => Ok(Plan::Premium),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudyMode {
    Quick,
    Standard,
    Deep,
    Lectio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DailyLimit {
    Limited(u64),
    Unlimited,
}

impl DailyLimit {
    pub fn tokens(self) -> u64 {
        match self {
            DailyLimit::Limited(limit) => limit,
            DailyLimit::Unlimited => UNLIMITED_TOKENS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimits {
    #[serde(default = "default_free_limit")]
    pub free: Option<u64>,
    #[serde(default = "default_standard_limit")]
    pub standard: Option<u64>,
    #[serde(default = "default_plus_limit")]
    pub plus: Option<u64>,
    /// `None` means unlimited.
    #[serde(default)]
    pub premium: Option<u64>,
}

impl Default for DailyLimits {
    fn default() -> Self {
        Self {
            free: default_free_limit(),
            standard: default_standard_limit(),
            plus: default_plus_limit(),
            premium: None,
        }
    }
}

fn default_free_limit() -> Option<u64> {
    Some(8)
}

fn default_standard_limit() -> Option<u64> {
    Some(20)
}

fn default_plus_limit() -> Option<u64> {
    Some(50)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModePercents {
    pub quick: u64,
    pub standard: u64,
    pub deep: u64,
    pub lectio: u64,
}

impl Default for ModePercents {
    fn default() -> Self {
        Self {
            quick: 50,
            standard: 100,
            deep: 150,
            lectio: 150,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub daily_limits: DailyLimits,
    #[serde(default = "default_english_base_cost")]
    pub english_base_cost: u64,
    #[serde(default = "default_other_language_base_cost")]
    pub other_language_base_cost: u64,
    #[serde(default)]
    pub mode_percents: ModePercents,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            daily_limits: DailyLimits::default(),
            english_base_cost: default_english_base_cost(),
            other_language_base_cost: default_other_language_base_cost(),
            mode_percents: ModePercents::default(),
        }
    }
}

fn default_english_base_cost() -> u64 {
    10
}

fn default_other_language_base_cost() -> u64 {
    20
}

#[derive(Clone, Debug, Default)]
pub struct QuotaPolicy {
    config: PolicyConfig,
}

impl QuotaPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Tokens charged for one generation. Never below 1.
    pub fn calculate_token_cost(&self, language: &str, mode: StudyMode) -> u64 {
        let base = if is_english(language) {
            self.config.english_base_cost
        } else {
            self.config.other_language_base_cost
        };
        let percent = match mode {
            StudyMode::Quick => self.config.mode_percents.quick,
            StudyMode::Standard => self.config.mode_percents.standard,
            StudyMode::Deep => self.config.mode_percents.deep,
            StudyMode::Lectio => self.config.mode_percents.lectio,
        };
        base.saturating_mul(percent).div_ceil(100).max(1)
    }

    pub fn daily_limit(&self, plan: Plan) -> DailyLimit {
        let limits = &self.config.daily_limits;
        let limit = match plan {
            Plan::Free => limits.free,
            Plan::Standard => limits.standard,
            Plan::Plus => limits.plus,
            Plan::Premium => limits.premium,
        };
        match limit {
            Some(limit) => DailyLimit::Limited(limit),
            None => DailyLimit::Unlimited,
        }
    }

    pub fn is_unlimited_plan(&self, plan: Plan) -> bool {
        matches!(self.daily_limit(plan), DailyLimit::Unlimited)
    }
}

fn is_english(language: &str) -> bool {
    let language = language.trim();
    language.is_empty()
        || language.eq_ignore_ascii_case("en")
        || language.eq_ignore_ascii_case("english")
        || language
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("en-"))
}
