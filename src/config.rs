//! Configuration types.
//!
//! Every knob is enumerated here with its default, and the effective values
//! are logged at startup. `from_env()` reads `ENRICH_*` variables; anything
//! unset keeps the default below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::ConfigError;

/// Top-level configuration for the enrichment subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentConfig {
    /// Master switch. When off every candidate goes straight to the fallback chain.
    pub enabled: bool,
    pub scoring: ScoringConfig,
    pub budget: BudgetConfig,
    pub breaker: BreakerConfig,
    pub timeouts: TimeoutConfig,
    pub state: StateConfig,
}

/// Eligibility scoring inputs.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringConfig {
    /// Minimum score for a candidate to be worth an enrichment call.
    pub trigger_threshold: i64,
    /// Engagement at or above this counts as high engagement.
    pub min_engagement: i64,
    pub target_communities: Vec<String>,
    pub trigger_keywords: Vec<String>,
    pub known_domains: Vec<String>,
    /// Domains that host the posts themselves; linking to them is not an external link.
    pub self_hosted_domains: Vec<String>,
    /// Regexes for the product/brand mention heuristic.
    pub product_patterns: Vec<String>,
    /// Bodies shorter than this (in characters) count as minimal text.
    pub minimal_text_length: usize,
}

/// Daily quota.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetConfig {
    pub daily_limit: u32,
    pub daily_cost_limit: Decimal,
    /// Estimated cost reserved before each call.
    pub cost_per_call: Decimal,
    /// Holds older than this are treated as abandoned and released.
    #[serde(with = "secs")]
    pub reservation_grace: Duration,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub recovery_timeout: Duration,
}

/// Deadlines for every blocking operation.
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutConfig {
    /// Enrichment provider call.
    #[serde(with = "secs")]
    pub call: Duration,
    /// Each fallback summarization step.
    #[serde(with = "secs")]
    pub summary: Duration,
    /// Acquiring a state record for a read-modify-write cycle.
    #[serde(with = "secs")]
    pub lock: Duration,
    /// Lock files older than this are left over from a crashed run.
    #[serde(with = "secs")]
    pub stale_lock_after: Duration,
}

/// Where budget and breaker records live.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StateConfig {
    /// One JSON file per record under `dir`.
    File { dir: PathBuf },
    /// A libSQL database file.
    Libsql { path: PathBuf },
}

/// Default product-mention heuristics: versioned names, tech-acronym
/// suffixes, "launched X", and "X just launched".
pub const DEFAULT_PRODUCT_PATTERNS: &[&str] = &[
    r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?\s+(?:v\d|version|release|beta|alpha)\b",
    r"\b[A-Z][a-zA-Z]*(?:AI|API|SDK|CLI|IDE|OS)\b",
    r"\b(?:launched|released|announced)\s+([A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*)",
    r"\b([A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)?)\s+(?:just|now|today)\s+(?:launched|released)",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 40,
            min_engagement: 15,
            target_communities: strings(&["SideProject", "ClaudeCode", "ClaudeAI", "AI_Agents"]),
            trigger_keywords: strings(&[
                "launched",
                "released",
                "new version",
                "pricing",
                "acquired",
                "funding",
                "announcement",
                "beta",
                "available now",
                "update",
                "feature",
            ]),
            known_domains: strings(&[
                "github.com",
                "producthunt.com",
                "ycombinator.com",
                "techcrunch.com",
                "apps.apple.com",
                "play.google.com",
            ]),
            self_hosted_domains: strings(&["reddit.com", "imgur.com", "i.redd.it"]),
            product_patterns: strings(DEFAULT_PRODUCT_PATTERNS),
            minimal_text_length: 100,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: 15,
            daily_cost_limit: dec!(1.50),
            cost_per_call: dec!(0.03),
            reservation_grace: Duration::from_secs(900), // 15 minutes
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(1800), // 30 minutes
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(60),
            summary: Duration::from_secs(30),
            lock: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::File {
            dir: PathBuf::from("./data/state"),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scoring: ScoringConfig::default(),
            budget: BudgetConfig::default(),
            breaker: BreakerConfig::default(),
            timeouts: TimeoutConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl EnrichmentConfig {
    /// Build configuration from `ENRICH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let d = Self::default();

        let state = match env.raw("ENRICH_STATE_BACKEND").as_deref() {
            None | Some("file") => StateConfig::File {
                dir: env
                    .raw("ENRICH_STATE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/state")),
            },
            Some("libsql") => StateConfig::Libsql {
                path: env
                    .raw("ENRICH_STATE_DB")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/enrich-state.db")),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "ENRICH_STATE_BACKEND".into(),
                    message: format!("expected 'file' or 'libsql', got '{other}'"),
                });
            }
        };

        let Self {
            enabled,
            scoring: sc,
            budget: bu,
            breaker: br,
            timeouts: to,
            ..
        } = d;

        let config = Self {
            enabled: env.parse_bool("ENRICH_ENABLED", enabled)?,
            scoring: ScoringConfig {
                trigger_threshold: env.parse("ENRICH_TRIGGER_THRESHOLD", sc.trigger_threshold)?,
                min_engagement: env.parse("ENRICH_MIN_ENGAGEMENT", sc.min_engagement)?,
                target_communities: env.list("ENRICH_TARGET_COMMUNITIES", sc.target_communities),
                trigger_keywords: env.list("ENRICH_TRIGGER_KEYWORDS", sc.trigger_keywords),
                known_domains: env.list("ENRICH_KNOWN_DOMAINS", sc.known_domains),
                self_hosted_domains: env.list("ENRICH_SELF_HOSTED_DOMAINS", sc.self_hosted_domains),
                product_patterns: env.list_sep("ENRICH_PRODUCT_PATTERNS", ';', sc.product_patterns),
                minimal_text_length: env
                    .parse("ENRICH_MINIMAL_TEXT_LENGTH", sc.minimal_text_length)?,
            },
            budget: BudgetConfig {
                daily_limit: env.parse("ENRICH_DAILY_LIMIT", bu.daily_limit)?,
                daily_cost_limit: env.parse("ENRICH_DAILY_COST_LIMIT", bu.daily_cost_limit)?,
                cost_per_call: env.parse("ENRICH_COST_PER_CALL", bu.cost_per_call)?,
                reservation_grace: env
                    .secs("ENRICH_RESERVATION_GRACE_SECS", bu.reservation_grace)?,
            },
            breaker: BreakerConfig {
                failure_threshold: env.parse("ENRICH_FAILURE_THRESHOLD", br.failure_threshold)?,
                recovery_timeout: env.secs("ENRICH_RECOVERY_TIMEOUT_SECS", br.recovery_timeout)?,
            },
            timeouts: TimeoutConfig {
                call: env.secs("ENRICH_CALL_TIMEOUT_SECS", to.call)?,
                summary: env.secs("ENRICH_SUMMARY_TIMEOUT_SECS", to.summary)?,
                lock: env.secs("ENRICH_LOCK_TIMEOUT_SECS", to.lock)?,
                stale_lock_after: env.secs("ENRICH_STALE_LOCK_SECS", to.stale_lock_after)?,
            },
            state,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the subsystem misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.into(),
                message: message.into(),
            }
        }

        if self.budget.daily_limit < 1 {
            return Err(invalid("daily_limit", "must be at least 1"));
        }
        if self.budget.daily_cost_limit <= Decimal::ZERO {
            return Err(invalid("daily_cost_limit", "must be positive"));
        }
        if self.budget.cost_per_call <= Decimal::ZERO {
            return Err(invalid("cost_per_call", "must be positive"));
        }
        if self.budget.cost_per_call > self.budget.daily_cost_limit {
            return Err(invalid("cost_per_call", "must not exceed daily_cost_limit"));
        }
        if self.scoring.min_engagement < 0 {
            return Err(invalid("min_engagement", "must be non-negative"));
        }
        if self.breaker.failure_threshold < 1 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if self.breaker.recovery_timeout.is_zero() {
            return Err(invalid("recovery_timeout", "must be positive"));
        }
        for (key, value) in [
            ("call_timeout", self.timeouts.call),
            ("summary_timeout", self.timeouts.summary),
            ("lock_timeout", self.timeouts.lock),
            ("stale_lock_after", self.timeouts.stale_lock_after),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be positive"));
            }
        }
        Ok(())
    }
}

/// Typed access to a key lookup.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.into(),
                message: format!("'{v}': {e}"),
            }),
        }
    }

    fn parse_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key).map(|v| v.to_lowercase()).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                key: key.into(),
                message: format!("'{other}' is not a boolean"),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        self.list_sep(key, ',', default)
    }

    fn list_sep(&self, key: &str, sep: char, default: Vec<String>) -> Vec<String> {
        match self.raw(key) {
            None => default,
            Some(v) => v
                .split(sep)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
