use std::collections::BTreeSet;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{PrepareError, Result};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Source of raw config values, keyed by full env var name.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read a profiled value: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_opt(lookup: Lookup, profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = lookup(&prefixed).filter(|s| !s.is_empty()) {
            return Some(v);
        }
    }
    lookup(key).filter(|s| !s.is_empty())
}

fn profiled_bool(lookup: Lookup, profile: &str, key: &str, default: bool) -> Result<bool> {
    match profiled_opt(lookup, profile, key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(PrepareError::Config(format!(
                "{key}: expected a boolean, got {other:?}"
            ))),
        },
    }
}

fn profiled_list(lookup: Lookup, profile: &str, key: &str) -> BTreeSet<String> {
    profiled_opt(lookup, profile, key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub fusion: FusionConfig,
    pub assignment: AssignmentConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CHUNKFLOW_PROFILE`. When set (e.g. `BATCH`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self> {
        let profile = env_opt("CHUNKFLOW_PROFILE").unwrap_or_default();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self> {
        Self::from_lookup(profile, &env_opt)
    }

    /// Build config from an arbitrary key/value source.
    pub fn from_lookup(profile: &str, lookup: Lookup) -> Result<Self> {
        let p = profile.to_uppercase();
        Ok(Self {
            fusion: FusionConfig::from_lookup(lookup, &p)?,
            assignment: AssignmentConfig::from_lookup(lookup, &p)?,
            profile: p,
        })
    }

    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| PrepareError::Config(e.to_string()))
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  fusion:      enabled={}, fuse_sources={}, fusable={:?}, unfusable={:?}",
            self.fusion.enabled,
            self.fusion.fuse_sources,
            self.fusion.fusable_kinds,
            self.fusion.unfusable_kinds
        );
        tracing::info!(
            "  assignment:  reseed_within_worker={}, overflow={}",
            self.assignment.reseed_within_worker,
            self.assignment.overflow
        );
    }
}

// ── Fusion ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub enabled: bool,
    /// When false, initial (data source) operands are never fused.
    pub fuse_sources: bool,
    /// Allow list of operand kinds. Empty means every kind may be fused.
    pub fusable_kinds: BTreeSet<String>,
    /// Deny list of operand kinds. Wins over `fusable_kinds`.
    pub unfusable_kinds: BTreeSet<String>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fuse_sources: true,
            fusable_kinds: BTreeSet::new(),
            unfusable_kinds: BTreeSet::new(),
        }
    }
}

impl FusionConfig {
    fn from_lookup(lookup: Lookup, p: &str) -> Result<Self> {
        Ok(Self {
            enabled: profiled_bool(lookup, p, "CHUNKFLOW_FUSION_ENABLED", true)?,
            fuse_sources: profiled_bool(lookup, p, "CHUNKFLOW_FUSE_SOURCES", true)?,
            fusable_kinds: profiled_list(lookup, p, "CHUNKFLOW_FUSABLE_KINDS"),
            unfusable_kinds: profiled_list(lookup, p, "CHUNKFLOW_UNFUSABLE_KINDS"),
        })
    }

    /// Whether an operand of `kind` may take part in a fused chain.
    pub fn is_fusable_kind(&self, kind: &str, is_initial: bool) -> bool {
        if is_initial && !self.fuse_sources {
            return false;
        }
        if self.unfusable_kinds.contains(kind) {
            return false;
        }
        self.fusable_kinds.is_empty() || self.fusable_kinds.contains(kind)
    }
}

// ── Assignment ────────────────────────────────────────────────

/// What to do with initial operands still unassigned after every worker
/// has had one traversal pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Run further passes over workers still below the per-worker average, in worker order.
    #[default]
    CycleWorkers,
    /// Hand each leftover operand to the currently least-loaded worker.
    LeastLoaded,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::CycleWorkers => write!(f, "cycle_workers"),
            OverflowPolicy::LeastLoaded => write!(f, "least_loaded"),
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = PrepareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cycle_workers" | "cycle" => Ok(OverflowPolicy::CycleWorkers),
            "least_loaded" | "round_robin" => Ok(OverflowPolicy::LeastLoaded),
            other => Err(PrepareError::Config(format!(
                "unknown overflow policy {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Keep filling a worker from further components until it reaches the
    /// per-worker average. When false a worker's pass ends with its first component.
    pub reseed_within_worker: bool,
    pub overflow: OverflowPolicy,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            reseed_within_worker: true,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl AssignmentConfig {
    fn from_lookup(lookup: Lookup, p: &str) -> Result<Self> {
        let overflow = match profiled_opt(lookup, p, "CHUNKFLOW_OVERFLOW_POLICY") {
            Some(v) => v.parse()?,
            None => OverflowPolicy::default(),
        };
        Ok(Self {
            reseed_within_worker: profiled_bool(lookup, p, "CHUNKFLOW_RESEED_WITHIN_WORKER", true)?,
            overflow,
        })
    }
}
