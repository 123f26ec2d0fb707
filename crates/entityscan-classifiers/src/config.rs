//! Declarative pattern group configuration
//!
//! Pattern groups are loaded from YAML:
//!
//! ```yaml
//! groups:
//!   - name: china_lake
//!     exclusion: true
//!     patterns:
//!       - regex: 'china\s+lake'
//!   - name: mcf_entity
//!     category: MCF entity
//!     priority: 1
//!     risk_tier: critical
//!     patterns:
//!       - huawei
//!       - { substring: sinopec }
//!       - { literal: china, except: ['china\s+lake'] }
//! ```

use entityscan_core::{Error, Result, RiskTier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

const BUILTIN_PATTERNS: &str = include_str!("../config/default_patterns.yaml");

/// All pattern groups for one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternConfig {
    /// Groups in declaration order
    pub groups: Vec<PatternGroupSpec>,
}

/// One named, prioritised set of patterns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternGroupSpec {
    /// Group identifier
    pub name: String,

    /// Category label reported for matches (defaults to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Lower values are checked first
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default)]
    pub risk_tier: RiskTier,

    /// A match here skips the record entirely
    #[serde(default)]
    pub exclusion: bool,

    /// Confidence attached to matches of this group (0.0-1.0)
    #[serde(default = "default_confidence")]
    pub confidence: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Disabled groups are dropped at compile time
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub patterns: Vec<PatternSpec>,
}

impl PatternGroupSpec {
    /// Category label for matches
    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or(&self.name)
    }
}

/// A single matcher inside a group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged, deny_unknown_fields)]
pub enum PatternSpec {
    /// Bare string: word-bounded literal
    Plain(String),

    /// Word-bounded literal with exceptions
    Literal {
        literal: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        except: Vec<String>,
    },

    /// Regular expression, word-bounded unless `word_boundary: false`
    Regex {
        regex: String,
        #[serde(default = "default_true")]
        word_boundary: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        except: Vec<String>,
    },

    /// Explicit opt-in substring match without boundaries
    Substring {
        substring: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        except: Vec<String>,
    },
}

impl PatternSpec {
    /// The pattern text as written in configuration
    pub fn source(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Literal { literal, .. } => literal,
            Self::Regex { regex, .. } => regex,
            Self::Substring { substring, .. } => substring,
        }
    }

    /// Exception regexes for this pattern
    pub fn except(&self) -> &[String] {
        match self {
            Self::Plain(_) => &[],
            Self::Literal { except, .. }
            | Self::Regex { except, .. }
            | Self::Substring { except, .. } => except,
        }
    }
}

fn default_priority() -> i32 {
    100
}

fn default_confidence() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

impl PatternConfig {
    /// Load from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid pattern config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read pattern config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// The pattern set shipped with entityscan
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_PATTERNS)
    }

    /// Structural checks that do not need regex compilation
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(Error::config("pattern group with empty name"));
            }
            if !names.insert(group.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate pattern group name `{}`",
                    group.name
                )));
            }
            if group.patterns.is_empty() {
                return Err(Error::config(format!(
                    "pattern group `{}` has no patterns",
                    group.name
                )));
            }
            if !(0.0..=1.0).contains(&group.confidence) {
                return Err(Error::config(format!(
                    "pattern group `{}` confidence {} outside 0.0-1.0",
                    group.name, group.confidence
                )));
            }
            for pattern in &group.patterns {
                if pattern.source().trim().is_empty() {
                    return Err(Error::pattern(&group.name, "", "empty pattern"));
                }
            }
        }

        Ok(())
    }

    /// Number of enabled exclusion groups
    pub fn exclusion_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.enabled && g.exclusion)
            .count()
    }

    /// Number of enabled inclusion groups
    pub fn inclusion_count(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.enabled && !g.exclusion)
            .count()
    }

    /// SHA-256 over the canonical JSON form; identifies the config in reports and checkpoints
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(format!("{:x}", hasher.finalize()))
    }
}
