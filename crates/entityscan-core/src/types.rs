//! Core types for entityscan

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Risk tier attached to a pattern group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    #[serde(alias = "critical")]
    Critical,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "low")]
    Low,
}

impl RiskTier {
    /// Uppercase label used in reports and the match store
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl Default for RiskTier {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown risk tier: {}", other)),
        }
    }
}

/// One line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 1-based physical line number in the (decompressed) input
    pub line_number: u64,

    /// Byte offset of the start of this line in the (decompressed) input
    pub byte_offset: u64,

    /// The decoded line without its trailing newline
    pub raw_text: String,

    /// Selected fields joined by a space, for delimited inputs
    pub scan_text: Option<String>,
}

impl Record {
    /// Create a record over a plain text line
    pub fn new(line_number: u64, raw_text: impl Into<String>) -> Self {
        Self {
            line_number,
            byte_offset: 0,
            raw_text: raw_text.into(),
            scan_text: None,
        }
    }

    /// Set the byte offset
    pub fn at_offset(mut self, byte_offset: u64) -> Self {
        self.byte_offset = byte_offset;
        self
    }

    /// Text the classifier should look at
    pub fn text(&self) -> &str {
        self.scan_text.as_deref().unwrap_or(&self.raw_text)
    }
}

/// Outcome of classifying one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// An inclusion group matched
    pub matched: bool,

    /// An exclusion group matched; the record is skipped
    pub excluded: bool,

    /// Category of the matching inclusion group
    pub category: Option<String>,

    /// Risk tier of the matching inclusion group
    pub risk_tier: Option<RiskTier>,

    /// Confidence of the matching group (0.0-1.0)
    pub confidence: f32,

    /// Name of the group that fired (inclusion or exclusion)
    pub group: Option<String>,

    /// Source text of the pattern that fired
    pub matched_pattern: Option<String>,
}

impl ClassificationResult {
    /// No group matched
    pub fn unmatched() -> Self {
        Self {
            matched: false,
            excluded: false,
            category: None,
            risk_tier: None,
            confidence: 0.0,
            group: None,
            matched_pattern: None,
        }
    }

    /// An exclusion group fired
    pub fn excluded(group: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            excluded: true,
            group: Some(group.into()),
            matched_pattern: Some(pattern.into()),
            ..Self::unmatched()
        }
    }

    /// An inclusion group fired
    pub fn matched(
        group: impl Into<String>,
        category: impl Into<String>,
        risk_tier: RiskTier,
        confidence: f32,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            matched: true,
            excluded: false,
            category: Some(category.into()),
            risk_tier: Some(risk_tier),
            confidence,
            group: Some(group.into()),
            matched_pattern: Some(pattern.into()),
        }
    }

    /// Neither matched nor excluded
    pub fn is_unmatched(&self) -> bool {
        !self.matched && !self.excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_tier_parse() {
        assert_eq!("critical".parse::<RiskTier>().unwrap(), RiskTier::Critical);
        assert_eq!("HIGH".parse::<RiskTier>().unwrap(), RiskTier::High);
        assert!("severe".parse::<RiskTier>().is_err());

        let json = serde_json::to_string(&RiskTier::Low).unwrap();
        assert_eq!(json, "\"LOW\"");
        let lower: RiskTier = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(lower, RiskTier::Critical);
    }

    #[test]
    fn test_record_text_prefers_selected_fields() {
        let mut record = Record::new(4, "123\tHUAWEI TECH\tCN");
        assert_eq!(record.text(), "123\tHUAWEI TECH\tCN");

        record.scan_text = Some("HUAWEI TECH CN".to_string());
        assert_eq!(record.text(), "HUAWEI TECH CN");
    }

    #[test]
    fn test_result_states_are_exclusive() {
        let excluded = ClassificationResult::excluded("china_lake", r"china\s+lake");
        assert!(excluded.excluded && !excluded.matched);
        assert!(excluded.category.is_none());

        let matched =
            ClassificationResult::matched("mcf", "MCF entity", RiskTier::Critical, 1.0, "huawei");
        assert!(matched.matched && !matched.excluded);

        assert!(ClassificationResult::unmatched().is_unmatched());
    }
}
