//! First-match-wins classification over ordered pattern groups
//!
//! Evaluation order is fixed at construction:
//! 1. every exclusion group, by `(priority, declaration order)`; a hit
//!    marks the record excluded and stops
//! 2. every inclusion group, by `(priority, declaration order)`; the first
//!    hit decides category, risk tier and confidence
//! 3. otherwise the record is unmatched

use crate::classifier::Classifier;
use crate::config::PatternConfig;
use crate::patterns::PatternGroup;
use entityscan_core::{ClassificationResult, Record, Result};
use tracing::{debug, info};

/// Pattern-group classifier
pub struct PatternClassifier {
    name: String,
    exclusions: Vec<PatternGroup>,
    inclusions: Vec<PatternGroup>,
    fingerprint: String,
}

impl PatternClassifier {
    /// Compile every enabled group of a configuration
    pub fn from_config(config: &PatternConfig) -> Result<Self> {
        config.validate()?;

        let mut exclusions = Vec::new();
        let mut inclusions = Vec::new();

        for (order, spec) in config.groups.iter().enumerate() {
            if !spec.enabled {
                debug!("Skipping disabled pattern group {}", spec.name);
                continue;
            }
            let group = PatternGroup::compile(spec, order)?;
            if group.is_exclusion() {
                exclusions.push(group);
            } else {
                inclusions.push(group);
            }
        }

        exclusions.sort_by_key(|g| (g.priority(), g.order()));
        inclusions.sort_by_key(|g| (g.priority(), g.order()));

        info!(
            "Compiled {} exclusion and {} inclusion pattern groups",
            exclusions.len(),
            inclusions.len()
        );

        Ok(Self {
            name: "pattern_groups".to_string(),
            exclusions,
            inclusions,
            fingerprint: config.fingerprint()?,
        })
    }

    /// Compile the built-in pattern set
    pub fn builtin() -> Result<Self> {
        Self::from_config(&PatternConfig::builtin()?)
    }

    /// Classify raw text
    pub fn classify_text(&self, text: &str) -> ClassificationResult {
        let normalized = text.to_lowercase();

        for group in &self.exclusions {
            if let Some(pattern) = group.find(&normalized) {
                return ClassificationResult::excluded(group.name(), pattern);
            }
        }

        for group in &self.inclusions {
            if let Some(pattern) = group.find(&normalized) {
                return ClassificationResult::matched(
                    group.name(),
                    group.category(),
                    group.risk_tier(),
                    group.confidence(),
                    pattern,
                );
            }
        }

        ClassificationResult::unmatched()
    }

    /// Groups in evaluation order
    pub fn groups(&self) -> impl Iterator<Item = &PatternGroup> {
        self.exclusions.iter().chain(self.inclusions.iter())
    }

    /// Fingerprint of the configuration this classifier was built from
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn inclusion_count(&self) -> usize {
        self.inclusions.len()
    }

    pub fn exclusion_count(&self) -> usize {
        self.exclusions.len()
    }
}

impl Classifier for PatternClassifier {
    fn classify(&self, record: &Record) -> ClassificationResult {
        self.classify_text(record.text())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entityscan_core::RiskTier;

    fn classifier(yaml: &str) -> PatternClassifier {
        PatternClassifier::from_config(&PatternConfig::from_yaml(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_priority_order_wins() {
        let c = classifier(
            r#"
groups:
  - { name: g2, category: telecom_subsidiary, priority: 2, patterns: ['huawei technologies'] }
  - { name: g1, category: company, priority: 1, patterns: [huawei] }
"#,
        );

        let result = c.classify_text("Huawei Technologies Co.");
        assert!(result.matched);
        assert_eq!(result.category.as_deref(), Some("company"));
        assert_eq!(result.matched_pattern.as_deref(), Some("huawei"));
    }

    #[test]
    fn test_declaration_order_breaks_priority_ties() {
        let c = classifier(
            r#"
groups:
  - { name: first, priority: 5, patterns: [zte] }
  - { name: second, priority: 5, patterns: [zte] }
"#,
        );
        assert_eq!(c.classify_text("ZTE").group.as_deref(), Some("first"));
    }

    #[test]
    fn test_exclusions_checked_before_any_inclusion() {
        let c = classifier(
            r#"
groups:
  - { name: country, priority: 0, patterns: [china] }
  - { name: china_lake, exclusion: true, priority: 50, patterns: [{ regex: '\bchina\s+lake\b' }] }
"#,
        );

        let excluded = c.classify_text("China Lake Naval Weapons Station");
        assert!(excluded.excluded);
        assert!(!excluded.matched);
        assert!(excluded.category.is_none());
        assert_eq!(excluded.group.as_deref(), Some("china_lake"));

        let included = c.classify_text("Made in China");
        assert!(included.matched);
        assert_eq!(included.category.as_deref(), Some("country"));
    }

    #[test]
    fn test_group_metadata_flows_into_result() {
        let c = classifier(
            r#"
groups:
  - name: mcf
    category: MCF entity
    risk_tier: critical
    confidence: 0.9
    patterns: [hikvision]
"#,
        );
        let result = c.classify_text("Hikvision cameras");
        assert_eq!(result.risk_tier, Some(RiskTier::Critical));
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn test_only_exclusions_leaves_everything_unmatched() {
        let c = classifier("groups:\n  - { name: x, exclusion: true, patterns: [lake] }\n");
        assert_eq!(c.inclusion_count(), 0);
        assert!(c.classify_text("Huawei").is_unmatched());
        assert!(c.classify_text("Lake").excluded);
    }

    #[test]
    fn test_disabled_groups_are_skipped() {
        let c = classifier("groups:\n  - { name: x, enabled: false, patterns: [huawei] }\n");
        assert!(c.classify_text("huawei").is_unmatched());
    }

    #[test]
    fn test_classify_uses_selected_fields() {
        let c = classifier("groups:\n  - { name: x, patterns: [huawei] }\n");
        let mut record = Record::new(2, "1\tHuawei\tCHN");
        record.scan_text = Some("Acme".to_string());
        assert!(c.classify(&record).is_unmatched());
    }

    #[test]
    fn test_builtin_known_false_positives() {
        let c = PatternClassifier::builtin().unwrap();

        assert!(c.classify_text("NAWS China Lake, Ridgecrest CA").excluded);
        assert!(c.classify_text("CATALINA CHINA INC - dinnerware").excluded);
        assert!(c.classify_text("FACCHINAGGI SRL").is_unmatched());

        let mcf = c.classify_text("Purchase order: Hikvision Digital Technology");
        assert_eq!(mcf.category.as_deref(), Some("MCF entity"));

        let soe = c.classify_text("SINOPEC SHANGHAI PETROCHEMICAL");
        assert_eq!(soe.category.as_deref(), Some("Chinese state-owned enterprise"));

        let loc = c.classify_text("Shipment from Shenzhen port");
        assert_eq!(loc.category.as_deref(), Some("China location"));
    }
}
