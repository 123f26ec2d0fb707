//! Compiled pattern groups
//!
//! Literals and regexes are word-bounded by default using half word
//! boundaries, so a pattern that starts or ends with punctuation still
//! matches (`co. ltd`). Substrings are the explicit opt-out and run
//! through a single Aho-Corasick automaton per group.

use crate::config::{PatternGroupSpec, PatternSpec};
use aho_corasick::AhoCorasick;
use entityscan_core::{Error, Result, RiskTier};
use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};

/// Compiled regex pattern with its exceptions
struct RegexPattern {
    source: String,
    regex: Regex,
    except: Vec<Regex>,
}

/// Substring pattern with its exceptions
struct SubstringPattern {
    source: String,
    except: Vec<Regex>,
}

/// A compiled, immutable pattern group
pub struct PatternGroup {
    name: String,
    category: String,
    priority: i32,
    order: usize,
    risk_tier: RiskTier,
    exclusion: bool,
    confidence: f32,
    regex_set: Option<RegexSet>,
    regexes: Vec<RegexPattern>,
    substrings: Option<AhoCorasick>,
    substring_patterns: Vec<SubstringPattern>,
}

impl std::fmt::Debug for PatternGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternGroup")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("exclusion", &self.exclusion)
            .field("patterns", &self.pattern_count())
            .finish()
    }
}

impl PatternGroup {
    /// Compile a group; `order` is its declaration index, used as the priority tie-break
    pub fn compile(spec: &PatternGroupSpec, order: usize) -> Result<Self> {
        let mut regexes = Vec::new();
        let mut set_sources = Vec::new();
        let mut substring_patterns = Vec::new();
        let mut needles = Vec::new();

        for pattern in &spec.patterns {
            let except = compile_except(&spec.name, pattern)?;

            match pattern {
                PatternSpec::Substring { substring, .. } => {
                    needles.push(substring.to_lowercase());
                    substring_patterns.push(SubstringPattern {
                        source: substring.clone(),
                        except,
                    });
                }
                _ => {
                    let expr = bounded_expression(pattern);
                    let regex = build_regex(&expr)
                        .map_err(|e| Error::pattern(&spec.name, pattern.source(), e))?;
                    set_sources.push(expr);
                    regexes.push(RegexPattern {
                        source: pattern.source().to_string(),
                        regex,
                        except,
                    });
                }
            }
        }

        let regex_set = if set_sources.is_empty() {
            None
        } else {
            Some(
                RegexSetBuilder::new(&set_sources)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::pattern(&spec.name, set_sources.join(" | "), e))?,
            )
        };

        let substrings = if needles.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&needles)
                    .map_err(|e| {
                        Error::pattern(
                            &spec.name,
                            needles.join(" | "),
                            format!("failed to build substring matcher: {}", e),
                        )
                    })?,
            )
        };

        Ok(Self {
            name: spec.name.clone(),
            category: spec.category().to_string(),
            priority: spec.priority,
            order,
            risk_tier: spec.risk_tier,
            exclusion: spec.exclusion,
            confidence: spec.confidence,
            regex_set,
            regexes,
            substrings,
            substring_patterns,
        })
    }

    /// Find the first pattern in this group that fires on already-normalised text
    pub fn find(&self, text: &str) -> Option<&str> {
        if let Some(set) = &self.regex_set {
            let hits = set.matches(text);
            if hits.matched_any() {
                for index in hits.iter() {
                    let pattern = &self.regexes[index];
                    if pattern.except.is_empty() {
                        return Some(&pattern.source);
                    }
                    let accepted = pattern
                        .regex
                        .find_iter(text)
                        .any(|m| !masked(&pattern.except, text, m.start(), m.end()));
                    if accepted {
                        return Some(&pattern.source);
                    }
                }
            }
        }

        if let Some(ac) = &self.substrings {
            for m in ac.find_overlapping_iter(text) {
                let pattern = &self.substring_patterns[m.pattern().as_usize()];
                if !masked(&pattern.except, text, m.start(), m.end()) {
                    return Some(&pattern.source);
                }
            }
        }

        None
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Category reported for matches
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Declaration index in the configuration
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn risk_tier(&self) -> RiskTier {
        self.risk_tier
    }

    pub fn is_exclusion(&self) -> bool {
        self.exclusion
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Total number of compiled patterns
    pub fn pattern_count(&self) -> usize {
        self.regexes.len() + self.substring_patterns.len()
    }
}

/// Regex source for a non-substring pattern, with boundaries applied
fn bounded_expression(pattern: &PatternSpec) -> String {
    match pattern {
        PatternSpec::Plain(literal) | PatternSpec::Literal { literal, .. } => {
            // Any run of whitespace in a literal matches any run of whitespace
            let body = literal
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+");
            with_boundaries(&body)
        }
        PatternSpec::Regex {
            regex,
            word_boundary,
            ..
        } => {
            if *word_boundary {
                with_boundaries(regex)
            } else {
                regex.clone()
            }
        }
        PatternSpec::Substring { substring, .. } => regex::escape(substring),
    }
}

fn with_boundaries(body: &str) -> String {
    format!(r"\b{{start-half}}(?:{})\b{{end-half}}", body)
}

fn build_regex(expr: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(expr).case_insensitive(true).build()
}

fn compile_except(group: &str, pattern: &PatternSpec) -> Result<Vec<Regex>> {
    pattern
        .except()
        .iter()
        .map(|expr| build_regex(expr).map_err(|e| Error::pattern(group, expr.as_str(), e)))
        .collect()
}

/// Whether an exception match covers the span `[start, end)`
fn masked(except: &[Regex], text: &str, start: usize, end: usize) -> bool {
    except.iter().any(|re| {
        re.find_iter(text)
            .any(|m| m.start() <= start && m.end() >= end)
    })
}
