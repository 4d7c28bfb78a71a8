use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::agent::RawFinding;
use crate::changes::{ChangeSet, normalize_path};
use crate::error::FindingRejection;

/// Confidence used when a reported score cannot be parsed.
pub const FALLBACK_CONFIDENCE: f64 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    /// Lenient parse. Unknown labels become `Medium` with a warning.
    pub fn parse(label: &str) -> Severity {
        match label.trim().to_lowercase().as_str() {
            "critical" | "blocker" => Severity::Critical,
            "high" | "major" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" | "minor" => Severity::Low,
            "info" | "informational" | "note" => Severity::Info,
            other => {
                warn!(severity = other, "unknown severity label, using medium");
                Severity::Medium
            }
        }
    }

    /// Weight used for risk scoring.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::High => 0.75,
            Severity::Medium => 0.5,
            Severity::Low => 0.25,
            Severity::Info => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a reported confidence score.
///
/// Accepts numbers and numeric strings in `[0, 1]`. Anything else falls back
/// to [`FALLBACK_CONFIDENCE`] and logs a warning.
pub fn parse_confidence(raw: &Value) -> f64 {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(score) if (0.0..=1.0).contains(&score) => score,
        _ => {
            warn!(
                raw = %raw,
                fallback = FALLBACK_CONFIDENCE,
                "malformed confidence score, using fallback"
            );
            FALLBACK_CONFIDENCE
        }
    }
}

/// A validated finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub confidence: f64,
    pub title: String,
    pub description: String,
    pub evidence: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub recommendation: String,
    /// Subagent (or scanner) that reported it.
    pub source: String,
    pub todo_id: Option<String>,
}

/// Dedup key: (file, line, severity).
pub type Signature = (String, Option<u32>, Severity);

impl Finding {
    pub fn from_raw(raw: RawFinding, source: impl Into<String>, todo_id: Option<String>) -> Self {
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            severity: Severity::parse(&raw.severity),
            confidence: parse_confidence(&raw.confidence),
            title: raw.title,
            description: raw.description,
            evidence: raw.evidence,
            file: raw.file.map(|f| normalize_path(&f)).filter(|f| !f.is_empty()),
            line: raw.line,
            recommendation: raw.recommendation,
            source: source.into(),
            todo_id,
        }
    }

    /// Findings without a file have no signature and are never merged.
    pub fn signature(&self) -> Option<Signature> {
        self.file
            .as_ref()
            .map(|file| (file.clone(), self.line, self.severity))
    }

    pub fn risk(&self) -> f64 {
        self.severity.weight() * self.confidence
    }
}

/// What happened to an admitted finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Replaced a lower-confidence finding with the same signature.
    Replaced { previous: String },
    /// Dropped in favour of an equal or higher-confidence finding.
    Merged { kept: String },
}

/// Result of [`FindingLedger::admit_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admitted {
    /// Ids now standing for the admitted findings, in input order.
    pub retained: Vec<String>,
    /// `(previous, current)` for every finding displaced by a more confident one.
    pub replaced: Vec<(String, String)>,
}

/// Validated, deduplicated findings for one review.
#[derive(Debug, Clone)]
pub struct FindingLedger {
    scope: ChangeSet,
    seen_ids: HashSet<String>,
    findings: Vec<Finding>,
    by_signature: HashMap<Signature, usize>,
    rejected: usize,
}

impl FindingLedger {
    pub fn new(scope: ChangeSet) -> Self {
        Self {
            scope,
            seen_ids: HashSet::new(),
            findings: Vec::new(),
            by_signature: HashMap::new(),
            rejected: 0,
        }
    }

    pub fn scope(&self) -> &ChangeSet {
        &self.scope
    }

    fn validate(&self, finding: &Finding) -> Result<(), FindingRejection> {
        if finding.evidence.trim().is_empty() {
            return Err(FindingRejection::EmptyEvidence {
                id: finding.id.clone(),
            });
        }
        match &finding.file {
            Some(file) if !self.scope.contains(file) => Err(FindingRejection::OutOfScope {
                id: finding.id.clone(),
                file: file.clone(),
            }),
            None if !self.scope.mentioned_in(&finding.evidence) => {
                Err(FindingRejection::OutOfScope {
                    id: finding.id.clone(),
                    file: "<unspecified>".to_string(),
                })
            }
            _ if self.seen_ids.contains(&finding.id) => Err(FindingRejection::DuplicateId {
                id: finding.id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Validates and records one finding. Rejections are logged and counted;
    /// they never abort the review.
    pub fn admit(&mut self, finding: Finding) -> Result<Admission, FindingRejection> {
        if let Err(rejection) = self.validate(&finding) {
            info!(
                finding_id = %finding.id,
                source = %finding.source,
                reason = %rejection,
                "finding rejected"
            );
            self.rejected += 1;
            return Err(rejection);
        }
        self.seen_ids.insert(finding.id.clone());

        let Some(signature) = finding.signature() else {
            self.findings.push(finding);
            return Ok(Admission::Added);
        };

        match self.by_signature.get(&signature) {
            Some(&idx) => {
                let existing = &mut self.findings[idx];
                if finding.confidence > existing.confidence {
                    let previous = std::mem::replace(existing, finding);
                    Ok(Admission::Replaced {
                        previous: previous.id,
                    })
                } else {
                    Ok(Admission::Merged {
                        kept: existing.id.clone(),
                    })
                }
            }
            None => {
                self.by_signature.insert(signature, self.findings.len());
                self.findings.push(finding);
                Ok(Admission::Added)
            }
        }
    }

    /// Admits every finding. Replacements are reported so that holders of
    /// the displaced ids can re-point them.
    pub fn admit_all(&mut self, findings: impl IntoIterator<Item = Finding>) -> Admitted {
        let mut admitted = Admitted::default();
        for finding in findings {
            let id = finding.id.clone();
            match self.admit(finding) {
                Ok(Admission::Added) => admitted.retained.push(id),
                Ok(Admission::Replaced { previous }) => {
                    admitted.replaced.push((previous, id.clone()));
                    admitted.retained.push(id);
                }
                Ok(Admission::Merged { kept }) => admitted.retained.push(kept),
                Err(_) => {}
            }
        }
        admitted
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn max_risk(&self) -> f64 {
        self.findings.iter().map(Finding::risk).fold(0.0, f64::max)
    }
}
