use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::delegation::{Finding, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Approve,
    NeedsChanges,
    Block,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "approve",
            Recommendation::NeedsChanges => "needs-changes",
            Recommendation::Block => "block",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only roll-up of a review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    /// Findings at or above the confidence threshold, most severe first.
    pub findings: Vec<Finding>,
    pub severity_counts: BTreeMap<Severity, usize>,
    /// `None` when no finding survived filtering.
    pub overall_severity: Option<Severity>,
    pub recommendation: Recommendation,
    pub summary: String,
    pub total_findings: usize,
    /// Findings dropped by the confidence filter.
    pub filtered_out: usize,
    pub confidence_threshold: f64,
}

impl Assessment {
    pub fn from_findings(findings: &[Finding], confidence_threshold: f64) -> Self {
        let mut kept: Vec<Finding> = findings
            .iter()
            .filter(|f| f.confidence >= confidence_threshold)
            .cloned()
            .collect();
        kept.sort_by(|a, b| {
            a.severity.cmp(&b.severity).then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        let filtered_out = findings.len() - kept.len();

        let mut severity_counts: BTreeMap<Severity, usize> =
            Severity::ALL.iter().map(|s| (*s, 0)).collect();
        for finding in &kept {
            *severity_counts.entry(finding.severity).or_insert(0) += 1;
        }

        let overall_severity = kept.iter().map(|f| f.severity).min();
        let count = |s: Severity| severity_counts.get(&s).copied().unwrap_or(0);
        let recommendation = if count(Severity::Critical) > 0 {
            Recommendation::Block
        } else if count(Severity::High) > 0 || count(Severity::Medium) > 0 {
            Recommendation::NeedsChanges
        } else {
            Recommendation::Approve
        };

        let breakdown: Vec<String> = severity_counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(s, n)| format!("{n} {s}"))
            .collect();
        let summary = if kept.is_empty() {
            format!("no findings; recommendation: {recommendation}")
        } else {
            format!(
                "{} finding(s) ({}); recommendation: {recommendation}",
                kept.len(),
                breakdown.join(", ")
            )
        };

        Self {
            total_findings: kept.len(),
            findings: kept,
            severity_counts,
            overall_severity,
            recommendation,
            summary,
            filtered_out,
            confidence_threshold,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.severity_counts.get(&severity).copied().unwrap_or(0)
    }
}
