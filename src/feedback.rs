//! Structured feedback exchanged between evaluator and generator agents
//!
//! The evaluator collaborator scores each draft; the loop controller carries
//! the resulting [`StructuredFeedback`] into the next generator call. One
//! instance is produced per iteration and never mutated afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a single feedback issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Must be fixed before the draft is usable
    Critical,
    /// Should be fixed in the next iteration
    High,
    /// Worth fixing
    Medium,
    /// Minor
    Low,
    /// Informational only
    Info,
}

/// Category a feedback issue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// Structure and clarity of the code itself
    CodeQuality,
    /// Behavior versus the stated requirements
    Functionality,
    /// Runtime cost
    Performance,
    /// Security exposure
    Security,
    /// Ease of future change
    Maintainability,
    /// Formatting and conventions
    Style,
}

/// Individual issue raised by the evaluator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackIssue {
    /// Issue category
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    /// How serious the issue is
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
    /// Affected line, when the draft is code
    #[serde(rename = "line_number", default)]
    pub line: Option<u32>,
    /// Offending fragment
    #[serde(rename = "code_snippet", default)]
    pub snippet: Option<String>,
    /// Concrete fix proposal
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// Per-dimension quality scores, each on a 0-100 scale
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Structural complexity (higher is better)
    #[serde(default)]
    pub complexity_score: f64,
    /// Ease of future change
    #[serde(default)]
    pub maintainability_score: f64,
    /// Readability of the draft
    #[serde(default)]
    pub readability_score: f64,
    /// Measured test coverage percentage
    #[serde(default)]
    pub test_coverage: f64,
    /// Runtime efficiency
    #[serde(default)]
    pub performance_score: f64,
    /// Security posture
    #[serde(default)]
    pub security_score: f64,
}

impl QualityMetrics {
    /// Metrics with every axis set to `score` and no measured coverage
    pub fn uniform(score: f64) -> Self {
        Self {
            complexity_score: score,
            maintainability_score: score,
            readability_score: score,
            test_coverage: 0.0,
            performance_score: score,
            security_score: score,
        }
    }

    /// Average across all six axes
    pub fn overall(&self) -> f64 {
        (self.complexity_score
            + self.maintainability_score
            + self.readability_score
            + self.test_coverage
            + self.performance_score
            + self.security_score)
            / 6.0
    }
}

/// Scored, itemized critique of one generated draft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredFeedback {
    /// Overall quality score, 0-100
    pub quality_score: f64,
    /// Per-dimension scores
    pub quality_metrics: QualityMetrics,
    /// Itemized issues
    #[serde(default)]
    pub issues: Vec<FeedbackIssue>,
    /// Free-form improvement suggestions
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// What the draft already does well
    #[serde(default)]
    pub positive_aspects: Vec<String>,
    /// Iteration this feedback belongs to (1-based)
    pub iteration: u32,
    /// Evaluator agent that produced the critique
    pub reviewer: String,
}

impl StructuredFeedback {
    /// Whether the score satisfies the loop's quality threshold
    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.quality_score >= threshold
    }

    /// Issues of critical or high severity
    pub fn critical_issues(&self) -> Vec<&FeedbackIssue> {
        self.issues
            .iter()
            .filter(|i| matches!(i.severity, Severity::Critical | Severity::High))
            .collect()
    }

    /// Lenient extraction from an arbitrary evaluator reply.
    ///
    /// A structured object with a `quality_score` maps directly; anything
    /// else becomes a conservative mid-scale default so a sloppy evaluator
    /// cannot satisfy the threshold by accident.
    pub fn from_value(value: &Value, iteration: u32, reviewer: &str) -> Self {
        if let Some(score) = value.get("quality_score").and_then(Value::as_f64) {
            let quality_metrics = value
                .get("quality_metrics")
                .and_then(|m| serde_json::from_value(m.clone()).ok())
                .unwrap_or_else(|| QualityMetrics::uniform(50.0));
            let issues = value
                .get("issues")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| serde_json::from_value(i.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            return Self {
                quality_score: score.clamp(0.0, 100.0),
                quality_metrics,
                issues,
                suggestions: string_list(value.get("suggestions")),
                positive_aspects: string_list(value.get("positive_aspects")),
                iteration,
                reviewer: reviewer.to_string(),
            };
        }

        Self {
            quality_score: 50.0,
            quality_metrics: QualityMetrics::uniform(50.0),
            issues: Vec::new(),
            suggestions: vec!["Unable to parse detailed feedback".to_string()],
            positive_aspects: Vec::new(),
            iteration,
            reviewer: reviewer.to_string(),
        }
    }

    /// Render the critique as plain text for the next generator call
    pub fn render_for_agent(&self) -> String {
        let mut out = format!(
            "Review feedback (quality score {:.1}/100)\n",
            self.quality_score
        );

        if !self.positive_aspects.is_empty() {
            out.push_str("\nPositive aspects:\n");
            for aspect in &self.positive_aspects {
                out.push_str(&format!("- {aspect}\n"));
            }
        }

        if !self.issues.is_empty() {
            out.push_str("\nIssues to address:\n");
            for issue in &self.issues {
                out.push_str(&format!(
                    "- [{:?}/{:?}] {}\n",
                    issue.severity, issue.kind, issue.message
                ));
                if let Some(suggestion) = &issue.suggestion {
                    out.push_str(&format!("  suggestion: {suggestion}\n"));
                }
            }
        }

        if !self.suggestions.is_empty() {
            out.push_str("\nSuggestions:\n");
            for suggestion in &self.suggestions {
                out.push_str(&format!("- {suggestion}\n"));
            }
        }

        let m = &self.quality_metrics;
        out.push_str(&format!(
            "\nQuality metrics: complexity {:.1}, maintainability {:.1}, readability {:.1}, test coverage {:.1}%, performance {:.1}, security {:.1}\n",
            m.complexity_score,
            m.maintainability_score,
            m.readability_score,
            m.test_coverage,
            m.performance_score,
            m.security_score
        ));

        out
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Record of one generate/evaluate cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number
    pub iteration: u32,
    /// Draft produced by the generator, if it got that far
    pub output: Option<Value>,
    /// Evaluator critique of the draft, if it got that far
    pub feedback: Option<StructuredFeedback>,
    /// Wall-clock time for the whole cycle
    pub duration_ms: u64,
    /// Whether both calls of the cycle succeeded
    pub success: bool,
    /// Failure description for unsuccessful cycles
    pub error: Option<String>,
}

/// Complete result of an iterative loop execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopOutcome {
    /// Step name the loop ran under
    pub loop_name: String,
    /// Number of generate/evaluate cycles performed
    pub total_iterations: u32,
    /// Score of the final draft (0 when no draft was evaluated)
    pub final_quality_score: f64,
    /// Threshold the loop was configured with
    pub quality_threshold: f64,
    /// Whether the threshold was reached
    pub threshold_met: bool,
    /// The evaluator failed and the loop kept the best draft so far
    pub evaluator_failed: bool,
    /// Full iteration trail, kept for observability
    pub iterations: Vec<IterationRecord>,
    /// The accepted draft, if any iteration produced one
    pub final_output: Option<Value>,
    /// Total loop wall-clock time
    pub total_duration_ms: u64,
    /// Quality scores over iterations
    pub trend: Vec<f64>,
}

impl LoopOutcome {
    /// Score delta from the first to the last evaluated iteration
    pub fn quality_improvement(&self) -> f64 {
        match (self.trend.first(), self.trend.last()) {
            (Some(first), Some(last)) if self.trend.len() > 1 => last - first,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn threshold_boundary_is_inclusive() {
        let feedback = StructuredFeedback::from_value(&json!({"quality_score": 85.0}), 1, "rev");
        assert!(feedback.meets_threshold(85.0));
        assert!(!feedback.meets_threshold(85.1));
    }

    #[test]
    fn structured_reply_maps_directly() {
        let value = json!({
            "quality_score": 92.5,
            "quality_metrics": {
                "complexity_score": 90.0,
                "maintainability_score": 95.0,
                "readability_score": 92.0,
                "test_coverage": 80.0,
                "performance_score": 88.0,
                "security_score": 91.0
            },
            "issues": [
                {"type": "style", "severity": "low", "message": "inconsistent naming"}
            ],
            "suggestions": ["add doc comments"],
            "positive_aspects": ["clear structure"]
        });
        let feedback = StructuredFeedback::from_value(&value, 2, "code_reviewer");
        assert_eq!(feedback.quality_score, 92.5);
        assert_eq!(feedback.issues.len(), 1);
        assert_eq!(feedback.suggestions, vec!["add doc comments"]);
        assert_eq!(feedback.iteration, 2);
        assert!(feedback.critical_issues().is_empty());
    }

    #[test]
    fn unparseable_reply_falls_back_to_midscale() {
        let feedback =
            StructuredFeedback::from_value(&json!("looks good to me"), 1, "code_reviewer");
        assert_eq!(feedback.quality_score, 50.0);
        assert_eq!(feedback.suggestions.len(), 1);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let feedback = StructuredFeedback::from_value(&json!({"quality_score": 250.0}), 1, "rev");
        assert_eq!(feedback.quality_score, 100.0);
    }

    #[test]
    fn quality_improvement_uses_trend_endpoints() {
        let outcome = LoopOutcome {
            loop_name: "loop".into(),
            total_iterations: 3,
            final_quality_score: 90.0,
            quality_threshold: 85.0,
            threshold_met: true,
            evaluator_failed: false,
            iterations: Vec::new(),
            final_output: None,
            total_duration_ms: 0,
            trend: vec![60.0, 75.0, 90.0],
        };
        assert_eq!(outcome.quality_improvement(), 30.0);
    }

    #[test]
    fn render_mentions_score_and_issues() {
        let value = json!({
            "quality_score": 70.0,
            "issues": [
                {"type": "security", "severity": "critical", "message": "unsanitized input"}
            ]
        });
        let rendered = StructuredFeedback::from_value(&value, 1, "rev").render_for_agent();
        assert!(rendered.contains("70.0/100"));
        assert!(rendered.contains("unsanitized input"));
    }
}
