use crate::request::Outcome;
use concord_core::{Tier, WorkSpecification, WorkStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Why the join ended before every item was terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinInterruption {
    /// The join deadline passed.
    TimedOut,
    /// The plan was cancelled.
    Cancelled,
}

/// The result chosen for one logical sub-question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Sub-question this component answers.
    pub domain: String,
    /// Work item whose result was chosen.
    pub work_id: Uuid,
    /// Status of that item.
    pub status: WorkStatus,
    /// Tier it ran on.
    pub tier: Tier,
    /// Confidence of its result.
    pub confidence: f64,
    /// Text of its result.
    pub summary: String,
}

/// A merged answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// Merged answer text.
    pub text: String,
    /// Overall outcome.
    pub outcome: Outcome,
    /// Gaps, failures and low-confidence parts.
    pub caveats: Vec<String>,
    /// Chosen result per sub-question, sorted by domain.
    pub components: Vec<Component>,
}

/// Merges terminal work results into one answer.
///
/// Results are grouped by domain. Within a group the highest confidence
/// wins, ties go to the remote tier and then to the lowest id, so the output
/// does not depend on completion order.
#[derive(Debug, Clone, Copy)]
pub struct Synthesizer {
    low_confidence_threshold: f64,
}

impl Synthesizer {
    /// Create a synthesizer flagging results below `low_confidence_threshold`.
    pub fn new(low_confidence_threshold: f64) -> Self {
        Self {
            low_confidence_threshold,
        }
    }

    /// Merge `results` into one answer, noting an early end of the join.
    pub fn synthesize(
        &self,
        results: &[WorkSpecification],
        interruption: Option<JoinInterruption>,
    ) -> Synthesis {
        let mut groups: BTreeMap<String, Vec<&WorkSpecification>> = BTreeMap::new();
        for spec in results {
            groups.entry(domain_key(spec)).or_default().push(spec);
        }

        let mut lines = Vec::new();
        let mut caveats = Vec::new();
        let mut components = Vec::new();

        for (domain, candidates) in &groups {
            let Some(best) = candidates.iter().copied().max_by(|a, b| preference(a, b)) else {
                continue;
            };
            let (confidence, summary, reason, has_outputs) = match best.result() {
                Some(r) => (
                    r.confidence,
                    r.summary.clone(),
                    r.reason.clone(),
                    !r.outputs.is_empty(),
                ),
                None => (0.0, String::new(), Some("did not finish".to_string()), false),
            };

            match best.status() {
                WorkStatus::Completed => {
                    lines.push(format!("{domain}: {summary}"));
                    if confidence < self.low_confidence_threshold {
                        caveats.push(format!("{domain}: low confidence ({confidence:.2})"));
                    }
                }
                status => {
                    let reason = reason.unwrap_or_else(|| status.to_string()).replace('_', " ");
                    if has_outputs {
                        lines.push(format!("{domain} (partial): {summary}"));
                        caveats.push(format!("{domain}: incomplete ({reason})"));
                    } else {
                        caveats.push(format!("{domain}: could not be completed ({reason})"));
                    }
                }
            }

            components.push(Component {
                domain: domain.clone(),
                work_id: best.id,
                status: best.status(),
                tier: best.effective_tier(),
                confidence,
                summary,
            });
        }

        let completed = components
            .iter()
            .filter(|c| c.status == WorkStatus::Completed)
            .count();
        let outcome = match interruption {
            Some(JoinInterruption::Cancelled) => Outcome::Cancelled,
            _ if completed == 0 => Outcome::UnableToComplete,
            None if completed == components.len() => Outcome::Complete,
            _ => Outcome::Partial,
        };
        if interruption == Some(JoinInterruption::TimedOut) {
            caveats.push("the join timed out before every part finished".to_string());
        }

        let mut text = match outcome {
            Outcome::UnableToComplete if lines.is_empty() => {
                "I was unable to complete this request.".to_string()
            }
            Outcome::Cancelled if lines.is_empty() => "The request was cancelled.".to_string(),
            Outcome::Partial | Outcome::UnableToComplete | Outcome::Cancelled => {
                format!("Partial result:\n{}", lines.join("\n"))
            }
            _ => lines.join("\n"),
        };
        if !caveats.is_empty() {
            text.push_str("\n\nCaveats:");
            for caveat in &caveats {
                text.push_str("\n- ");
                text.push_str(caveat);
            }
        }

        Synthesis {
            text,
            outcome,
            caveats,
            components,
        }
    }
}

fn domain_key(spec: &WorkSpecification) -> String {
    spec.domain.clone().unwrap_or_else(|| spec.kind.to_string())
}

/// Total order on candidates; `Greater` is preferred.
fn preference(a: &WorkSpecification, b: &WorkSpecification) -> Ordering {
    let confidence = |s: &WorkSpecification| s.result().map_or(0.0, |r| r.confidence);
    confidence(a)
        .partial_cmp(&confidence(b))
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.effective_tier().cmp(&b.effective_tier()))
        .then_with(|| b.id.cmp(&a.id))
}
