use crate::agent::{restore_state, CognitiveAgent, Observation, TickInput};
use crate::agents::trajectory::TRAJECTORY_AGENT;
use concord_core::ConcordResult;
use serde::{Deserialize, Serialize};

/// Agent id of [`AffectAgent`].
pub const AFFECT_AGENT: &str = "affect";

const BASELINE_VALENCE: f64 = 0.1;
const BASELINE_AROUSAL: f64 = 0.2;
const RELAX_RATE: f64 = 0.1;

const POSITIVE: &[&str] = &[
    "thanks", "thank", "great", "love", "happy", "awesome", "perfect", "excited", "glad",
];
const NEGATIVE: &[&str] = &[
    "sad", "angry", "upset", "lonely", "stressed", "worried", "terrible", "hate", "anxious",
    "tired",
];

#[derive(Debug, Serialize, Deserialize)]
struct AffectState {
    valence: f64,
    arousal: f64,
    mood: String,
}

impl Default for AffectState {
    fn default() -> Self {
        Self {
            valence: BASELINE_VALENCE,
            arousal: BASELINE_AROUSAL,
            mood: mood_label(BASELINE_VALENCE, BASELINE_AROUSAL).to_string(),
        }
    }
}

fn mood_label(valence: f64, arousal: f64) -> &'static str {
    match (valence, arousal) {
        (v, a) if v >= 0.3 && a >= 0.5 => "excited",
        (v, _) if v >= 0.3 => "content",
        (v, a) if v <= -0.3 && a >= 0.5 => "distressed",
        (v, _) if v <= -0.3 => "low",
        _ => "neutral",
    }
}

fn sentiment(text: &str) -> (i32, i32) {
    let mut pos = 0;
    let mut neg = 0;
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if POSITIVE.contains(&word.as_str()) {
            pos += 1;
        } else if NEGATIVE.contains(&word.as_str()) {
            neg += 1;
        }
    }
    (pos, neg)
}

/// Internal affect model: valence and arousal relax toward a baseline every
/// tick and are nudged by request sentiment, failed outcomes and topic
/// shifts reported by the trajectory agent.
#[derive(Debug, Default)]
pub struct AffectAgent {
    state: AffectState,
}

impl AffectAgent {
    /// Baseline affect.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CognitiveAgent for AffectAgent {
    fn id(&self) -> &str {
        AFFECT_AGENT
    }

    fn restore(&mut self, data: &serde_json::Value) -> ConcordResult<()> {
        self.state = restore_state(data)?;
        Ok(())
    }

    fn tick(&mut self, input: &TickInput) -> ConcordResult<serde_json::Value> {
        let s = &mut self.state;
        s.valence += (BASELINE_VALENCE - s.valence) * RELAX_RATE;
        s.arousal += (BASELINE_AROUSAL - s.arousal) * RELAX_RATE;

        for observation in &input.observations {
            match observation {
                Observation::Request { text, .. } => {
                    let (pos, neg) = sentiment(text);
                    s.valence += 0.2 * f64::from(pos - neg);
                    s.arousal += 0.1 * f64::from(pos + neg);
                }
                Observation::Outcome { success: false, .. } => s.valence -= 0.05,
                Observation::Outcome { .. } => {}
            }
        }

        let shifted = input
            .peer_data(TRAJECTORY_AGENT)
            .and_then(|t| t.get("topic_shift"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if shifted {
            s.arousal += 0.05;
        }

        s.valence = s.valence.clamp(-1.0, 1.0);
        s.arousal = s.arousal.clamp(0.0, 1.0);
        s.mood = mood_label(s.valence, s.arousal).to_string();
        Ok(serde_json::to_value(&self.state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use concord_core::CognitiveSnapshot;
    use std::collections::BTreeMap;

    fn request(text: &str) -> Observation {
        Observation::Request {
            text: text.into(),
            domains: vec![],
            facts: BTreeMap::new(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_sentiment_words() {
        assert_eq!(sentiment("Thanks, that's great!"), (2, 0));
        assert_eq!(sentiment("I feel sad and lonely"), (0, 2));
    }

    #[test]
    fn test_negative_request_lowers_valence() {
        let mut agent = AffectAgent::new();
        let out = agent
            .tick(&TickInput::empty(1).with_observation(request("I'm sad, stressed, tired and anxious")))
            .unwrap();
        assert!(out["valence"].as_f64().unwrap() < -0.3);
        assert_eq!(out["mood"], "distressed");
    }

    #[test]
    fn test_relaxes_toward_baseline() {
        let mut agent = AffectAgent::new();
        agent
            .tick(&TickInput::empty(1).with_observation(request("awesome awesome awesome")))
            .unwrap();
        let mut out = serde_json::Value::Null;
        for tick in 2..200 {
            out = agent.tick(&TickInput::empty(tick)).unwrap();
        }
        assert!((out["valence"].as_f64().unwrap() - BASELINE_VALENCE).abs() < 0.01);
        assert_eq!(out["mood"], "neutral");
    }

    #[test]
    fn test_reads_trajectory_peer() {
        let mut calm = AffectAgent::new();
        let base = calm.tick(&TickInput::empty(1)).unwrap();

        let mut shifted = AffectAgent::new();
        let mut trajectory = CognitiveSnapshot::initial(TRAJECTORY_AGENT);
        trajectory.version = 4;
        trajectory.data = serde_json::json!({ "topic_shift": true });
        let out = shifted
            .tick(&TickInput::empty(1).with_peer(trajectory))
            .unwrap();
        assert!(out["arousal"].as_f64().unwrap() > base["arousal"].as_f64().unwrap());
    }
}
