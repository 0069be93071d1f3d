//! Recommendation records returned by the advisory tier. Advisory output never actuates anything.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Anomaly,
    ToolWear,
    Maintenance,
    ParameterAdjustment,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub device_id: String,
    pub kind: RecommendationKind,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub rationale: String,
}

impl Recommendation {
    pub fn new(
        device_id: impl Into<String>,
        kind: RecommendationKind,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            confidence: clamp_confidence(confidence),
            rationale: rationale.into(),
        }
    }

    /// Clamps confidence into range; a NaN confidence becomes 0.
    pub fn normalized(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) }
}
