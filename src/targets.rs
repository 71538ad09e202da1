use crate::time::{opt_duration_hours, Duration};
use crate::units::TypedUnit;
use serde::{Deserialize, Serialize};

/// The derived concentration quantity a therapeutic target constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetType {
    Residual,
    Peak,
    Mean,
    Auc,
    Auc24,
    CumulativeAuc,
    AucDividedByMic,
    Auc24DividedByMic,
    TimeOverMic,
    PeakDividedByMic,
    ConcentrationAtTime,
}

/// A therapeutic objective with soft bounds (`min`, `best`, `max`) and hard
/// alarm bounds outside of which a candidate scores zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDefinition {
    pub target_type: TargetType,
    pub unit: TypedUnit,
    pub min: f64,
    pub best: f64,
    pub max: f64,
    pub inefficacy_alarm: Option<f64>,
    pub toxicity_alarm: Option<f64>,
    pub mic: Option<f64>,
    #[serde(with = "opt_duration_hours", default)]
    pub t_min: Option<Duration>,
    #[serde(with = "opt_duration_hours", default)]
    pub t_max: Option<Duration>,
    #[serde(with = "opt_duration_hours", default)]
    pub t_best: Option<Duration>,
}

impl TargetDefinition {
    pub fn new(target_type: TargetType, unit: TypedUnit, min: f64, best: f64, max: f64) -> Self {
        Self {
            target_type,
            unit,
            min,
            best,
            max,
            inefficacy_alarm: None,
            toxicity_alarm: None,
            mic: None,
            t_min: None,
            t_max: None,
            t_best: None,
        }
    }

    pub fn with_alarms(mut self, inefficacy: f64, toxicity: f64) -> Self {
        self.inefficacy_alarm = Some(inefficacy);
        self.toxicity_alarm = Some(toxicity);
        self
    }

    pub fn with_mic(mut self, mic: f64) -> Self {
        self.mic = Some(mic);
        self
    }

    /// Scores an achieved value in [0, 1].
    ///
    /// The score is 1 at `best`, decreases linearly to 0.5 at `min` and
    /// `max`, continues linearly to 0 at the alarm bounds, and is 0 beyond
    /// them. Without alarms the score drops to 0 outside [`min`, `max`].
    pub fn score(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        if (value - self.best).abs() < f64::EPSILON {
            return 1.0;
        }
        if value >= self.min && value <= self.best {
            let width = self.best - self.min;
            if width <= 0.0 {
                return 1.0;
            }
            return 0.5 + 0.5 * (value - self.min) / width;
        }
        if value > self.best && value <= self.max {
            let width = self.max - self.best;
            if width <= 0.0 {
                return 1.0;
            }
            return 0.5 + 0.5 * (self.max - value) / width;
        }
        if value < self.min {
            if let Some(inefficacy) = self.inefficacy_alarm {
                if value > inefficacy {
                    return 0.5 * (value - inefficacy) / (self.min - inefficacy);
                }
            }
            return 0.0;
        }
        if let Some(toxicity) = self.toxicity_alarm {
            if value < toxicity {
                return 0.5 * (toxicity - value) / (toxicity - self.max);
            }
        }
        0.0
    }
}

/// The score of one target for one evaluated candidate regimen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEvaluation {
    pub target_type: TargetType,
    pub unit: TypedUnit,
    pub value: f64,
    pub score: f64,
}
