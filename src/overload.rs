use crate::error::{ComputingError, ComputingResult};

/// Refuses computations whose size would exceed the resource budget,
/// before any engine work starts.
///
/// Request-bound: callers embed one in the computing component and may
/// override the thresholds per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverloadEvaluator {
    pub prediction_points: usize,
    pub percentile_points: usize,
    pub dosage_possibilities: usize,
}

impl Default for OverloadEvaluator {
    fn default() -> Self {
        Self {
            prediction_points: 10_000,
            percentile_points: 2_000,
            dosage_possibilities: 10_000,
        }
    }
}

impl OverloadEvaluator {
    pub fn check_prediction_points(&self, points: usize) -> ComputingResult<()> {
        if points > self.prediction_points {
            return Err(ComputingError::TooBig(format!(
                "asking for {points} points, but the maximum allowed is {}",
                self.prediction_points
            )));
        }
        Ok(())
    }

    pub fn check_percentile_points(&self, points: usize) -> ComputingResult<()> {
        if points > self.percentile_points {
            return Err(ComputingError::TooBig(format!(
                "asking for {points} points for percentiles, but the maximum allowed is {}",
                self.percentile_points
            )));
        }
        Ok(())
    }

    pub fn check_dosage_possibilities(&self, possibilities: usize) -> ComputingResult<()> {
        if possibilities > self.dosage_possibilities {
            return Err(ComputingError::TooBig(format!(
                "asking for {possibilities} dosage possibilities, but the maximum allowed is {}",
                self.dosage_possibilities
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let evaluator = OverloadEvaluator::default();
        assert!(evaluator.check_prediction_points(10_000).is_ok());
        assert!(evaluator.check_prediction_points(10_001).is_err());
        assert!(evaluator.check_percentile_points(2_001).is_err());
        assert!(evaluator.check_dosage_possibilities(10_001).is_err());
    }

    #[test]
    fn test_error_message_states_both_sides() {
        let evaluator = OverloadEvaluator::default();
        let err = evaluator.check_percentile_points(5_000).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("5000"));
        assert!(message.contains("2000"));
    }
}
