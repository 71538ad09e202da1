use serde::{Deserialize, Serialize};

/// Residual error model of an analyte group, weighting the difference
/// between a measured and a predicted concentration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorModelType {
    None,
    Additive,
    Proportional,
    Exponential,
    Mixed,
    ProportionalMix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorModel {
    pub model_type: ErrorModelType,
    /// One sigma for the simple models, two for the mixed ones.
    pub sigmas: Vec<f64>,
}

impl ErrorModel {
    pub fn new(model_type: ErrorModelType, sigmas: Vec<f64>) -> Self {
        Self { model_type, sigmas }
    }

    pub fn additive(sigma: f64) -> Self {
        Self::new(ErrorModelType::Additive, vec![sigma])
    }

    pub fn proportional(sigma: f64) -> Self {
        Self::new(ErrorModelType::Proportional, vec![sigma])
    }

    pub fn exponential(sigma: f64) -> Self {
        Self::new(ErrorModelType::Exponential, vec![sigma])
    }

    pub fn mixed(additive: f64, proportional: f64) -> Self {
        Self::new(ErrorModelType::Mixed, vec![additive, proportional])
    }

    fn sigma(&self, index: usize) -> f64 {
        self.sigmas.get(index).copied().unwrap_or(0.0)
    }

    /// Squared weighted residual of one measurement, the likelihood term of
    /// the a posteriori objective.
    ///
    /// Predicted concentrations are floored at a small positive value so the
    /// proportional and exponential weights stay finite near zero.
    pub fn log_likelihood_term(&self, observed: f64, predicted: f64) -> f64 {
        const FLOOR: f64 = 1e-10;
        let predicted = predicted.max(FLOOR);
        match self.model_type {
            ErrorModelType::None => 0.0,
            ErrorModelType::Additive => {
                let sigma = self.sigma(0).max(FLOOR);
                ((observed - predicted) / sigma).powi(2)
            }
            ErrorModelType::Proportional => {
                let sigma = self.sigma(0).max(FLOOR);
                ((observed - predicted) / (sigma * predicted)).powi(2)
            }
            ErrorModelType::Exponential => {
                let sigma = self.sigma(0).max(FLOOR);
                ((observed.max(FLOOR).ln() - predicted.ln()) / sigma).powi(2)
            }
            ErrorModelType::Mixed | ErrorModelType::ProportionalMix => {
                let variance = self.sigma(0).powi(2) + (self.sigma(1) * predicted).powi(2);
                (observed - predicted).powi(2) / variance.max(FLOOR)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_additive_weighting() {
        let model = ErrorModel::additive(2.0);
        assert_relative_eq!(model.log_likelihood_term(14.0, 10.0), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_proportional_weighting() {
        let model = ErrorModel::proportional(0.2);
        // (12 - 10)^2 / (0.2 * 10)^2 = 1
        assert_relative_eq!(model.log_likelihood_term(12.0, 10.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exponential_weighting() {
        let model = ErrorModel::exponential(0.5);
        let expected = ((20.0_f64.ln() - 10.0_f64.ln()) / 0.5).powi(2);
        assert_relative_eq!(
            model.log_likelihood_term(20.0, 10.0),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mixed_combines_both_sigmas() {
        let model = ErrorModel::mixed(1.0, 0.1);
        let expected = 4.0 / (1.0 + 1.0);
        assert_relative_eq!(model.log_likelihood_term(12.0, 10.0), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_prediction_stays_finite() {
        let model = ErrorModel::proportional(0.2);
        assert!(model.log_likelihood_term(5.0, 0.0).is_finite());
    }
}
