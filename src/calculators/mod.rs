pub mod michaelis_menten;
mod ode;
pub mod one_compartment;
pub mod rk;
pub mod three_compartment;
pub mod two_compartment;

use crate::dosage::AbsorptionModel;
use crate::drugmodel::{ParameterValues, StructuralModel};
use crate::error::{ComputingError, ComputingResult};
use crate::intake::IntakeEvent;
use crate::time::duration_to_hours;

/// Sampled concentrations of one cycle plus the state carried to the next.
///
/// `concentrations[k]` holds compartment k at every sample time; the depot
/// of an extravascular absorption is the last row. `residuals` has one
/// entry per row, the value at the end of the dosing interval.
#[derive(Debug, Clone)]
pub struct CalculatorOutput {
    pub concentrations: Vec<Vec<f64>>,
    pub residuals: Vec<f64>,
}

/// Cycle solver for one (structural model, absorption model) pair.
pub trait IntakeCalculator: Send + Sync {
    /// Number of carried compartments, depot included.
    fn compartments(&self) -> usize;

    /// Validates the intake and parameter set before any computation.
    fn check(&self, intake: &IntakeEvent, parameters: &ParameterValues) -> ComputingResult<()>;

    /// Computes compartment concentrations at `times` (hours from the
    /// intake start, within [0, interval]) starting from `residuals_in`.
    fn compute(
        &self,
        intake: &IntakeEvent,
        parameters: &ParameterValues,
        residuals_in: &[f64],
        times: &[f64],
    ) -> ComputingResult<CalculatorOutput>;
}

/// Resolves the calculator for a structural/absorption model pair.
pub fn create_calculator(
    structural: StructuralModel,
    absorption: AbsorptionModel,
) -> ComputingResult<Box<dyn IntakeCalculator>> {
    match structural {
        StructuralModel::Linear1CompMacro => one_compartment::create(absorption),
        StructuralModel::Linear2CompMacro | StructuralModel::Linear2CompMicro => {
            two_compartment::create(structural, absorption)
        }
        StructuralModel::Linear3CompMacro => three_compartment::create(absorption),
        StructuralModel::MichaelisMenten1Comp
        | StructuralModel::MichaelisMenten2CompMicro
        | StructuralModel::MichaelisMenten2CompMacro
        | StructuralModel::MichaelisMenten2CompVmaxAmountMacro => {
            michaelis_menten::create(structural, absorption)
        }
    }
}

/// Fetches a required parameter, failing with the parameter name.
pub(crate) fn required(parameters: &ParameterValues, key: &str) -> ComputingResult<f64> {
    parameters.get(key).copied().ok_or_else(|| {
        ComputingError::InvalidParameters(format!("missing parameter {key}"))
    })
}

/// Fetches a required strictly positive parameter.
pub(crate) fn required_positive(parameters: &ParameterValues, key: &str) -> ComputingResult<f64> {
    let v = required(parameters, key)?;
    if !(v.is_finite() && v > 0.0) {
        return Err(ComputingError::InvalidParameters(format!(
            "parameter {key} must be positive, got {v}"
        )));
    }
    Ok(v)
}

pub(crate) fn check_dose(intake: &IntakeEvent) -> ComputingResult<()> {
    if !intake.dose.is_finite() || intake.dose < 0.0 {
        return Err(ComputingError::InvalidParameters(format!(
            "dose must be non-negative, got {}",
            intake.dose
        )));
    }
    Ok(())
}

/// Infusion duration in hours, clipped to the interval: an infusion longer
/// than its interval runs without an off phase. A zero-dose event (a gap
/// filler) needs no duration.
pub(crate) fn effective_infusion_hours(intake: &IntakeEvent) -> ComputingResult<f64> {
    let interval = duration_to_hours(intake.interval);
    let tinf = match intake.infusion_duration {
        Some(d) => duration_to_hours(d),
        None if intake.dose == 0.0 => interval,
        None => {
            return Err(ComputingError::BadRequest(
                "infusion intake misses an infusion duration".to_string(),
            ))
        }
    };
    if tinf <= 0.0 {
        return Err(ComputingError::BadRequest(
            "infusion duration must be positive".to_string(),
        ));
    }
    Ok(tinf.min(interval))
}

/// Lag time in hours, rejected when it does not leave room in the
/// interval. Irrelevant for a zero-dose event.
pub(crate) fn checked_lag_hours(
    parameters: &ParameterValues,
    intake: &IntakeEvent,
) -> ComputingResult<f64> {
    if intake.dose == 0.0 {
        return Ok(0.0);
    }
    let tlag = required(parameters, "Tlag")?.max(0.0);
    if tlag >= duration_to_hours(intake.interval) {
        return Err(ComputingError::BadRequest(format!(
            "lag time {tlag} h exceeds the dosing interval"
        )));
    }
    Ok(tlag)
}

pub(crate) fn check_residual_count(
    residuals_in: &[f64],
    expected: usize,
) -> ComputingResult<()> {
    if !residuals_in.is_empty() && residuals_in.len() != expected {
        return Err(ComputingError::InternalError(format!(
            "expected {expected} residuals, got {}",
            residuals_in.len()
        )));
    }
    Ok(())
}

pub(crate) fn residual(residuals_in: &[f64], index: usize) -> f64 {
    residuals_in.get(index).copied().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_covers_all_models() {
        for structural in [
            StructuralModel::Linear1CompMacro,
            StructuralModel::Linear2CompMacro,
            StructuralModel::Linear2CompMicro,
            StructuralModel::Linear3CompMacro,
            StructuralModel::MichaelisMenten1Comp,
            StructuralModel::MichaelisMenten2CompMicro,
            StructuralModel::MichaelisMenten2CompMacro,
            StructuralModel::MichaelisMenten2CompVmaxAmountMacro,
        ] {
            for absorption in [
                AbsorptionModel::Bolus,
                AbsorptionModel::Infusion,
                AbsorptionModel::Extravascular,
                AbsorptionModel::ExtravascularLag,
            ] {
                let calculator = create_calculator(structural, absorption).unwrap();
                assert!(calculator.compartments() >= structural.compartments());
            }
        }
    }
}
