use super::{
    check_dose, check_residual_count, checked_lag_hours, effective_infusion_hours, required,
    required_positive, residual, CalculatorOutput, IntakeCalculator,
};
use crate::dosage::AbsorptionModel;
use crate::drugmodel::ParameterValues;
use crate::error::ComputingResult;
use crate::intake::IntakeEvent;
use crate::time::duration_to_hours;

/// Closed-form one-compartment solver (CL, V), all absorption models.
pub struct OneCompartment {
    absorption: AbsorptionModel,
}

pub fn create(absorption: AbsorptionModel) -> ComputingResult<Box<dyn IntakeCalculator>> {
    Ok(Box::new(OneCompartment { absorption }))
}

/// First-order absorption response of a unit depot amount, handling the
/// flip-flop case where ka approaches ke.
fn absorption_profile(ka: f64, ke: f64, v: f64, t: f64) -> f64 {
    if t < 0.0 {
        return 0.0;
    }
    if (ka - ke).abs() > 1e-10 {
        (ka / (v * (ka - ke))) * ((-ke * t).exp() - (-ka * t).exp())
    } else {
        (ka / v) * t * (-ke * t).exp()
    }
}

impl OneCompartment {
    fn is_oral(&self) -> bool {
        matches!(
            self.absorption,
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag
        )
    }

    fn compute_bolus(
        &self,
        intake: &IntakeEvent,
        ke: f64,
        v: f64,
        residuals_in: &[f64],
        times: &[f64],
    ) -> CalculatorOutput {
        let c0 = residual(residuals_in, 0) + intake.dose / v;
        let interval = duration_to_hours(intake.interval);
        let concentrations: Vec<f64> = times.iter().map(|t| c0 * (-ke * t).exp()).collect();
        CalculatorOutput {
            concentrations: vec![concentrations],
            residuals: vec![c0 * (-ke * interval).exp()],
        }
    }

    fn compute_infusion(
        &self,
        intake: &IntakeEvent,
        ke: f64,
        v: f64,
        tinf: f64,
        residuals_in: &[f64],
        times: &[f64],
    ) -> CalculatorOutput {
        let cl = ke * v;
        let plateau = intake.dose / (tinf * cl);
        let r0 = residual(residuals_in, 0);
        let interval = duration_to_hours(intake.interval);
        let at = |t: f64| {
            let base = r0 * (-ke * t).exp();
            if t <= tinf {
                base + plateau * (1.0 - (-ke * t).exp())
            } else {
                base + plateau * (1.0 - (-ke * tinf).exp()) * (-ke * (t - tinf)).exp()
            }
        };
        CalculatorOutput {
            concentrations: vec![times.iter().map(|t| at(*t)).collect()],
            residuals: vec![at(interval)],
        }
    }

    fn compute_extravascular(
        &self,
        intake: &IntakeEvent,
        ke: f64,
        v: f64,
        ka: f64,
        bioavailability: f64,
        tlag: f64,
        residuals_in: &[f64],
        times: &[f64],
    ) -> CalculatorOutput {
        // Residual depot keeps absorbing from the cycle start; the new dose
        // reaches the depot after the lag.
        let depot0 = residual(residuals_in, 1);
        let dose_amount = bioavailability * intake.dose;
        let c0 = residual(residuals_in, 0);
        let interval = duration_to_hours(intake.interval);

        let central = |t: f64| {
            let mut c = c0 * (-ke * t).exp() + depot0 * absorption_profile(ka, ke, v, t);
            if t >= tlag {
                c += dose_amount * absorption_profile(ka, ke, v, t - tlag);
            }
            c
        };
        let depot = |t: f64| {
            let mut a = depot0 * (-ka * t).exp();
            a += if t >= tlag {
                dose_amount * (-ka * (t - tlag)).exp()
            } else {
                dose_amount
            };
            a
        };

        CalculatorOutput {
            concentrations: vec![
                times.iter().map(|t| central(*t)).collect(),
                times.iter().map(|t| depot(*t)).collect(),
            ],
            residuals: vec![central(interval), depot(interval)],
        }
    }
}

impl IntakeCalculator for OneCompartment {
    fn compartments(&self) -> usize {
        if self.is_oral() {
            2
        } else {
            1
        }
    }

    fn check(&self, intake: &IntakeEvent, parameters: &ParameterValues) -> ComputingResult<()> {
        check_dose(intake)?;
        required_positive(parameters, "CL")?;
        required_positive(parameters, "V")?;
        match self.absorption {
            AbsorptionModel::Bolus => {}
            AbsorptionModel::Infusion => {
                effective_infusion_hours(intake)?;
            }
            AbsorptionModel::Extravascular => {
                required_positive(parameters, "Ka")?;
                required_positive(parameters, "F")?;
            }
            AbsorptionModel::ExtravascularLag => {
                required_positive(parameters, "Ka")?;
                required_positive(parameters, "F")?;
                checked_lag_hours(parameters, intake)?;
            }
        }
        Ok(())
    }

    fn compute(
        &self,
        intake: &IntakeEvent,
        parameters: &ParameterValues,
        residuals_in: &[f64],
        times: &[f64],
    ) -> ComputingResult<CalculatorOutput> {
        check_residual_count(residuals_in, self.compartments())?;
        let cl = required_positive(parameters, "CL")?;
        let v = required_positive(parameters, "V")?;
        let ke = cl / v;

        let output = match self.absorption {
            AbsorptionModel::Bolus => self.compute_bolus(intake, ke, v, residuals_in, times),
            AbsorptionModel::Infusion => {
                let tinf = effective_infusion_hours(intake)?;
                self.compute_infusion(intake, ke, v, tinf, residuals_in, times)
            }
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag => {
                let ka = required_positive(parameters, "Ka")?;
                let f = required_positive(parameters, "F")?;
                let tlag = if self.absorption == AbsorptionModel::ExtravascularLag {
                    checked_lag_hours(parameters, intake)?
                } else {
                    required(parameters, "Tlag").unwrap_or(0.0).max(0.0)
                };
                self.compute_extravascular(
                    intake,
                    ke,
                    v,
                    ka,
                    f,
                    tlag,
                    residuals_in,
                    times,
                )
            }
        };
        Ok(output)
    }
}
