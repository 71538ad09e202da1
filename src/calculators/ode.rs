use super::rk::AdaptiveRk;
use super::{
    check_residual_count, checked_lag_hours, effective_infusion_hours, required,
    required_positive, residual, CalculatorOutput,
};
use crate::dosage::AbsorptionModel;
use crate::drugmodel::ParameterValues;
use crate::error::ComputingResult;
use crate::intake::IntakeEvent;
use crate::time::duration_to_hours;

/// Drives one cycle of a model defined by its disposition derivatives,
/// handling absorption input, sample recording and residual carry.
///
/// The state vector is the disposition amounts followed by the depot
/// amount for extravascular absorption. Reported concentrations divide
/// each disposition amount by its volume; the depot row stays an amount.
pub(crate) struct OdeCycle<'a> {
    /// Writes the disposition-only derivatives of `amounts` into `d`.
    pub disposition: &'a dyn Fn(&[f64], &mut [f64]),
    /// One volume per disposition compartment.
    pub volumes: &'a [f64],
    pub absorption: AbsorptionModel,
}

impl OdeCycle<'_> {
    pub(crate) fn compute(
        &self,
        intake: &IntakeEvent,
        parameters: &ParameterValues,
        residuals_in: &[f64],
        times: &[f64],
    ) -> ComputingResult<CalculatorOutput> {
        let n = self.volumes.len();
        let has_depot = matches!(
            self.absorption,
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag
        );
        let state_len = n + usize::from(has_depot);
        check_residual_count(residuals_in, state_len)?;

        let interval = duration_to_hours(intake.interval);
        let mut y = vec![0.0; state_len];
        for i in 0..n {
            y[i] = residual(residuals_in, i) * self.volumes[i];
        }

        // Absorption setup: initial impulse, constant rate or depot flow.
        let mut infusion_rate = 0.0;
        let mut infusion_stop = 0.0;
        let mut ka = 0.0;
        let mut lag_impulse: Option<(f64, f64)> = None;
        match self.absorption {
            AbsorptionModel::Bolus => {
                y[0] += intake.dose;
            }
            AbsorptionModel::Infusion => {
                let tinf = effective_infusion_hours(intake)?;
                infusion_rate = intake.dose / tinf;
                infusion_stop = tinf;
            }
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag => {
                ka = required_positive(parameters, "Ka")?;
                let f = required_positive(parameters, "F")?;
                let tlag = if self.absorption == AbsorptionModel::ExtravascularLag {
                    checked_lag_hours(parameters, intake)?
                } else {
                    required(parameters, "Tlag").unwrap_or(0.0).max(0.0)
                };
                y[state_len - 1] = residual(residuals_in, state_len - 1);
                if tlag > 0.0 {
                    lag_impulse = Some((tlag, f * intake.dose));
                } else {
                    y[state_len - 1] += f * intake.dose;
                }
            }
        }

        let disposition = self.disposition;
        let rhs = move |t: f64, y: &[f64], dy: &mut [f64]| {
            disposition(&y[..n], &mut dy[..n]);
            if has_depot {
                let depot = y[n];
                dy[n] = -ka * depot;
                dy[0] += ka * depot;
            }
            if infusion_rate > 0.0 && t < infusion_stop {
                dy[0] += infusion_rate;
            }
        };

        let rk = AdaptiveRk::default();
        let mut rows = vec![Vec::with_capacity(times.len()); state_len];
        let mut t_cur = 0.0;

        // Integration breakpoints: the infusion stop and the lag instant.
        let mut breaks: Vec<f64> = Vec::new();
        if infusion_rate > 0.0 && infusion_stop < interval {
            breaks.push(infusion_stop);
        }
        if let Some((tlag, _)) = lag_impulse {
            breaks.push(tlag);
        }
        breaks.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut next_break = 0;

        let mut advance_to =
            |target: f64, y: &mut Vec<f64>, next_break: &mut usize| -> ComputingResult<()> {
                while *next_break < breaks.len() && breaks[*next_break] <= target {
                    let b = breaks[*next_break];
                    rk.integrate(&rhs, y, t_cur, b)?;
                    t_cur = b;
                    if let Some((tlag, amount)) = lag_impulse {
                        if (b - tlag).abs() < 1e-12 {
                            y[state_len - 1] += amount;
                        }
                    }
                    *next_break += 1;
                }
                rk.integrate(&rhs, y, t_cur, target)?;
                t_cur = target;
                Ok(())
            };

        for &t in times {
            advance_to(t.min(interval), &mut y, &mut next_break)?;
            for i in 0..n {
                rows[i].push(y[i] / self.volumes[i]);
            }
            if has_depot {
                rows[n].push(y[n]);
            }
        }
        advance_to(interval, &mut y, &mut next_break)?;

        let mut residuals = vec![0.0; state_len];
        for i in 0..n {
            residuals[i] = y[i] / self.volumes[i];
        }
        if has_depot {
            residuals[n] = y[n];
        }

        Ok(CalculatorOutput {
            concentrations: rows,
            residuals,
        })
    }
}
