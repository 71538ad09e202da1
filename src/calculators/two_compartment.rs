use super::{
    check_dose, check_residual_count, checked_lag_hours, effective_infusion_hours, required,
    required_positive, residual, CalculatorOutput, IntakeCalculator,
};
use crate::dosage::AbsorptionModel;
use crate::drugmodel::{ParameterValues, StructuralModel};
use crate::error::{ComputingError, ComputingResult};
use crate::intake::IntakeEvent;
use crate::time::duration_to_hours;

/// Closed-form two-compartment solver, macro (CL, V1, Q, V2) or micro
/// (Ke, V1, K12, K21) parameterization, all absorption models.
pub struct TwoCompartment {
    structural: StructuralModel,
    absorption: AbsorptionModel,
}

pub fn create(
    structural: StructuralModel,
    absorption: AbsorptionModel,
) -> ComputingResult<Box<dyn IntakeCalculator>> {
    Ok(Box::new(TwoCompartment {
        structural,
        absorption,
    }))
}

/// Micro rate constants and hybrid exponents of the disposition system
///   A1' = -(k10 + k12) A1 + k21 A2 + input
///   A2' = k12 A1 - k21 A2
struct Disposition {
    k10: f64,
    k12: f64,
    k21: f64,
    v1: f64,
    /// Peripheral volume used to report compartment 2 as a concentration.
    v2: f64,
    alpha: f64,
    beta: f64,
}

impl Disposition {
    fn from_parameters(
        structural: StructuralModel,
        parameters: &ParameterValues,
    ) -> ComputingResult<Disposition> {
        let (k10, k12, k21, v1, v2) = match structural {
            StructuralModel::Linear2CompMacro => {
                let cl = required_positive(parameters, "CL")?;
                let v1 = required_positive(parameters, "V1")?;
                let q = required_positive(parameters, "Q")?;
                let v2 = required_positive(parameters, "V2")?;
                (cl / v1, q / v1, q / v2, v1, v2)
            }
            StructuralModel::Linear2CompMicro => {
                let ke = required_positive(parameters, "Ke")?;
                let v1 = required_positive(parameters, "V1")?;
                let k12 = required_positive(parameters, "K12")?;
                let k21 = required_positive(parameters, "K21")?;
                (ke, k12, k21, v1, v1)
            }
            _ => {
                return Err(ComputingError::InternalError(format!(
                    "two-compartment solver asked for {}",
                    structural.key()
                )))
            }
        };
        let a = k10 + k12 + k21;
        let discriminant = a * a - 4.0 * k10 * k21;
        if discriminant <= 0.0 {
            return Err(ComputingError::NumericalError(
                "two-compartment hybrid exponents are not distinct".to_string(),
            ));
        }
        let sqrt_disc = discriminant.sqrt();
        Ok(Disposition {
            k10,
            k12,
            k21,
            v1,
            v2,
            alpha: (a + sqrt_disc) / 2.0,
            beta: (a - sqrt_disc) / 2.0,
        })
    }

    /// Matrix exponential of the disposition system at time t.
    fn transition(&self, t: f64) -> [[f64; 2]; 2] {
        let (alpha, beta, k21, k12) = (self.alpha, self.beta, self.k21, self.k12);
        let span = alpha - beta;
        let ea = (-alpha * t).exp();
        let eb = (-beta * t).exp();
        let e11 = ((k21 - beta) * eb - (k21 - alpha) * ea) / span;
        let e12 = k21 * (eb - ea) / span;
        let e21 = k12 * (eb - ea) / span;
        let e22 = ((alpha - k21) * eb + (k21 - beta) * ea) / span;
        [[e11, e12], [e21, e22]]
    }

    fn propagate(&self, state: [f64; 2], t: f64) -> [f64; 2] {
        let e = self.transition(t);
        [
            e[0][0] * state[0] + e[0][1] * state[1],
            e[1][0] * state[0] + e[1][1] * state[1],
        ]
    }

    /// Response at time t to a constant rate infusion into the central
    /// compartment started at time 0, from a zero state.
    fn infusion_response(&self, rate: f64, t: f64) -> [f64; 2] {
        let (alpha, beta, k21, k12) = (self.alpha, self.beta, self.k21, self.k12);
        let span = alpha - beta;
        // exp_m1 keeps the integrals accurate when an exponent is tiny.
        let ia = -(-alpha * t).exp_m1() / alpha;
        let ib = -(-beta * t).exp_m1() / beta;
        let a1 = rate * ((k21 - beta) * ib - (k21 - alpha) * ia) / span;
        let a2 = rate * k12 * (ib - ia) / span;
        [a1, a2]
    }

    /// Response at time t to a depot amount absorbing first-order (ka)
    /// into the central compartment from time 0, from a zero state.
    fn depot_response(&self, ka: f64, depot_amount: f64, t: f64) -> [f64; 2] {
        let (alpha, beta, k21, k12) = (self.alpha, self.beta, self.k21, self.k12);
        let span = alpha - beta;
        let conv = |lambda: f64| {
            if (ka - lambda).abs() > 1e-10 {
                ((-lambda * t).exp() - (-ka * t).exp()) / (ka - lambda)
            } else {
                t * (-lambda * t).exp()
            }
        };
        let ca = conv(alpha);
        let cb = conv(beta);
        let a1 = ka * depot_amount * ((k21 - beta) * cb - (k21 - alpha) * ca) / span;
        let a2 = ka * depot_amount * k12 * (cb - ca) / span;
        [a1, a2]
    }
}

impl TwoCompartment {
    fn is_oral(&self) -> bool {
        matches!(
            self.absorption,
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag
        )
    }

    /// Amounts in both compartments at time t for the full cycle problem.
    fn amounts_at(
        &self,
        disposition: &Disposition,
        initial: [f64; 2],
        input: &CycleInput,
        t: f64,
    ) -> [f64; 2] {
        let mut state = disposition.propagate(initial, t);
        match *input {
            CycleInput::Bolus => {}
            CycleInput::Infusion { rate, tinf } => {
                let extra = if t <= tinf {
                    disposition.infusion_response(rate, t)
                } else {
                    let at_stop = disposition.infusion_response(rate, tinf);
                    disposition.propagate(at_stop, t - tinf)
                };
                state[0] += extra[0];
                state[1] += extra[1];
            }
            CycleInput::Depot {
                ka,
                residual_depot,
                dose_amount,
                tlag,
            } => {
                let from_residual = disposition.depot_response(ka, residual_depot, t);
                state[0] += from_residual[0];
                state[1] += from_residual[1];
                if t >= tlag {
                    let from_dose = disposition.depot_response(ka, dose_amount, t - tlag);
                    state[0] += from_dose[0];
                    state[1] += from_dose[1];
                }
            }
        }
        state
    }
}

enum CycleInput {
    Bolus,
    Infusion {
        rate: f64,
        tinf: f64,
    },
    Depot {
        ka: f64,
        residual_depot: f64,
        dose_amount: f64,
        tlag: f64,
    },
}

impl IntakeCalculator for TwoCompartment {
    fn compartments(&self) -> usize {
        if self.is_oral() {
            3
        } else {
            2
        }
    }

    fn check(&self, intake: &IntakeEvent, parameters: &ParameterValues) -> ComputingResult<()> {
        check_dose(intake)?;
        Disposition::from_parameters(self.structural, parameters)?;
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
        let disposition = Disposition::from_parameters(self.structural, parameters)?;
        let interval = duration_to_hours(intake.interval);

        // Residuals are stored as concentrations; amounts drive the system.
        let mut initial = [
            residual(residuals_in, 0) * disposition.v1,
            residual(residuals_in, 1) * disposition.v2,
        ];

        let (input, depot_track) = match self.absorption {
            AbsorptionModel::Bolus => {
                initial[0] += intake.dose;
                (CycleInput::Bolus, None)
            }
            AbsorptionModel::Infusion => {
                let tinf = effective_infusion_hours(intake)?;
                (
                    CycleInput::Infusion {
                        rate: intake.dose / tinf,
                        tinf,
                    },
                    None,
                )
            }
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag => {
                let ka = required_positive(parameters, "Ka")?;
                let f = required_positive(parameters, "F")?;
                let tlag = if self.absorption == AbsorptionModel::ExtravascularLag {
                    checked_lag_hours(parameters, intake)?
                } else {
                    required(parameters, "Tlag").unwrap_or(0.0).max(0.0)
                };
                let residual_depot = residual(residuals_in, 2);
                let dose_amount = f * intake.dose;
                (
                    CycleInput::Depot {
                        ka,
                        residual_depot,
                        dose_amount,
                        tlag,
                    },
                    Some((ka, residual_depot, dose_amount, tlag)),
                )
            }
        };

        let mut central = Vec::with_capacity(times.len());
        let mut peripheral = Vec::with_capacity(times.len());
        for &t in times {
            let amounts = self.amounts_at(&disposition, initial, &input, t);
            central.push(amounts[0] / disposition.v1);
            peripheral.push(amounts[1] / disposition.v2);
        }
        let end = self.amounts_at(&disposition, initial, &input, interval);
        let mut residuals = vec![end[0] / disposition.v1, end[1] / disposition.v2];

        let mut concentrations = vec![central, peripheral];
        if let Some((ka, residual_depot, dose_amount, tlag)) = depot_track {
            let depot_at = |t: f64| {
                let mut a = residual_depot * (-ka * t).exp();
                a += if t >= tlag {
                    dose_amount * (-ka * (t - tlag)).exp()
                } else {
                    dose_amount
                };
                a
            };
            concentrations.push(times.iter().map(|t| depot_at(*t)).collect());
            residuals.push(depot_at(interval));
        }

        Ok(CalculatorOutput {
            concentrations,
            residuals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dosage::{AdministrationRoute, FormulationAndRoute};
    use crate::time::{instant, Duration};
    use crate::units::TypedUnit;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn intake(absorption: AbsorptionModel, dose: f64, infusion_min: Option<i64>) -> IntakeEvent {
        IntakeEvent {
            start: instant(2018, 9, 1, 8, 0),
            interval: Duration::hours(12),
            dose,
            unit: TypedUnit::mg(),
            formulation_and_route: FormulationAndRoute::new(
                "solution",
                AdministrationRoute::Intravenous,
                absorption,
                "test",
            ),
            infusion_duration: infusion_min.map(Duration::minutes),
            points: 13,
            carry_residuals: false,
        }
    }

    fn vancomycin_like() -> ParameterValues {
        [
            ("CL".to_string(), 3.505),
            ("V1".to_string(), 31.05),
            ("Q".to_string(), 7.48),
            ("V2".to_string(), 99.0),
        ]
        .into_iter()
        .collect::<HashMap<_, _>>()
    }

    #[test]
    fn test_bolus_initial_concentration() {
        let calc = TwoCompartment {
            structural: StructuralModel::Linear2CompMacro,
            absorption: AbsorptionModel::Bolus,
        };
        let params = vancomycin_like();
        let intake = intake(AbsorptionModel::Bolus, 1000.0, None);
        let times = vec![0.0, 1.0, 6.0, 12.0];
        let out = calc.compute(&intake, &params, &[], &times).unwrap();
        assert_relative_eq!(out.concentrations[0][0], 1000.0 / 31.05, epsilon = 1e-9);
        // Strictly decreasing central curve for a bolus.
        assert!(out.concentrations[0][1] < out.concentrations[0][0]);
        assert!(out.concentrations[0][2] < out.concentrations[0][1]);
        // Peripheral compartment fills from zero.
        assert_relative_eq!(out.concentrations[1][0], 0.0, epsilon = 1e-12);
        assert!(out.concentrations[1][1] > 0.0);
    }

    #[test]
    fn test_transition_matrix_identity_at_zero() {
        let disposition =
            Disposition::from_parameters(StructuralModel::Linear2CompMacro, &vancomycin_like())
                .unwrap();
        let e = disposition.transition(0.0);
        assert_relative_eq!(e[0][0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(e[1][1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(e[0][1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(e[1][0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mass_balance_under_infusion() {
        // With elimination removed (tiny CL), the infused amount must be
        // conserved across both compartments.
        let params: ParameterValues = [
            ("CL".to_string(), 1e-9),
            ("V1".to_string(), 10.0),
            ("Q".to_string(), 2.0),
            ("V2".to_string(), 20.0),
        ]
        .into_iter()
        .collect();
        let calc = TwoCompartment {
            structural: StructuralModel::Linear2CompMacro,
            absorption: AbsorptionModel::Infusion,
        };
        let intake = intake(AbsorptionModel::Infusion, 120.0, Some(120));
        let times = vec![0.0, 2.0, 12.0];
        let out = calc.compute(&intake, &params, &[], &times).unwrap();
        let total_at_end = out.concentrations[0][2] * 10.0 + out.concentrations[1][2] * 20.0;
        assert_relative_eq!(total_at_end, 120.0, epsilon = 1e-6);
    }

    #[test]
    fn test_infusion_peak_at_stop() {
        let calc = TwoCompartment {
            structural: StructuralModel::Linear2CompMacro,
            absorption: AbsorptionModel::Infusion,
        };
        let params = vancomycin_like();
        let intake = intake(AbsorptionModel::Infusion, 1000.0, Some(120));
        let times: Vec<f64> = (0..=120).map(|i| i as f64 * 0.1).collect();
        let out = calc.compute(&intake, &params, &[], &times).unwrap();
        let peak_index = out.concentrations[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        // Central peak sits at the end of the 2 h infusion.
        assert_eq!(peak_index, 20);
    }

    #[test]
    fn test_micro_parameterization_matches_macro() {
        let macro_params = vancomycin_like();
        let micro_params: ParameterValues = [
            ("Ke".to_string(), 3.505 / 31.05),
            ("V1".to_string(), 31.05),
            ("K12".to_string(), 7.48 / 31.05),
            ("K21".to_string(), 7.48 / 99.0),
        ]
        .into_iter()
        .collect();
        let macro_calc = TwoCompartment {
            structural: StructuralModel::Linear2CompMacro,
            absorption: AbsorptionModel::Bolus,
        };
        let micro_calc = TwoCompartment {
            structural: StructuralModel::Linear2CompMicro,
            absorption: AbsorptionModel::Bolus,
        };
        let intake = intake(AbsorptionModel::Bolus, 1000.0, None);
        let times = vec![0.0, 3.0, 6.0, 12.0];
        let a = macro_calc
            .compute(&intake, &macro_params, &[], &times)
            .unwrap();
        let b = micro_calc
            .compute(&intake, &micro_params, &[], &times)
            .unwrap();
        for (x, y) in a.concentrations[0].iter().zip(&b.concentrations[0]) {
            assert_relative_eq!(x, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_extravascular_depot_carries() {
        let mut params = vancomycin_like();
        params.insert("Ka".to_string(), 0.7);
        params.insert("F".to_string(), 0.8);
        let calc = TwoCompartment {
            structural: StructuralModel::Linear2CompMacro,
            absorption: AbsorptionModel::Extravascular,
        };
        let intake = intake(AbsorptionModel::Extravascular, 1000.0, None);
        let times = vec![0.0, 6.0, 12.0];
        let out = calc.compute(&intake, &params, &[], &times).unwrap();
        assert_eq!(out.concentrations.len(), 3);
        assert_eq!(out.residuals.len(), 3);
        assert_relative_eq!(out.concentrations[2][0], 800.0, epsilon = 1e-9);
        assert!(out.residuals[2] < 800.0);
        // Second cycle starts exactly from the carried state.
        let second = calc
            .compute(&intake, &params, &out.residuals, &times)
            .unwrap();
        assert_relative_eq!(
            second.concentrations[0][0],
            out.residuals[0],
            epsilon = 1e-9
        );
    }
}
