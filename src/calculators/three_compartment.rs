use super::ode::OdeCycle;
use super::{
    check_dose, checked_lag_hours, effective_infusion_hours, required_positive, CalculatorOutput,
    IntakeCalculator,
};
use crate::dosage::AbsorptionModel;
use crate::drugmodel::ParameterValues;
use crate::error::ComputingResult;
use crate::intake::IntakeEvent;

/// Three-compartment linear solver (CL, V1, Q2, V2, Q3, V3), integrated
/// numerically.
pub struct ThreeCompartment {
    absorption: AbsorptionModel,
}

pub fn create(absorption: AbsorptionModel) -> ComputingResult<Box<dyn IntakeCalculator>> {
    Ok(Box::new(ThreeCompartment { absorption }))
}

struct Rates {
    k10: f64,
    k12: f64,
    k21: f64,
    k13: f64,
    k31: f64,
    volumes: [f64; 3],
}

impl Rates {
    fn from_parameters(parameters: &ParameterValues) -> ComputingResult<Rates> {
        let cl = required_positive(parameters, "CL")?;
        let v1 = required_positive(parameters, "V1")?;
        let q2 = required_positive(parameters, "Q2")?;
        let v2 = required_positive(parameters, "V2")?;
        let q3 = required_positive(parameters, "Q3")?;
        let v3 = required_positive(parameters, "V3")?;
        Ok(Rates {
            k10: cl / v1,
            k12: q2 / v1,
            k21: q2 / v2,
            k13: q3 / v1,
            k31: q3 / v3,
            volumes: [v1, v2, v3],
        })
    }
}

impl ThreeCompartment {
    fn is_oral(&self) -> bool {
        matches!(
            self.absorption,
            AbsorptionModel::Extravascular | AbsorptionModel::ExtravascularLag
        )
    }
}

impl IntakeCalculator for ThreeCompartment {
    fn compartments(&self) -> usize {
        if self.is_oral() {
            4
        } else {
            3
        }
    }

    fn check(&self, intake: &IntakeEvent, parameters: &ParameterValues) -> ComputingResult<()> {
        check_dose(intake)?;
        Rates::from_parameters(parameters)?;
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
        let rates = Rates::from_parameters(parameters)?;
        let disposition = |a: &[f64], d: &mut [f64]| {
            d[0] = -(rates.k10 + rates.k12 + rates.k13) * a[0]
                + rates.k21 * a[1]
                + rates.k31 * a[2];
            d[1] = rates.k12 * a[0] - rates.k21 * a[1];
            d[2] = rates.k13 * a[0] - rates.k31 * a[2];
        };
        OdeCycle {
            disposition: &disposition,
            volumes: &rates.volumes,
            absorption: self.absorption,
        }
        .compute(intake, parameters, residuals_in, times)
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

    fn parameters() -> ParameterValues {
        [
            ("CL", 2.0),
            ("V1", 10.0),
            ("Q2", 1.0),
            ("V2", 5.0),
            ("Q3", 0.4),
            ("V3", 2.0),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect::<HashMap<_, _>>()
    }

    fn bolus_intake(dose: f64) -> IntakeEvent {
        IntakeEvent {
            start: instant(2018, 9, 1, 8, 0),
            interval: Duration::hours(12),
            dose,
            unit: TypedUnit::mg(),
            formulation_and_route: FormulationAndRoute::new(
                "solution",
                AdministrationRoute::Intravenous,
                AbsorptionModel::Bolus,
                "test",
            ),
            infusion_duration: None,
            points: 13,
            carry_residuals: false,
        }
    }

    #[test]
    fn test_bolus_matches_one_compartment_when_decoupled() {
        // With negligible inter-compartment flow the central compartment
        // behaves mono-exponentially.
        let mut params = parameters();
        params.insert("Q2".to_string(), 1e-9);
        params.insert("Q3".to_string(), 1e-9);
        let calc = ThreeCompartment {
            absorption: AbsorptionModel::Bolus,
        };
        let times = vec![0.0, 5.0];
        let out = calc
            .compute(&bolus_intake(100.0), &params, &[], &times)
            .unwrap();
        assert_relative_eq!(out.concentrations[0][0], 10.0, epsilon = 1e-6);
        assert_relative_eq!(
            out.concentrations[0][1],
            10.0 * (-1.0_f64).exp(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_mass_balance_without_elimination() {
        let mut params = parameters();
        params.insert("CL".to_string(), 1e-9);
        let calc = ThreeCompartment {
            absorption: AbsorptionModel::Bolus,
        };
        let times = vec![0.0, 12.0];
        let out = calc
            .compute(&bolus_intake(100.0), &params, &[], &times)
            .unwrap();
        let total = out.residuals[0] * 10.0 + out.residuals[1] * 5.0 + out.residuals[2] * 2.0;
        assert_relative_eq!(total, 100.0, epsilon = 1e-5);
    }

    #[test]
    fn test_residual_carry_between_cycles() {
        let calc = ThreeCompartment {
            absorption: AbsorptionModel::Bolus,
        };
        let params = parameters();
        let times = vec![0.0, 12.0];
        let first = calc
            .compute(&bolus_intake(100.0), &params, &[], &times)
            .unwrap();
        let second = calc
            .compute(&bolus_intake(100.0), &params, &first.residuals, &times)
            .unwrap();
        assert_relative_eq!(
            second.concentrations[0][0],
            first.residuals[0] + 10.0,
            epsilon = 1e-7
        );
        assert_relative_eq!(
            second.concentrations[1][0],
            first.residuals[1],
            epsilon = 1e-9
        );
    }
}
