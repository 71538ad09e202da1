use crate::computing::Aborter;
use crate::covariate::CovariateSeries;
use crate::drugmodel::{AnalyteGroup, DrugModel, ParameterDefinition, ParameterValues};
use crate::error::{ComputingError, ComputingResult};
use crate::intake::IntakeEvent;
use crate::prediction::{ConcentrationCalculator, PredictionOptions};
use crate::time::Instant;
use crate::treatment::Sample;
use crate::units::convert_concentration;
use log::debug;
use std::collections::HashMap;

/// Which level of individualization the parameters carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PredictionParameterType {
    Population,
    Apriori,
    Aposteriori,
}

/// Random effects of the a posteriori fit, one per variable parameter.
pub type Etas = HashMap<String, f64>;

/// Resolves the parameter set in effect at a cycle start: disposition
/// parameters of the analyte group plus the absorption parameters of the
/// intake's formulation and route.
pub struct ParameterResolver<'a> {
    pub model: &'a DrugModel,
    pub group: &'a AnalyteGroup,
    pub covariates: &'a CovariateSeries,
}

impl ParameterResolver<'_> {
    fn resolve_definition(
        &self,
        definition: &ParameterDefinition,
        mode: PredictionParameterType,
        at: Instant,
    ) -> ComputingResult<f64> {
        let value = match (mode, &definition.apriori) {
            (PredictionParameterType::Population, _) | (_, None) => definition.standard_value,
            (_, Some(formula)) => {
                let inputs = self.covariates.values_at(at);
                formula.evaluate(definition.standard_value, &inputs)?
            }
        };
        Ok(value)
    }

    /// Parameter set for one intake. `etas` individualizes the values the
    /// way the a posteriori estimator determined.
    pub fn resolve_for_intake(
        &self,
        intake: &IntakeEvent,
        mode: PredictionParameterType,
        etas: Option<&Etas>,
    ) -> ComputingResult<ParameterValues> {
        let mut values = ParameterValues::new();
        let full = self
            .model
            .formulation_and_route(&intake.formulation_and_route)?;
        let definitions = self
            .group
            .parameters
            .iter()
            .chain(full.absorption_parameters.iter());

        for definition in definitions {
            let mut value = self.resolve_definition(definition, mode, intake.start)?;
            if let Some(etas) = etas {
                if let Some(eta) = etas.get(&definition.id) {
                    value = definition.bsv.apply_eta(value, *eta);
                }
            }
            if !definition.is_valid(value) {
                return Err(ComputingError::InvalidParameters(format!(
                    "parameter {} resolved to {} outside its validity range",
                    definition.id, value
                )));
            }
            values.insert(definition.id.clone(), value);
        }
        Ok(values)
    }

    /// Variable parameter definitions in deterministic order, the support
    /// of the eta vector.
    pub fn variable_definitions(&self, intakes: &[IntakeEvent]) -> Vec<ParameterDefinition> {
        let mut seen: Vec<ParameterDefinition> = self
            .group
            .parameters
            .iter()
            .filter(|p| p.bsv.is_variable())
            .cloned()
            .collect();
        for intake in intakes {
            if let Ok(full) = self
                .model
                .formulation_and_route(&intake.formulation_and_route)
            {
                for p in full.absorption_parameters.iter().filter(|p| p.bsv.is_variable()) {
                    if !seen.iter().any(|s| s.id == p.id) {
                        seen.push(p.clone());
                    }
                }
            }
        }
        seen
    }
}

const MAX_OPTIMIZER_STEPS: usize = 200;
const GRADIENT_TOLERANCE: f64 = 1e-6;
const GRADIENT_EPSILON: f64 = 1e-5;

/// Maximum-a-posteriori estimation of the random effects given the
/// patient samples.
///
/// The objective is the penalized least squares
/// `sum(eta_i^2 / omega_i^2) + sum(weighted residual of each sample)`
/// with weights from the analyte group's error model.
pub struct BayesianEstimator<'a> {
    pub resolver: &'a ParameterResolver<'a>,
    pub intakes: &'a [IntakeEvent],
    pub aborter: &'a Aborter,
}

impl BayesianEstimator<'_> {
    /// Valid samples of the group's analyte, converted to the analyte
    /// concentration unit.
    fn prepare_observations(
        &self,
        samples: &[Sample],
    ) -> ComputingResult<(Vec<Instant>, Vec<f64>)> {
        let group = self.resolver.group;
        let first_intake = self
            .intakes
            .first()
            .map(|i| i.start)
            .ok_or(ComputingError::NoSample)?;
        let mut instants = Vec::new();
        let mut values = Vec::new();
        for sample in samples.iter().filter(|s| s.analyte_id == group.analyte_id) {
            if sample.date < first_intake {
                return Err(ComputingError::SampleBeforeTreatmentStart);
            }
            instants.push(sample.date);
            values.push(convert_concentration(
                sample.value,
                &sample.unit,
                &group.concentration_unit,
                group.molar_mass,
            )?);
        }
        if instants.is_empty() {
            return Err(ComputingError::NoSample);
        }
        Ok((instants, values))
    }

    fn objective(
        &self,
        definitions: &[ParameterDefinition],
        etas: &[f64],
        instants: &[Instant],
        observed: &[f64],
    ) -> f64 {
        let eta_map: Etas = definitions
            .iter()
            .zip(etas)
            .map(|(d, e)| (d.id.clone(), *e))
            .collect();
        let engine = ConcentrationCalculator::new(
            self.resolver.group,
            PredictionOptions {
                force_ug_per_liter: false,
                retrieve_statistics: false,
                ..Default::default()
            },
        );
        let predicted = engine.compute_at_instants(
            self.intakes,
            instants,
            |intake| {
                self.resolver.resolve_for_intake(
                    intake,
                    PredictionParameterType::Apriori,
                    Some(&eta_map),
                )
            },
            self.aborter,
        );
        let predicted = match predicted {
            Ok(p) => p,
            Err(_) => return f64::INFINITY,
        };

        let mut total = 0.0;
        for (definition, eta) in definitions.iter().zip(etas) {
            total += (eta / definition.bsv.std_dev).powi(2);
        }
        for (observation, prediction) in observed.iter().zip(&predicted) {
            total += self
                .resolver
                .group
                .error_model
                .log_likelihood_term(*observation, *prediction);
        }
        total
    }

    fn gradient(
        &self,
        definitions: &[ParameterDefinition],
        etas: &[f64],
        instants: &[Instant],
        observed: &[f64],
        at_value: f64,
    ) -> Vec<f64> {
        let mut gradient = vec![0.0; etas.len()];
        let mut probe = etas.to_vec();
        for i in 0..etas.len() {
            probe[i] = etas[i] + GRADIENT_EPSILON;
            let forward = self.objective(definitions, &probe, instants, observed);
            probe[i] = etas[i];
            gradient[i] = (forward - at_value) / GRADIENT_EPSILON;
        }
        gradient
    }

    fn descend(
        &self,
        definitions: &[ParameterDefinition],
        instants: &[Instant],
        observed: &[f64],
        initial_step: f64,
    ) -> ComputingResult<Option<Vec<f64>>> {
        let n = definitions.len();
        let mut etas = vec![0.0; n];
        let mut value = self.objective(definitions, &etas, instants, observed);
        if !value.is_finite() {
            return Ok(None);
        }

        for _ in 0..MAX_OPTIMIZER_STEPS {
            if self.aborter.is_aborted() {
                return Err(ComputingError::Aborted);
            }
            let gradient = self.gradient(definitions, &etas, instants, observed, value);
            let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
            if !norm.is_finite() {
                return Ok(None);
            }
            if norm < GRADIENT_TOLERANCE {
                break;
            }

            // Backtracking line search along the negative gradient.
            let mut step = initial_step;
            let mut improved = false;
            for _ in 0..40 {
                let candidate: Vec<f64> = etas
                    .iter()
                    .zip(&gradient)
                    .map(|(e, g)| e - step * g)
                    .collect();
                let candidate_value =
                    self.objective(definitions, &candidate, instants, observed);
                if candidate_value.is_finite() && candidate_value < value {
                    etas = candidate;
                    value = candidate_value;
                    improved = true;
                    break;
                }
                step /= 2.0;
            }
            if !improved {
                // A stall with a small gradient is convergence, a stall
                // with a large one is a failed fit.
                if norm < 1e-3 {
                    break;
                }
                return Ok(None);
            }
        }
        Ok(Some(etas))
    }

    /// Runs the fit. A diverged first attempt is retried once with a
    /// damped initial step before giving up.
    pub fn estimate(&self, samples: &[Sample]) -> ComputingResult<Etas> {
        let (instants, observed) = self.prepare_observations(samples)?;
        let definitions = self.resolver.variable_definitions(self.intakes);
        if definitions.is_empty() {
            return Ok(Etas::new());
        }

        for initial_step in [0.1, 0.01] {
            match self.descend(&definitions, &instants, &observed, initial_step)? {
                Some(etas) => {
                    debug!("bayesian fit converged: {etas:?}");
                    return Ok(definitions
                        .iter()
                        .zip(etas)
                        .map(|(d, e)| (d.id.clone(), e))
                        .collect());
                }
                None => continue,
            }
        }
        Err(ComputingError::BayesianFitFailed(
            "optimization diverged from both seeds".to_string(),
        ))
    }
}
