use crate::calculators::{create_calculator, IntakeCalculator};
use crate::computing::Aborter;
use crate::drugmodel::{AnalyteGroup, ParameterValues};
use crate::error::{ComputingError, ComputingResult};
use crate::intake::IntakeEvent;
use crate::time::{duration_to_hours, hours_since, Instant};
use crate::units::{Dimension, TypedUnit};
use log::debug;
use serde::{Deserialize, Serialize};

/// What a row of a prediction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompartmentType {
    ActiveMoietyAndAnalyte,
    Analyte,
    Compartment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentInfo {
    pub id: String,
    pub compartment_type: CompartmentType,
}

/// Which rows a caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompartmentsOption {
    #[default]
    AllActiveMoieties,
    AllAnalytes,
    AllCompartments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStatistics {
    pub auc: f64,
    pub cumulative_auc: f64,
    pub peak: f64,
    pub trough: f64,
    pub mean: f64,
}

/// One dosing interval of sampled concentrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleData {
    pub start: Instant,
    pub end: Instant,
    /// Sample offsets in hours from the cycle start.
    pub times: Vec<f64>,
    /// One row per reported compartment.
    pub concentrations: Vec<Vec<f64>>,
    pub parameters: Vec<(String, f64)>,
    pub covariates: Vec<(String, f64)>,
    pub statistics: Option<CycleStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationPrediction {
    pub compartment_infos: Vec<CompartmentInfo>,
    pub unit: TypedUnit,
    pub cycles: Vec<CycleData>,
}

/// Per-request knobs of the concentration engine.
#[derive(Debug, Clone)]
pub struct PredictionOptions {
    pub force_ug_per_liter: bool,
    pub retrieve_statistics: bool,
    pub retrieve_parameters: bool,
    pub retrieve_covariates: bool,
    pub compartments: CompartmentsOption,
}

impl Default for PredictionOptions {
    fn default() -> Self {
        Self {
            force_ug_per_liter: false,
            retrieve_statistics: true,
            retrieve_parameters: false,
            retrieve_covariates: false,
            compartments: CompartmentsOption::default(),
        }
    }
}

/// Converts a dose to the amount scale matching the analyte concentration
/// unit, so amount/volume lands directly in that unit.
fn dose_in_analyte_scale(
    dose: f64,
    dose_unit: &TypedUnit,
    analyte_unit: &TypedUnit,
    molar_mass: Option<f64>,
) -> ComputingResult<f64> {
    if dose_unit.dimension != Dimension::Mass {
        return Err(ComputingError::BadRequest(format!(
            "dose unit {} is not a mass",
            dose_unit.symbol
        )));
    }
    let grams = dose * dose_unit.factor;
    match analyte_unit.dimension {
        Dimension::Concentration => Ok(grams / analyte_unit.factor),
        Dimension::MolarConcentration => {
            let mass = molar_mass.ok_or_else(|| {
                ComputingError::BadRequest(
                    "molar analyte unit requires a molar mass".to_string(),
                )
            })?;
            Ok(grams / mass / analyte_unit.factor)
        }
        _ => Err(ComputingError::BadRequest(format!(
            "analyte unit {} is not a concentration",
            analyte_unit.symbol
        ))),
    }
}

/// The cycle-by-cycle concentration engine.
///
/// Drives the intake calculators across the intake series, carrying
/// residuals, and emits the cycles intersecting the window.
pub struct ConcentrationCalculator<'a> {
    pub analyte_group: &'a AnalyteGroup,
    pub options: PredictionOptions,
}

impl<'a> ConcentrationCalculator<'a> {
    pub fn new(analyte_group: &'a AnalyteGroup, options: PredictionOptions) -> Self {
        Self {
            analyte_group,
            options,
        }
    }

    fn output_unit(&self) -> TypedUnit {
        if self.options.force_ug_per_liter {
            TypedUnit::ug_per_l()
        } else {
            self.analyte_group.concentration_unit.clone()
        }
    }

    /// Factor applied to computed concentrations to express them in the
    /// output unit.
    fn output_factor(&self) -> ComputingResult<f64> {
        crate::units::convert_concentration(
            1.0,
            &self.analyte_group.concentration_unit,
            &self.output_unit(),
            self.analyte_group.molar_mass,
        )
    }

    fn calculator_for(
        &self,
        intake: &IntakeEvent,
    ) -> ComputingResult<Box<dyn IntakeCalculator>> {
        create_calculator(
            self.analyte_group.structural_model,
            intake.formulation_and_route.absorption_model,
        )
    }

    fn compartment_infos(&self, carried: usize) -> Vec<CompartmentInfo> {
        let mut infos = vec![CompartmentInfo {
            id: self.analyte_group.analyte_id.clone(),
            compartment_type: CompartmentType::ActiveMoietyAndAnalyte,
        }];
        for k in 1..carried {
            infos.push(CompartmentInfo {
                id: format!("compartment{k}"),
                compartment_type: CompartmentType::Compartment,
            });
        }
        infos
    }

    fn reported_rows(&self, carried: usize) -> usize {
        match self.options.compartments {
            CompartmentsOption::AllActiveMoieties | CompartmentsOption::AllAnalytes => 1,
            CompartmentsOption::AllCompartments => carried,
        }
    }

    /// Runs the engine over the whole intake series.
    ///
    /// `resolve` yields the parameter set in effect at each intake start;
    /// `snapshot` yields the covariate snapshot for emitted cycles.
    pub fn compute<R, S>(
        &self,
        intakes: &[IntakeEvent],
        window_start: Instant,
        window_end: Instant,
        mut resolve: R,
        mut snapshot: S,
        aborter: &Aborter,
    ) -> ComputingResult<ConcentrationPrediction>
    where
        R: FnMut(&IntakeEvent) -> ComputingResult<ParameterValues>,
        S: FnMut(Instant) -> Vec<(String, f64)>,
    {
        let factor = self.output_factor()?;
        let mut residuals: Vec<f64> = Vec::new();
        let mut cycles: Vec<CycleData> = Vec::new();
        let mut infos: Option<Vec<CompartmentInfo>> = None;
        let mut cumulative_auc = 0.0;

        for intake in intakes {
            if aborter.is_aborted() {
                return Err(ComputingError::Aborted);
            }
            let parameters = resolve(intake)?;
            let calculator = self.calculator_for(intake)?;
            let carried = calculator.compartments();

            // A route switch may change the carried state shape; the
            // disposition compartments always come first, so truncate or
            // zero-extend the depot tail.
            residuals.resize(carried, 0.0);

            let prepared = self.prepare_intake(intake)?;
            calculator.check(&prepared, &parameters)?;
            let times = sample_grid(&prepared);
            let output = calculator.compute(&prepared, &parameters, &residuals, &times)?;

            if output.residuals.len() != carried || output.concentrations.len() != carried {
                return Err(ComputingError::InternalError(format!(
                    "calculator returned {} residual(s), expected {carried}",
                    output.residuals.len()
                )));
            }
            residuals = output.residuals;

            if intake.is_residual_only(window_start) || intake.start >= window_end {
                continue;
            }

            if infos.is_none() {
                infos = Some(self.compartment_infos(carried));
            }

            let reported = self.reported_rows(carried);
            let concentrations: Vec<Vec<f64>> = output
                .concentrations
                .into_iter()
                .take(reported)
                .map(|row| row.into_iter().map(|c| c * factor).collect())
                .collect();

            let statistics = if self.options.retrieve_statistics {
                let s = cycle_statistics(&times, &concentrations[0], cumulative_auc);
                cumulative_auc = s.cumulative_auc;
                Some(s)
            } else {
                None
            };

            cycles.push(CycleData {
                start: intake.start,
                end: intake.end(),
                times,
                concentrations,
                parameters: if self.options.retrieve_parameters {
                    let mut p: Vec<(String, f64)> =
                        parameters.iter().map(|(k, v)| (k.clone(), *v)).collect();
                    p.sort_by(|a, b| a.0.cmp(&b.0));
                    p
                } else {
                    Vec::new()
                },
                covariates: if self.options.retrieve_covariates {
                    snapshot(intake.start)
                } else {
                    Vec::new()
                },
                statistics,
            });
        }

        debug!("concentration engine emitted {} cycles", cycles.len());
        Ok(ConcentrationPrediction {
            compartment_infos: infos.unwrap_or_default(),
            unit: self.output_unit(),
            cycles,
        })
    }

    /// Evaluates the central concentration at arbitrary instants, used for
    /// single points, measures and the likelihood of the Bayesian fit.
    ///
    /// Instants before the first intake evaluate to zero. Instants past
    /// the last computed cycle are rejected.
    pub fn compute_at_instants<R>(
        &self,
        intakes: &[IntakeEvent],
        instants: &[Instant],
        mut resolve: R,
        aborter: &Aborter,
    ) -> ComputingResult<Vec<f64>>
    where
        R: FnMut(&IntakeEvent) -> ComputingResult<ParameterValues>,
    {
        let factor = self.output_factor()?;
        let mut values = vec![0.0; instants.len()];
        if intakes.is_empty() {
            return Ok(values);
        }
        let last_end = intakes.last().map(|i| i.end()).unwrap();
        for t in instants {
            if *t >= last_end {
                return Err(ComputingError::BadRequest(
                    "requested instant is beyond the computed range".to_string(),
                ));
            }
        }

        let mut residuals: Vec<f64> = Vec::new();
        for (cycle_index, intake) in intakes.iter().enumerate() {
            if aborter.is_aborted() {
                return Err(ComputingError::Aborted);
            }
            let cycle_end = match intakes.get(cycle_index + 1) {
                Some(next) => next.start.min(intake.end()),
                None => intake.end(),
            };
            // Offsets of the requested instants owned by this cycle.
            let mut wanted: Vec<(usize, f64)> = instants
                .iter()
                .enumerate()
                .filter(|(_, t)| **t >= intake.start && **t < cycle_end)
                .map(|(i, t)| (i, hours_since(intake.start, *t)))
                .collect();
            wanted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

            let parameters = resolve(intake)?;
            let calculator = self.calculator_for(intake)?;
            residuals.resize(calculator.compartments(), 0.0);
            let prepared = self.prepare_intake(intake)?;
            calculator.check(&prepared, &parameters)?;
            let times: Vec<f64> = wanted.iter().map(|(_, offset)| *offset).collect();
            let output = calculator.compute(&prepared, &parameters, &residuals, &times)?;
            for (slot, (original_index, _)) in wanted.iter().enumerate() {
                values[*original_index] = output.concentrations[0][slot] * factor;
            }
            residuals = output.residuals;
        }
        Ok(values)
    }

    /// Converts the dose to the analyte's amount scale.
    fn prepare_intake(&self, intake: &IntakeEvent) -> ComputingResult<IntakeEvent> {
        let mut prepared = intake.clone();
        prepared.dose = dose_in_analyte_scale(
            intake.dose,
            &intake.unit,
            &self.analyte_group.concentration_unit,
            self.analyte_group.molar_mass,
        )?;
        Ok(prepared)
    }
}

/// Uniform sample grid over a cycle, both boundaries included.
pub fn sample_grid(intake: &IntakeEvent) -> Vec<f64> {
    let interval = duration_to_hours(intake.interval);
    let n = intake.points.max(2);
    (0..n)
        .map(|i| interval * i as f64 / (n - 1) as f64)
        .collect()
}

pub(crate) fn cycle_statistics(
    times: &[f64],
    concentrations: &[f64],
    previous_cumulative: f64,
) -> CycleStatistics {
    let mut auc = 0.0;
    for w in times.windows(2).zip(concentrations.windows(2)) {
        let (t, c) = w;
        auc += (t[1] - t[0]) * (c[0] + c[1]) / 2.0;
    }
    let peak = concentrations.iter().copied().fold(0.0, f64::max);
    let trough = concentrations.last().copied().unwrap_or(0.0);
    let interval = times.last().copied().unwrap_or(0.0) - times.first().copied().unwrap_or(0.0);
    CycleStatistics {
        auc,
        cumulative_auc: previous_cumulative + auc,
        peak,
        trough,
        mean: if interval > 0.0 { auc / interval } else { 0.0 },
    }
}
