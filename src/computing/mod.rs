use crate::adjustment::{compute_adjustment, AdjustmentData};
use crate::covariate::CovariateSeries;
use crate::drugmodel::{AnalyteGroup, DrugModel};
use crate::error::{ComputingError, ComputingResult, ComputingStatus};
use crate::intake::{extract_intakes, total_window_points};
use crate::overload::OverloadEvaluator;
use crate::parameters::{BayesianEstimator, Etas, ParameterResolver, PredictionParameterType};
use crate::percentiles::{PercentileConfig, PercentileEngine, PercentilesData};
use crate::prediction::{
    CompartmentsOption, ConcentrationCalculator, ConcentrationPrediction, PredictionOptions,
};
use crate::time::{duration_from_hours, Duration, Instant};
use crate::treatment::DrugTreatment;
use crate::units::{ResultUnitOption, TypedUnit};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Thread-safe monotonic cancellation flag, shared between the caller and
/// the engines. Checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct Aborter(Arc<AtomicBool>);

impl Aborter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// General options shared by every computing trait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputingOption {
    pub parameter_type: PredictionParameterType,
    pub compartments: CompartmentsOption,
    pub result_unit: ResultUnitOption,
    pub retrieve_statistics: bool,
    pub retrieve_parameters: bool,
    pub retrieve_covariates: bool,
}

impl Default for ComputingOption {
    fn default() -> Self {
        Self {
            parameter_type: PredictionParameterType::Population,
            compartments: CompartmentsOption::default(),
            result_unit: ResultUnitOption::default(),
            retrieve_statistics: true,
            retrieve_parameters: false,
            retrieve_covariates: false,
        }
    }
}

impl ComputingOption {
    pub fn with_parameter_type(parameter_type: PredictionParameterType) -> Self {
        Self {
            parameter_type,
            ..Default::default()
        }
    }

    pub(crate) fn prediction_options(&self) -> PredictionOptions {
        PredictionOptions {
            force_ug_per_liter: self.result_unit == ResultUnitOption::ForceUgPerLiter,
            retrieve_statistics: self.retrieve_statistics,
            retrieve_parameters: self.retrieve_parameters,
            retrieve_covariates: self.retrieve_covariates,
            compartments: self.compartments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationTrait {
    pub start: Instant,
    pub end: Instant,
    pub points_per_hour: f64,
    #[serde(default)]
    pub options: ComputingOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentilesTrait {
    pub start: Instant,
    pub end: Instant,
    pub points_per_hour: f64,
    pub ranks: Vec<f64>,
    #[serde(default)]
    pub options: ComputingOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglePointsTrait {
    pub instants: Vec<Instant>,
    #[serde(default)]
    pub options: ComputingOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtMeasuresTrait {
    #[serde(default)]
    pub options: ComputingOption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BestCandidatesOption {
    #[default]
    BestDosage,
    AllDosages,
    BestDosagePerInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadingOption {
    #[default]
    NoLoadingDose,
    LoadingDoseAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestPeriodOption {
    #[default]
    NoRestPeriod,
    RestPeriodAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SteadyStateTargetOption {
    #[default]
    AtSteadyState,
    WithinTreatmentTimeRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetExtractionOption {
    #[default]
    PopulationValues,
    AprioriValues,
    IndividualTargets,
    DefinitionIfNoIndividualTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FormulationAndRouteSelectionOption {
    #[default]
    LastFormulationAndRoute,
    DefaultFormulationAndRoute,
    AllFormulationAndRoutes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentTrait {
    pub start: Instant,
    pub end: Instant,
    pub points_per_hour: f64,
    #[serde(default)]
    pub options: ComputingOption,
    pub adjustment_time: Instant,
    #[serde(default)]
    pub candidates: BestCandidatesOption,
    #[serde(default)]
    pub loading: LoadingOption,
    #[serde(default)]
    pub rest_period: RestPeriodOption,
    #[serde(default)]
    pub steady_state_target: SteadyStateTargetOption,
    #[serde(default)]
    pub target_extraction: TargetExtractionOption,
    #[serde(default)]
    pub formulation_and_route_selection: FormulationAndRouteSelectionOption,
}

/// What to compute, dispatched by the computing component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ComputingTrait {
    Concentration(ConcentrationTrait),
    Percentiles(PercentilesTrait),
    SinglePoints(SinglePointsTrait),
    AtMeasures(AtMeasuresTrait),
    Adjustment(AdjustmentTrait),
}

/// A full computation request. The drug model and treatment are owned so
/// the caller may release its copies after `compute` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputingRequest {
    pub id: String,
    pub drug_model: DrugModel,
    pub treatment: DrugTreatment,
    pub traits: Vec<ComputingTrait>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglePointsData {
    pub instants: Vec<Instant>,
    pub unit: TypedUnit,
    /// One row per reported compartment, aligned with `instants`.
    pub concentrations: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponsePayload {
    SinglePrediction(ConcentrationPrediction),
    Percentiles(PercentilesData),
    SinglePoints(SinglePointsData),
    Adjustment(AdjustmentData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputingResponse {
    pub id: String,
    pub payloads: Vec<ResponsePayload>,
}

/// 64-bit FNV-1a, the stable hash behind fingerprints and seeds.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Structural hash of a treatment, stable across processes.
pub fn treatment_fingerprint(treatment: &DrugTreatment) -> u64 {
    match serde_json::to_string(treatment) {
        Ok(serialized) => fnv1a64(serialized.as_bytes()),
        Err(_) => 0,
    }
}

/// Cache identity of a percentiles computation: everything but the window
/// and the points per hour, which the cache matches structurally.
pub fn percentile_cache_key(
    request: &ComputingRequest,
    percentiles: &PercentilesTrait,
) -> u64 {
    let mut key = fnv1a64(request.drug_model.drug_model_id.as_bytes());
    key ^= treatment_fingerprint(&request.treatment);
    for rank in &percentiles.ranks {
        key = key.rotate_left(7) ^ rank.to_bits();
    }
    let options = serde_json::to_string(&percentiles.options).unwrap_or_default();
    key ^ fnv1a64(options.as_bytes())
}

/// Monte-Carlo seed: a documented function of the request fingerprint
/// (id, drug model and treatment), never of the wall clock.
pub fn percentile_seed(request: &ComputingRequest) -> u64 {
    fnv1a64(request.id.as_bytes())
        ^ fnv1a64(request.drug_model.drug_model_id.as_bytes())
        ^ treatment_fingerprint(&request.treatment)
}

/// The computing component: dispatches each trait of a request to the
/// matching engine and assembles the response.
pub struct ComputingComponent {
    pub overload: OverloadEvaluator,
    pub percentile_config: PercentileConfig,
    last_error: Mutex<String>,
}

impl Default for ComputingComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputingComponent {
    pub fn new() -> Self {
        Self {
            overload: OverloadEvaluator::default(),
            percentile_config: PercentileConfig::default(),
            last_error: Mutex::new(String::new()),
        }
    }

    pub fn with_percentile_samples(mut self, sample_count: usize) -> Self {
        self.percentile_config.sample_count = sample_count;
        self
    }

    /// Description of the last failure. Meaningful only after `compute`
    /// returned an error.
    pub fn error_string(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }

    pub fn compute(
        &self,
        request: &ComputingRequest,
        aborter: &Aborter,
    ) -> ComputingResult<ComputingResponse> {
        let result = self.compute_inner(request, aborter);
        if let Err(error) = &result {
            let mut last = self.last_error.lock().unwrap();
            *last = error.to_string();
            warn!("computation {} failed: {last} ({:?})", request.id, error.status());
        }
        result
    }

    fn compute_inner(
        &self,
        request: &ComputingRequest,
        aborter: &Aborter,
    ) -> ComputingResult<ComputingResponse> {
        info!(
            "computing request {} with {} trait(s)",
            request.id,
            request.traits.len()
        );
        request.drug_model.validate()?;
        request.treatment.validate()?;
        self.check_samples(request)?;

        let mut payloads = Vec::with_capacity(request.traits.len());
        for computing_trait in &request.traits {
            if aborter.is_aborted() {
                return Err(ComputingError::Aborted);
            }
            let payload = match computing_trait {
                ComputingTrait::Concentration(t) => self.concentration(request, t, aborter)?,
                ComputingTrait::Percentiles(t) => {
                    ResponsePayload::Percentiles(self.percentiles(request, t, aborter)?)
                }
                ComputingTrait::SinglePoints(t) => self.single_points(request, t, aborter)?,
                ComputingTrait::AtMeasures(t) => self.at_measures(request, t, aborter)?,
                ComputingTrait::Adjustment(t) => ResponsePayload::Adjustment(
                    compute_adjustment(self, request, t, aborter)?,
                ),
            };
            payloads.push(payload);
        }
        Ok(ComputingResponse {
            id: request.id.clone(),
            payloads,
        })
    }

    fn check_samples(&self, request: &ComputingRequest) -> ComputingResult<()> {
        if request.treatment.samples.is_empty() {
            return Ok(());
        }
        let first_intake = request
            .treatment
            .first_intake_time()
            .ok_or(ComputingError::SampleBeforeTreatmentStart)?;
        if request
            .treatment
            .samples
            .iter()
            .any(|s| s.date < first_intake)
        {
            return Err(ComputingError::SampleBeforeTreatmentStart);
        }
        let known: Vec<&str> = request
            .drug_model
            .analyte_groups
            .iter()
            .map(|g| g.analyte_id.as_str())
            .collect();
        if !request
            .treatment
            .samples
            .iter()
            .any(|s| known.contains(&s.analyte_id.as_str()))
        {
            return Err(ComputingError::NoAnalyteMatch(
                "no sample matches an analyte of the drug model".to_string(),
            ));
        }
        Ok(())
    }

    /// The analyte group the engines run on.
    pub(crate) fn operative_group<'a>(
        &self,
        model: &'a DrugModel,
    ) -> ComputingResult<&'a AnalyteGroup> {
        model.analyte_groups.first().ok_or_else(|| {
            ComputingError::BadRequest("drug model has no analyte group".to_string())
        })
    }

    /// Window length over which residuals converge, from the population
    /// elimination rate when the model has one.
    pub(crate) fn half_life_hint(&self, group: &AnalyteGroup) -> Option<Duration> {
        group
            .structural_model
            .elimination_rate(&group.standard_values())
            .filter(|ke| *ke > 0.0)
            .map(|ke| duration_from_hours((std::f64::consts::LN_2 / ke).clamp(0.5, 168.0)))
    }

    /// Resolves the effective mode and etas for a request: a posteriori
    /// runs the Bayesian fit, falling back to a priori without samples.
    pub(crate) fn determine_etas(
        &self,
        request: &ComputingRequest,
        group: &AnalyteGroup,
        resolver: &ParameterResolver<'_>,
        mode: PredictionParameterType,
        aborter: &Aborter,
    ) -> ComputingResult<(PredictionParameterType, Etas)> {
        if mode != PredictionParameterType::Aposteriori {
            return Ok((mode, Etas::new()));
        }
        let first_intake = match request.treatment.first_intake_time() {
            Some(t) => t,
            None => return Ok((PredictionParameterType::Apriori, Etas::new())),
        };
        let last_intake_end = request
            .treatment
            .samples
            .iter()
            .map(|s| s.date)
            .max()
            .map(|t| t + Duration::hours(1))
            .unwrap_or(first_intake);
        if last_intake_end <= first_intake {
            return Ok((PredictionParameterType::Apriori, Etas::new()));
        }
        let hint = self.half_life_hint(group);
        let fit_intakes = extract_intakes(
            &request.treatment.dose_history,
            first_intake,
            last_intake_end,
            2.0,
            hint,
        )?;
        // Samples the intake series cannot reach would fail the fit.
        let coverage = fit_intakes.last().map(|i| i.end());
        let usable: Vec<_> = request
            .treatment
            .samples
            .iter()
            .filter(|s| coverage.map(|end| s.date < end).unwrap_or(false))
            .cloned()
            .collect();
        let estimator = BayesianEstimator {
            resolver,
            intakes: &fit_intakes,
            aborter,
        };
        match estimator.estimate(&usable) {
            Ok(etas) => Ok((PredictionParameterType::Apriori, etas)),
            Err(ComputingError::NoSample) => {
                debug!("no usable sample, falling back to a priori");
                Ok((PredictionParameterType::Apriori, Etas::new()))
            }
            Err(error) => Err(error),
        }
    }

    fn build_covariates(
        &self,
        request: &ComputingRequest,
        start: Instant,
        end: Instant,
    ) -> ComputingResult<CovariateSeries> {
        let from = request
            .treatment
            .first_intake_time()
            .map(|t| t.min(start))
            .unwrap_or(start);
        CovariateSeries::build(&request.drug_model, &request.treatment.covariates, from, end)
    }

    fn concentration(
        &self,
        request: &ComputingRequest,
        concentration_trait: &ConcentrationTrait,
        aborter: &Aborter,
    ) -> ComputingResult<ResponsePayload> {
        let group = self.operative_group(&request.drug_model)?;
        let covariates =
            self.build_covariates(request, concentration_trait.start, concentration_trait.end)?;
        let resolver = ParameterResolver {
            model: &request.drug_model,
            group,
            covariates: &covariates,
        };
        let intakes = extract_intakes(
            &request.treatment.dose_history,
            concentration_trait.start,
            concentration_trait.end,
            concentration_trait.points_per_hour,
            self.half_life_hint(group),
        )?;
        self.overload
            .check_prediction_points(total_window_points(&intakes, concentration_trait.start))?;

        let (mode, etas) = self.determine_etas(
            request,
            group,
            &resolver,
            concentration_trait.options.parameter_type,
            aborter,
        )?;
        let engine =
            ConcentrationCalculator::new(group, concentration_trait.options.prediction_options());
        let prediction = engine.compute(
            &intakes,
            concentration_trait.start,
            concentration_trait.end,
            |intake| resolver.resolve_for_intake(intake, mode, Some(&etas)),
            |at| covariates.snapshot(at),
            aborter,
        )?;
        Ok(ResponsePayload::SinglePrediction(prediction))
    }

    fn percentiles(
        &self,
        request: &ComputingRequest,
        percentiles_trait: &PercentilesTrait,
        aborter: &Aborter,
    ) -> ComputingResult<PercentilesData> {
        let group = self.operative_group(&request.drug_model)?;
        let covariates =
            self.build_covariates(request, percentiles_trait.start, percentiles_trait.end)?;
        let resolver = ParameterResolver {
            model: &request.drug_model,
            group,
            covariates: &covariates,
        };
        let intakes = extract_intakes(
            &request.treatment.dose_history,
            percentiles_trait.start,
            percentiles_trait.end,
            percentiles_trait.points_per_hour,
            self.half_life_hint(group),
        )?;
        self.overload
            .check_percentile_points(total_window_points(&intakes, percentiles_trait.start))?;

        let (mode, etas) = self.determine_etas(
            request,
            group,
            &resolver,
            percentiles_trait.options.parameter_type,
            aborter,
        )?;
        let engine = PercentileEngine {
            resolver: &resolver,
            config: self.percentile_config.clone(),
        };
        engine.compute(
            &intakes,
            percentiles_trait.start,
            percentiles_trait.end,
            mode,
            &etas,
            &percentiles_trait.ranks,
            percentiles_trait.points_per_hour,
            percentile_seed(request),
            &percentiles_trait.options.prediction_options(),
            aborter,
        )
    }

    fn points_payload(
        &self,
        request: &ComputingRequest,
        instants: &[Instant],
        options: &ComputingOption,
        aborter: &Aborter,
    ) -> ComputingResult<ResponsePayload> {
        let group = self.operative_group(&request.drug_model)?;
        let first_intake = request
            .treatment
            .first_intake_time()
            .ok_or_else(|| ComputingError::BadRequest("treatment has no intake".to_string()))?;
        let horizon = instants
            .iter()
            .max()
            .copied()
            .unwrap_or(first_intake)
            + Duration::hours(1);
        let covariates = self.build_covariates(request, first_intake, horizon)?;
        let resolver = ParameterResolver {
            model: &request.drug_model,
            group,
            covariates: &covariates,
        };
        let intakes = extract_intakes(
            &request.treatment.dose_history,
            first_intake,
            horizon,
            2.0,
            self.half_life_hint(group),
        )?;
        let (mode, etas) =
            self.determine_etas(request, group, &resolver, options.parameter_type, aborter)?;
        let engine = ConcentrationCalculator::new(group, options.prediction_options());
        let values = engine.compute_at_instants(
            &intakes,
            instants,
            |intake| resolver.resolve_for_intake(intake, mode, Some(&etas)),
            aborter,
        )?;
        let unit = if options.result_unit == ResultUnitOption::ForceUgPerLiter {
            TypedUnit::ug_per_l()
        } else {
            group.concentration_unit.clone()
        };
        Ok(ResponsePayload::SinglePoints(SinglePointsData {
            instants: instants.to_vec(),
            unit,
            concentrations: vec![values],
        }))
    }

    fn single_points(
        &self,
        request: &ComputingRequest,
        single_points_trait: &SinglePointsTrait,
        aborter: &Aborter,
    ) -> ComputingResult<ResponsePayload> {
        if single_points_trait.instants.is_empty() {
            return Err(ComputingError::BadRequest(
                "single points trait has no instant".to_string(),
            ));
        }
        self.points_payload(
            request,
            &single_points_trait.instants,
            &single_points_trait.options,
            aborter,
        )
    }

    fn at_measures(
        &self,
        request: &ComputingRequest,
        at_measures_trait: &AtMeasuresTrait,
        aborter: &Aborter,
    ) -> ComputingResult<ResponsePayload> {
        let group = self.operative_group(&request.drug_model)?;
        let instants: Vec<Instant> = request
            .treatment
            .samples
            .iter()
            .filter(|s| s.analyte_id == group.analyte_id)
            .map(|s| s.date)
            .collect();
        if instants.is_empty() {
            return Err(ComputingError::NoSample);
        }
        self.points_payload(request, &instants, &at_measures_trait.options, aborter)
    }
}

/// Convenience entry point mirroring the component API for one-shot use.
pub fn compute(
    request: &ComputingRequest,
    aborter: &Aborter,
) -> ComputingResult<ComputingResponse> {
    ComputingComponent::new().compute(request, aborter)
}

/// Status of a finished computation, for callers that prefer codes over
/// errors.
pub fn status_of(result: &ComputingResult<ComputingResponse>) -> ComputingStatus {
    match result {
        Ok(_) => ComputingStatus::Ok,
        Err(error) => error.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborter_is_monotonic() {
        let aborter = Aborter::new();
        assert!(!aborter.is_aborted());
        aborter.abort();
        assert!(aborter.is_aborted());
        let clone = aborter.clone();
        assert!(clone.is_aborted());
    }

    #[test]
    fn test_fnv_is_stable() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), fnv1a64(b"a"));
        assert_ne!(fnv1a64(b"a"), fnv1a64(b"b"));
    }
}
