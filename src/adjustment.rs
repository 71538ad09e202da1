use crate::computing::{
    Aborter, AdjustmentTrait, BestCandidatesOption, ComputingComponent, ComputingRequest,
    FormulationAndRouteSelectionOption, LoadingOption, RestPeriodOption, SteadyStateTargetOption,
    TargetExtractionOption,
};
use crate::covariate::CovariateSeries;
use crate::dosage::{DoseHistory, Dosage, FormulationAndRoute, LastingDose, TimeRange};
use crate::drugmodel::{AnalyteGroup, FullFormulationAndRoute};
use crate::error::{ComputingError, ComputingResult};
use crate::intake::extract_intakes;
use crate::parameters::{Etas, ParameterResolver, PredictionParameterType};
use crate::prediction::{
    ConcentrationCalculator, ConcentrationPrediction, CycleData, PredictionOptions,
};
use crate::targets::{TargetDefinition, TargetEvaluation, TargetType};
use crate::time::{duration_to_hours, Duration, Instant};
use crate::units::{convert, convert_concentration, Dimension, TypedUnit};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

/// One evaluated candidate regimen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosageCandidate {
    pub dose: f64,
    pub dose_unit: TypedUnit,
    #[serde(with = "crate::time::duration_hours")]
    pub interval: Duration,
    #[serde(with = "crate::time::opt_duration_hours", default)]
    pub infusion_duration: Option<Duration>,
    pub formulation_and_route: FormulationAndRoute,
    /// The full trial history: treatment truncated at the adjustment time
    /// plus the candidate regimen.
    pub history: DoseHistory,
    pub target_evaluations: Vec<TargetEvaluation>,
    /// Geometric mean of the target scores.
    pub score: f64,
    /// Predicted curve over the adjustment window, when the trait asks
    /// for points.
    pub prediction: Option<ConcentrationPrediction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentData {
    /// Score of the unmodified regimen against the same targets.
    pub current_score: f64,
    /// Candidates ordered by decreasing score.
    pub candidates: Vec<DosageCandidate>,
}

struct CandidateShape {
    dose: f64,
    interval: Duration,
    infusion: Option<Duration>,
    full: usize,
}

/// Entry point called by the computing dispatcher.
pub fn compute_adjustment(
    component: &ComputingComponent,
    request: &ComputingRequest,
    trait_: &AdjustmentTrait,
    aborter: &Aborter,
) -> ComputingResult<AdjustmentData> {
    let group = component.operative_group(&request.drug_model)?;
    let targets = extract_targets(request, group, trait_.target_extraction)?;
    if targets.is_empty() {
        return Err(ComputingError::BadRequest(
            "adjustment requires at least one target".to_string(),
        ));
    }

    let horizon = adjustment_horizon(component, group, trait_);
    let covariates_end = trait_.end.max(horizon);
    let covariates = CovariateSeries::build(
        &request.drug_model,
        &request.treatment.covariates,
        request
            .treatment
            .first_intake_time()
            .map(|t| t.min(trait_.start))
            .unwrap_or(trait_.start),
        covariates_end,
    )?;
    let resolver = ParameterResolver {
        model: &request.drug_model,
        group,
        covariates: &covariates,
    };
    let (mode, etas) = component.determine_etas(
        request,
        group,
        &resolver,
        trait_.options.parameter_type,
        aborter,
    )?;

    // Candidate formulations and the dose/interval/infusion grid.
    let fulls = candidate_formulations(request, trait_.formulation_and_route_selection)?;
    let shapes = enumerate_shapes(&request.drug_model.formulation_and_routes, &fulls)?;
    component.overload.check_dosage_possibilities(shapes.len())?;
    debug!("adjustment search over {} candidates", shapes.len());

    let rest_shift = rest_period_shift(
        component, request, group, &resolver, trait_, &targets, mode, &etas, aborter,
    )?;

    let mut candidates: Vec<DosageCandidate> = Vec::new();
    for shape in &shapes {
        if aborter.is_aborted() {
            return Err(ComputingError::Aborted);
        }
        let full = &request.drug_model.formulation_and_routes[shape.full];
        let start = trait_.adjustment_time + rest_shift.unwrap_or_else(Duration::zero);
        let regimen_end = match trait_.steady_state_target {
            SteadyStateTargetOption::AtSteadyState => horizon.max(trait_.end),
            SteadyStateTargetOption::WithinTreatmentTimeRange => trait_.end,
        };
        let history = trial_history(
            &request.treatment.dose_history,
            trait_,
            group,
            full,
            shape,
            start,
            regimen_end,
        )?;
        let Some(cycles) = evaluate_candidate(
            component,
            group,
            &resolver,
            &history,
            trait_,
            start,
            mode,
            &etas,
            aborter,
        )?
        else {
            continue;
        };
        let evaluations =
            evaluate_targets(&targets, &cycles, group, trait_.options.prediction_options())?;
        let score = global_score(&evaluations);
        candidates.push(DosageCandidate {
            dose: shape.dose,
            dose_unit: full.dose_unit.clone(),
            interval: shape.interval,
            infusion_duration: shape.infusion,
            formulation_and_route: full.specification.clone(),
            history,
            target_evaluations: evaluations,
            score,
            prediction: None,
        });
    }

    sort_candidates(&mut candidates);
    let mut selected = select_candidates(candidates, trait_.candidates);

    // Attach the predicted curves of the retained candidates.
    if trait_.points_per_hour > 0.0 {
        for candidate in &mut selected {
            candidate.prediction = Some(candidate_curve(
                group, &resolver, candidate, trait_, mode, &etas, aborter,
            )?);
        }
    }

    let current_score = current_regimen_score(
        component, request, group, &resolver, trait_, &targets, mode, &etas, aborter,
    )?;

    Ok(AdjustmentData {
        current_score,
        candidates: selected,
    })
}

fn extract_targets(
    request: &ComputingRequest,
    group: &AnalyteGroup,
    option: TargetExtractionOption,
) -> ComputingResult<Vec<TargetDefinition>> {
    let model_targets: Vec<TargetDefinition> = request
        .drug_model
        .active_moieties
        .iter()
        .filter(|m| m.analyte_ids.contains(&group.analyte_id))
        .flat_map(|m| m.targets.iter().cloned())
        .collect();
    let individual = &request.treatment.targets;
    Ok(match option {
        TargetExtractionOption::PopulationValues | TargetExtractionOption::AprioriValues => {
            model_targets
        }
        TargetExtractionOption::IndividualTargets => individual.clone(),
        TargetExtractionOption::DefinitionIfNoIndividualTarget => {
            let mut merged = individual.clone();
            for target in model_targets {
                if !merged.iter().any(|t| t.target_type == target.target_type) {
                    merged.push(target);
                }
            }
            merged
        }
    })
}

fn candidate_formulations(
    request: &ComputingRequest,
    option: FormulationAndRouteSelectionOption,
) -> ComputingResult<Vec<usize>> {
    let model = &request.drug_model;
    let index_of = |full: &FullFormulationAndRoute| {
        model
            .formulation_and_routes
            .iter()
            .position(|f| f.specification == full.specification)
            .unwrap_or(0)
    };
    Ok(match option {
        FormulationAndRouteSelectionOption::AllFormulationAndRoutes => {
            (0..model.formulation_and_routes.len()).collect()
        }
        FormulationAndRouteSelectionOption::DefaultFormulationAndRoute => {
            vec![index_of(model.default_formulation_and_route()?)]
        }
        FormulationAndRouteSelectionOption::LastFormulationAndRoute => {
            match request.treatment.dose_history.last_formulation_and_route() {
                Some(spec) => vec![index_of(model.formulation_and_route(spec)?)],
                None => vec![index_of(model.default_formulation_and_route()?)],
            }
        }
    })
}

fn enumerate_shapes(
    formulations: &[FullFormulationAndRoute],
    fulls: &[usize],
) -> ComputingResult<Vec<CandidateShape>> {
    let mut shapes = Vec::new();
    for &full_index in fulls {
        let full = &formulations[full_index];
        let needs_infusion = matches!(
            full.specification.absorption_model,
            crate::dosage::AbsorptionModel::Infusion
        );
        let infusions: Vec<Option<Duration>> = if needs_infusion {
            if full.available_infusions.is_empty() {
                return Err(ComputingError::BadRequest(format!(
                    "formulation {} has no available infusion duration",
                    full.specification.formulation
                )));
            }
            full.available_infusions.iter().map(|d| Some(*d)).collect()
        } else {
            vec![None]
        };
        for &dose in &full.available_doses {
            for &interval in &full.available_intervals {
                for &infusion in &infusions {
                    shapes.push(CandidateShape {
                        dose,
                        interval,
                        infusion,
                        full: full_index,
                    });
                }
            }
        }
    }
    Ok(shapes)
}

/// Truncates the treatment history at the adjustment time and appends the
/// candidate regimen, optionally led by a loading dose.
fn trial_history(
    history: &DoseHistory,
    trait_: &AdjustmentTrait,
    group: &AnalyteGroup,
    full: &FullFormulationAndRoute,
    shape: &CandidateShape,
    start: Instant,
    regimen_end: Instant,
) -> ComputingResult<DoseHistory> {
    let mut ranges: Vec<TimeRange> = Vec::new();
    for range in &history.ranges {
        if range.start >= trait_.adjustment_time {
            break;
        }
        let mut truncated = range.clone();
        match truncated.end {
            Some(end) if end <= trait_.adjustment_time => {}
            _ => truncated.end = Some(trait_.adjustment_time),
        }
        ranges.push(truncated);
    }

    let maintenance = LastingDose {
        dose: shape.dose,
        unit: full.dose_unit.clone(),
        formulation_and_route: full.specification.clone(),
        infusion_duration: shape.infusion,
        interval: shape.interval,
    };
    let mut dosage = Dosage::Loop {
        inner: Box::new(Dosage::Lasting(maintenance.clone())),
    };

    if trait_.loading == LoadingOption::LoadingDoseAllowed {
        if let Some(loading) = loading_dose(group, full, shape) {
            if (loading - shape.dose).abs() > f64::EPSILON {
                let mut first = maintenance;
                first.dose = loading;
                dosage = Dosage::Sequence {
                    items: vec![Dosage::Lasting(first), dosage],
                };
            }
        }
    }

    ranges.push(TimeRange::new(start, Some(regimen_end.max(start)), dosage));
    DoseHistory::new(ranges)
}

/// Available dose closest to the steady-state accumulation of the
/// maintenance dose.
fn loading_dose(
    group: &AnalyteGroup,
    full: &FullFormulationAndRoute,
    shape: &CandidateShape,
) -> Option<f64> {
    let ke = group
        .structural_model
        .elimination_rate(&group.standard_values())?;
    let tau = duration_to_hours(shape.interval);
    let accumulation = 1.0 / (1.0 - (-ke * tau).exp());
    if !accumulation.is_finite() {
        return None;
    }
    let wanted = shape.dose * accumulation;
    full.available_doses
        .iter()
        .copied()
        .min_by(|a, b| {
            (a - wanted)
                .abs()
                .partial_cmp(&(b - wanted).abs())
                .unwrap()
        })
}

/// One empty interval before the new regimen when the current
/// concentration already exceeds a residual target ceiling.
#[allow(clippy::too_many_arguments)]
fn rest_period_shift(
    component: &ComputingComponent,
    request: &ComputingRequest,
    group: &AnalyteGroup,
    resolver: &ParameterResolver<'_>,
    trait_: &AdjustmentTrait,
    targets: &[TargetDefinition],
    mode: PredictionParameterType,
    etas: &Etas,
    aborter: &Aborter,
) -> ComputingResult<Option<Duration>> {
    if trait_.rest_period != RestPeriodOption::RestPeriodAllowed {
        return Ok(None);
    }
    let Some(residual_target) = targets
        .iter()
        .find(|t| t.target_type == TargetType::Residual)
    else {
        return Ok(None);
    };
    let Some(first_intake) = request.treatment.first_intake_time() else {
        return Ok(None);
    };
    if first_intake >= trait_.adjustment_time {
        return Ok(None);
    }
    let intakes = extract_intakes(
        &request.treatment.dose_history,
        first_intake,
        trait_.adjustment_time + Duration::hours(1),
        2.0,
        component.half_life_hint(group),
    )?;
    if intakes.is_empty() {
        return Ok(None);
    }
    let engine = ConcentrationCalculator::new(group, trait_.options.prediction_options());
    let values = engine.compute_at_instants(
        &intakes,
        &[trait_.adjustment_time],
        |intake| resolver.resolve_for_intake(intake, mode, Some(etas)),
        aborter,
    )?;
    let current = convert_concentration(
        values[0],
        &engine_unit(group, &trait_.options.prediction_options()),
        &residual_target.unit,
        group.molar_mass,
    )?;
    if current > residual_target.max {
        let interval = request
            .drug_model
            .formulation_and_routes
            .first()
            .and_then(|f| f.available_intervals.first().copied())
            .unwrap_or_else(|| Duration::hours(12));
        return Ok(Some(interval));
    }
    Ok(None)
}

fn engine_unit(group: &AnalyteGroup, options: &PredictionOptions) -> TypedUnit {
    if options.force_ug_per_liter {
        TypedUnit::ug_per_l()
    } else {
        group.concentration_unit.clone()
    }
}

/// Horizon over which a candidate converges to steady state.
fn adjustment_horizon(
    component: &ComputingComponent,
    group: &AnalyteGroup,
    trait_: &AdjustmentTrait,
) -> Instant {
    let half_life = component
        .half_life_hint(group)
        .unwrap_or_else(|| Duration::hours(12));
    trait_.adjustment_time + half_life * 20 + Duration::hours(24)
}

/// Runs the engine on a trial history and returns the cycles to score, or
/// None when the candidate produces no evaluable cycle.
#[allow(clippy::too_many_arguments)]
fn evaluate_candidate(
    component: &ComputingComponent,
    group: &AnalyteGroup,
    resolver: &ParameterResolver<'_>,
    history: &DoseHistory,
    trait_: &AdjustmentTrait,
    start: Instant,
    mode: PredictionParameterType,
    etas: &Etas,
    aborter: &Aborter,
) -> ComputingResult<Option<Vec<CycleData>>> {
    let (window_start, window_end) = match trait_.steady_state_target {
        SteadyStateTargetOption::WithinTreatmentTimeRange => (start, trait_.end),
        SteadyStateTargetOption::AtSteadyState => {
            let horizon = adjustment_horizon(component, group, trait_);
            // Only the terminal cycles matter; the warm-up runs on the
            // residual-only grid.
            (horizon - Duration::hours(48), horizon)
        }
    };
    if window_end <= window_start {
        return Ok(None);
    }
    let points_per_hour = if trait_.points_per_hour > 0.0 {
        trait_.points_per_hour
    } else {
        10.0
    };
    let intakes = extract_intakes(
        history,
        window_start,
        window_end,
        points_per_hour,
        component.half_life_hint(group),
    )?;
    if intakes.is_empty() {
        return Ok(None);
    }
    let mut options = trait_.options.prediction_options();
    options.retrieve_statistics = true;
    let engine = ConcentrationCalculator::new(group, options);
    let prediction = engine.compute(
        &intakes,
        window_start,
        window_end,
        |intake| resolver.resolve_for_intake(intake, mode, Some(etas)),
        |_| Vec::new(),
        aborter,
    )?;
    if prediction.cycles.is_empty() {
        return Ok(None);
    }
    Ok(Some(prediction.cycles))
}

/// Value of one target over the evaluated cycles, in the target's unit.
fn target_value(
    target: &TargetDefinition,
    cycles: &[CycleData],
    group: &AnalyteGroup,
    prediction_unit: &TypedUnit,
) -> ComputingResult<Option<f64>> {
    let last = cycles.last().expect("cycles checked non-empty");
    let statistics = last
        .statistics
        .as_ref()
        .ok_or_else(|| ComputingError::InternalError("cycle statistics missing".to_string()))?;
    let interval_h = duration_to_hours(last.end - last.start);

    let to_target_concentration = |value: f64| {
        convert_concentration(value, prediction_unit, &target.unit, group.molar_mass)
    };
    let auc_unit = TypedUnit {
        dimension: Dimension::ConcentrationTime,
        factor: prediction_unit.factor,
        symbol: format!("{}*h", prediction_unit.symbol),
    };

    let value = match target.target_type {
        TargetType::Residual => to_target_concentration(statistics.trough)?,
        TargetType::Peak => to_target_concentration(statistics.peak)?,
        TargetType::Mean => to_target_concentration(statistics.mean)?,
        TargetType::Auc => convert(statistics.auc, &auc_unit, &target.unit)?,
        TargetType::Auc24 => {
            let auc24 = statistics.auc / interval_h * 24.0;
            convert(auc24, &auc_unit, &target.unit)?
        }
        TargetType::CumulativeAuc => convert(statistics.cumulative_auc, &auc_unit, &target.unit)?,
        TargetType::AucDividedByMic => {
            let mic = match target.mic {
                Some(m) if m > 0.0 => m,
                _ => return Ok(None),
            };
            statistics.auc / mic
        }
        TargetType::Auc24DividedByMic => {
            let mic = match target.mic {
                Some(m) if m > 0.0 => m,
                _ => return Ok(None),
            };
            statistics.auc / interval_h * 24.0 / mic
        }
        TargetType::PeakDividedByMic => {
            let mic = match target.mic {
                Some(m) if m > 0.0 => m,
                _ => return Ok(None),
            };
            statistics.peak / mic
        }
        TargetType::TimeOverMic => {
            let mic = match target.mic {
                Some(m) if m > 0.0 => m,
                _ => return Ok(None),
            };
            let mut hours = 0.0;
            let row = &last.concentrations[0];
            for (t, c) in last.times.windows(2).zip(row.windows(2)) {
                let both_over = c[0] >= mic && c[1] >= mic;
                let both_under = c[0] < mic && c[1] < mic;
                if both_over {
                    hours += t[1] - t[0];
                } else if !both_under {
                    // Linear crossing within the segment.
                    let fraction = (mic - c[0]).abs() / (c[1] - c[0]).abs().max(1e-12);
                    let covered = if c[0] >= mic { fraction } else { 1.0 - fraction };
                    hours += (t[1] - t[0]) * covered;
                }
            }
            convert(hours, &TypedUnit::h(), &target.unit)?
        }
        TargetType::ConcentrationAtTime => {
            let offset = target
                .t_best
                .map(duration_to_hours)
                .unwrap_or(interval_h / 2.0);
            let row = &last.concentrations[0];
            let mut value = *row.last().unwrap();
            for (t, c) in last.times.windows(2).zip(row.windows(2)) {
                if offset >= t[0] && offset <= t[1] {
                    let span = (t[1] - t[0]).max(1e-12);
                    value = c[0] + (c[1] - c[0]) * (offset - t[0]) / span;
                    break;
                }
            }
            to_target_concentration(value)?
        }
    };
    Ok(Some(value))
}

fn evaluate_targets(
    targets: &[TargetDefinition],
    cycles: &[CycleData],
    group: &AnalyteGroup,
    options: PredictionOptions,
) -> ComputingResult<Vec<TargetEvaluation>> {
    let unit = engine_unit(group, &options);
    let mut evaluations = Vec::new();
    for target in targets {
        if let Some(value) = target_value(target, cycles, group, &unit)? {
            evaluations.push(TargetEvaluation {
                target_type: target.target_type,
                unit: target.unit.clone(),
                value,
                score: target.score(value),
            });
        }
    }
    Ok(evaluations)
}

fn global_score(evaluations: &[TargetEvaluation]) -> f64 {
    if evaluations.is_empty() {
        return 0.0;
    }
    let product: f64 = evaluations.iter().map(|e| e.score.max(0.0)).product();
    product.powf(1.0 / evaluations.len() as f64)
}

/// Order: score descending, ties by (dose, interval, infusion) ascending.
fn sort_candidates(candidates: &mut [DosageCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.dose.partial_cmp(&b.dose).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.interval.cmp(&b.interval))
            .then_with(|| {
                a.infusion_duration
                    .unwrap_or_else(Duration::zero)
                    .cmp(&b.infusion_duration.unwrap_or_else(Duration::zero))
            })
    });
}

fn select_candidates(
    candidates: Vec<DosageCandidate>,
    option: BestCandidatesOption,
) -> Vec<DosageCandidate> {
    match option {
        BestCandidatesOption::BestDosage => candidates.into_iter().take(1).collect(),
        BestCandidatesOption::AllDosages => candidates
            .into_iter()
            .filter(|c| c.score > 0.0)
            .collect(),
        BestCandidatesOption::BestDosagePerInterval => {
            let mut best: Vec<DosageCandidate> = candidates
                .into_iter()
                .into_group_map_by(|c| c.interval.num_milliseconds())
                .into_values()
                .filter_map(|group| {
                    // Groups preserve the global order: the first one is
                    // the best of its interval.
                    group.into_iter().next()
                })
                .collect();
            sort_candidates(&mut best);
            best
        }
    }
}

fn candidate_curve(
    group: &AnalyteGroup,
    resolver: &ParameterResolver<'_>,
    candidate: &DosageCandidate,
    trait_: &AdjustmentTrait,
    mode: PredictionParameterType,
    etas: &Etas,
    aborter: &Aborter,
) -> ComputingResult<ConcentrationPrediction> {
    let intakes = extract_intakes(
        &candidate.history,
        trait_.start,
        trait_.end,
        trait_.points_per_hour,
        None,
    )?;
    let engine = ConcentrationCalculator::new(group, trait_.options.prediction_options());
    engine.compute(
        &intakes,
        trait_.start,
        trait_.end,
        |intake| resolver.resolve_for_intake(intake, mode, Some(etas)),
        |_| Vec::new(),
        aborter,
    )
}

/// Score of the unmodified treatment against the same targets, zero when
/// there is nothing to evaluate.
#[allow(clippy::too_many_arguments)]
fn current_regimen_score(
    component: &ComputingComponent,
    request: &ComputingRequest,
    group: &AnalyteGroup,
    resolver: &ParameterResolver<'_>,
    trait_: &AdjustmentTrait,
    targets: &[TargetDefinition],
    mode: PredictionParameterType,
    etas: &Etas,
    aborter: &Aborter,
) -> ComputingResult<f64> {
    let Some(first_intake) = request.treatment.first_intake_time() else {
        return Ok(0.0);
    };
    if first_intake >= trait_.adjustment_time {
        return Ok(0.0);
    }
    let points_per_hour = if trait_.points_per_hour > 0.0 {
        trait_.points_per_hour
    } else {
        10.0
    };
    let intakes = extract_intakes(
        &request.treatment.dose_history,
        first_intake,
        trait_.adjustment_time,
        points_per_hour,
        component.half_life_hint(group),
    )?;
    if intakes.is_empty() {
        return Ok(0.0);
    }
    let mut options = trait_.options.prediction_options();
    options.retrieve_statistics = true;
    let engine = ConcentrationCalculator::new(group, options.clone());
    let prediction = engine.compute(
        &intakes,
        first_intake,
        trait_.adjustment_time,
        |intake| resolver.resolve_for_intake(intake, mode, Some(etas)),
        |_| Vec::new(),
        aborter,
    )?;
    if prediction.cycles.is_empty() {
        return Ok(0.0);
    }
    let evaluations = evaluate_targets(targets, &prediction.cycles, group, options)?;
    Ok(global_score(&evaluations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::TargetDefinition;
    use crate::units::TypedUnit;
    use approx::assert_relative_eq;

    fn evaluation(score: f64) -> TargetEvaluation {
        TargetEvaluation {
            target_type: TargetType::Residual,
            unit: TypedUnit::mg_per_l(),
            value: 0.0,
            score,
        }
    }

    #[test]
    fn test_global_score_geometric_mean() {
        assert_relative_eq!(
            global_score(&[evaluation(1.0), evaluation(0.25)]),
            0.5,
            epsilon = 1e-12
        );
        assert_relative_eq!(global_score(&[evaluation(0.0), evaluation(1.0)]), 0.0);
        assert_relative_eq!(global_score(&[]), 0.0);
    }

    #[test]
    fn test_sort_ties_break_lexicographically() {
        let candidate = |dose: f64, interval_h: i64| DosageCandidate {
            dose,
            dose_unit: TypedUnit::mg(),
            interval: Duration::hours(interval_h),
            infusion_duration: None,
            formulation_and_route: crate::dosage::FormulationAndRoute::new(
                "solution",
                crate::dosage::AdministrationRoute::Intravenous,
                crate::dosage::AbsorptionModel::Bolus,
                "iv",
            ),
            history: DoseHistory::default(),
            target_evaluations: vec![],
            score: 0.5,
            prediction: None,
        };
        let mut candidates = vec![candidate(200.0, 12), candidate(100.0, 24), candidate(100.0, 12)];
        sort_candidates(&mut candidates);
        assert_relative_eq!(candidates[0].dose, 100.0);
        assert_eq!(candidates[0].interval, Duration::hours(12));
        assert_relative_eq!(candidates[1].dose, 100.0);
        assert_eq!(candidates[1].interval, Duration::hours(24));
        assert_relative_eq!(candidates[2].dose, 200.0);
    }

    #[test]
    fn test_time_over_mic_extraction() {
        let start = crate::time::instant(2018, 9, 1, 8, 0);
        let cycle = CycleData {
            start,
            end: start + Duration::hours(4),
            times: vec![0.0, 1.0, 2.0, 3.0, 4.0],
            concentrations: vec![vec![20.0, 15.0, 10.0, 5.0, 0.0]],
            parameters: vec![],
            covariates: vec![],
            statistics: Some(crate::prediction::cycle_statistics(
                &[0.0, 1.0, 2.0, 3.0, 4.0],
                &[20.0, 15.0, 10.0, 5.0, 0.0],
                0.0,
            )),
        };
        let group = AnalyteGroup {
            analyte_id: "testdrug".to_string(),
            structural_model: crate::drugmodel::StructuralModel::Linear1CompMacro,
            parameters: vec![],
            error_model: crate::residual::ErrorModel::proportional(0.1),
            concentration_unit: TypedUnit::mg_per_l(),
            molar_mass: None,
        };
        let target = TargetDefinition::new(
            TargetType::TimeOverMic,
            TypedUnit::h(),
            1.0,
            2.0,
            4.0,
        )
        .with_mic(10.0);
        let value = target_value(&target, &[cycle], &group, &TypedUnit::mg_per_l())
            .unwrap()
            .unwrap();
        // Above 10 mg/l from t=0 to t=2 exactly.
        assert_relative_eq!(value, 2.0, epsilon = 1e-9);
    }
}
