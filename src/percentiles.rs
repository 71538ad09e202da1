use crate::computing::Aborter;
use crate::drugmodel::ParameterDefinition;
use crate::error::{ComputingError, ComputingResult};
use crate::intake::IntakeEvent;
use crate::parameters::{Etas, ParameterResolver, PredictionParameterType};
use crate::prediction::{ConcentrationCalculator, CycleData, PredictionOptions};
use crate::time::Instant;
use crate::units::TypedUnit;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Default number of Monte-Carlo samples.
pub const DEFAULT_SAMPLE_COUNT: usize = 10_000;
/// Redraws allowed before an invalid sample is dropped.
const REDRAW_CAP: usize = 10;
/// Odd multiplier decorrelating per-sample seeds.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Percentile curves over the sampled population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentilesData {
    /// Requested ranks in (0, 100), in request order.
    pub ranks: Vec<f64>,
    pub points_per_hour: f64,
    pub unit: TypedUnit,
    /// One cycle vector per rank, all sharing the same cycle grid.
    pub rank_cycles: Vec<Vec<CycleData>>,
}

impl PercentilesData {
    pub fn first_cycle_start(&self) -> Option<Instant> {
        self.rank_cycles.first()?.first().map(|c| c.start)
    }

    pub fn last_cycle_end(&self) -> Option<Instant> {
        self.rank_cycles.first()?.last().map(|c| c.end)
    }
}

#[derive(Debug, Clone)]
pub struct PercentileConfig {
    pub sample_count: usize,
}

impl Default for PercentileConfig {
    fn default() -> Self {
        Self {
            sample_count: DEFAULT_SAMPLE_COUNT,
        }
    }
}

pub fn validate_ranks(ranks: &[f64]) -> ComputingResult<()> {
    if ranks.is_empty() {
        return Err(ComputingError::BadRequest(
            "percentiles need at least one rank".to_string(),
        ));
    }
    for rank in ranks {
        if !(*rank > 0.0 && *rank < 100.0) {
            return Err(ComputingError::BadRequest(format!(
                "percentile rank {rank} is outside (0, 100)"
            )));
        }
    }
    Ok(())
}

/// Monte-Carlo percentile engine: samples the between-subject variability,
/// predicts each sampled subject and reduces to the requested ranks.
pub struct PercentileEngine<'a> {
    pub resolver: &'a ParameterResolver<'a>,
    pub config: PercentileConfig,
}

impl PercentileEngine<'_> {
    /// Draws one eta vector, redrawing up to the cap while the resolved
    /// parameters are invalid. Returns None when the draw never validates.
    fn draw_etas(
        &self,
        definitions: &[ParameterDefinition],
        center: &Etas,
        probe_intake: &IntakeEvent,
        mode: PredictionParameterType,
        rng: &mut StdRng,
    ) -> Option<Etas> {
        for _ in 0..REDRAW_CAP {
            let mut etas = Etas::new();
            for definition in definitions {
                let base = center.get(&definition.id).copied().unwrap_or(0.0);
                let normal = Normal::new(0.0, definition.bsv.std_dev).ok()?;
                etas.insert(definition.id.clone(), base + normal.sample(rng));
            }
            if self
                .resolver
                .resolve_for_intake(probe_intake, mode, Some(&etas))
                .is_ok()
            {
                return Some(etas);
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        intakes: &[IntakeEvent],
        window_start: Instant,
        window_end: Instant,
        mode: PredictionParameterType,
        center_etas: &Etas,
        ranks: &[f64],
        points_per_hour: f64,
        seed: u64,
        options: &PredictionOptions,
        aborter: &Aborter,
    ) -> ComputingResult<PercentilesData> {
        validate_ranks(ranks)?;
        if intakes.is_empty() {
            return Err(ComputingError::BadRequest(
                "no intake in the prediction window".to_string(),
            ));
        }
        let definitions = self.resolver.variable_definitions(intakes);
        let probe_intake = &intakes[0];

        let sample_mode = match mode {
            // The individual fit centers the cloud, the draws explore the
            // remaining variability around it.
            PredictionParameterType::Aposteriori => PredictionParameterType::Apriori,
            other => other,
        };

        let predictions: Vec<Option<Vec<CycleData>>> = (0..self.config.sample_count)
            .into_par_iter()
            .map(|index| {
                if aborter.is_aborted() {
                    return None;
                }
                let mut rng =
                    StdRng::seed_from_u64(seed.wrapping_add(index as u64).wrapping_mul(SEED_STRIDE));
                let etas = if definitions.is_empty() {
                    Etas::new()
                } else {
                    self.draw_etas(&definitions, center_etas, probe_intake, sample_mode, &mut rng)?
                };
                let engine = ConcentrationCalculator::new(
                    self.resolver.group,
                    PredictionOptions {
                        retrieve_statistics: false,
                        retrieve_parameters: false,
                        retrieve_covariates: false,
                        ..options.clone()
                    },
                );
                engine
                    .compute(
                        intakes,
                        window_start,
                        window_end,
                        |intake| {
                            self.resolver
                                .resolve_for_intake(intake, sample_mode, Some(&etas))
                        },
                        |_| Vec::new(),
                        aborter,
                    )
                    .ok()
                    .map(|p| p.cycles)
            })
            .collect();

        if aborter.is_aborted() {
            return Err(ComputingError::Aborted);
        }

        let valid: Vec<&Vec<CycleData>> = predictions.iter().flatten().collect();
        if valid.is_empty() {
            return Err(ComputingError::NumericalError(
                "no monte-carlo sample produced a valid prediction".to_string(),
            ));
        }
        let dropped = predictions.len() - valid.len();
        if dropped > 0 {
            warn!("dropped {dropped} invalid monte-carlo samples");
        }
        debug!(
            "percentile reduction over {} samples, {} ranks",
            valid.len(),
            ranks.len()
        );

        let template = valid[0];
        let unit = if options.force_ug_per_liter {
            TypedUnit::ug_per_l()
        } else {
            self.resolver.group.concentration_unit.clone()
        };

        let mut rank_cycles: Vec<Vec<CycleData>> = vec![Vec::new(); ranks.len()];
        let mut cumulative: Vec<f64> = vec![0.0; ranks.len()];
        for (cycle_index, template_cycle) in template.iter().enumerate() {
            let points = template_cycle.times.len();
            let mut per_rank: Vec<Vec<f64>> = vec![Vec::with_capacity(points); ranks.len()];
            let mut column: Vec<f64> = Vec::with_capacity(valid.len());
            for point_index in 0..points {
                column.clear();
                for sample in &valid {
                    column.push(sample[cycle_index].concentrations[0][point_index]);
                }
                column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                for (rank_index, rank) in ranks.iter().enumerate() {
                    per_rank[rank_index].push(order_statistic(&column, *rank));
                }
            }
            for (rank_index, values) in per_rank.into_iter().enumerate() {
                let statistics = if options.retrieve_statistics {
                    let s = crate::prediction::cycle_statistics(
                        &template_cycle.times,
                        &values,
                        cumulative[rank_index],
                    );
                    cumulative[rank_index] = s.cumulative_auc;
                    Some(s)
                } else {
                    None
                };
                rank_cycles[rank_index].push(CycleData {
                    start: template_cycle.start,
                    end: template_cycle.end,
                    times: template_cycle.times.clone(),
                    concentrations: vec![values],
                    parameters: Vec::new(),
                    covariates: Vec::new(),
                    statistics,
                });
            }
        }

        Ok(PercentilesData {
            ranks: ranks.to_vec(),
            points_per_hour,
            unit,
            rank_cycles,
        })
    }
}

/// Linear interpolation between order statistics of a sorted column.
fn order_statistic(sorted: &[f64], rank: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let position = rank / 100.0 * (n - 1) as f64;
    let low = position.floor() as usize;
    let high = (low + 1).min(n - 1);
    let fraction = position - low as f64;
    sorted[low] * (1.0 - fraction) + sorted[high] * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_order_statistic_interpolation() {
        let sorted = vec![0.0, 10.0, 20.0, 30.0, 40.0];
        assert_relative_eq!(order_statistic(&sorted, 50.0), 20.0);
        assert_relative_eq!(order_statistic(&sorted, 25.0), 10.0);
        assert_relative_eq!(order_statistic(&sorted, 12.5), 5.0);
        assert!(order_statistic(&sorted, 99.0) < 40.0);
    }

    #[test]
    fn test_rank_validation() {
        assert!(validate_ranks(&[5.0, 50.0, 95.0]).is_ok());
        assert!(validate_ranks(&[]).is_err());
        assert!(validate_ranks(&[0.0]).is_err());
        assert!(validate_ranks(&[100.0]).is_err());
    }
}
