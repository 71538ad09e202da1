use crate::drugmodel::{CovariateDefinition, DrugModel, InterpolationType};
use crate::error::{ComputingError, ComputingResult};
use crate::time::{Duration, Instant};
use crate::treatment::PatientCovariate;
use crate::units::convert;
use log::debug;
use std::collections::HashMap;

/// Piecewise time functions for every covariate of a drug model, built
/// once per request and queried at cycle starts.
#[derive(Debug, Clone, Default)]
pub struct CovariateSeries {
    series: HashMap<String, CovariateTrack>,
    /// Definition order, kept for deterministic snapshots.
    order: Vec<String>,
}

#[derive(Debug, Clone)]
struct CovariateTrack {
    standard_value: f64,
    interpolation: InterpolationType,
    /// Patient measurements or computed refresh grid, sorted by time.
    points: Vec<(Instant, f64)>,
}

impl CovariateTrack {
    fn value_at(&self, t: Instant) -> f64 {
        let points = &self.points;
        if points.is_empty() {
            return self.standard_value;
        }
        // Before the first patient value the drug model standard applies.
        if t < points[0].0 {
            return self.standard_value;
        }
        if t >= points[points.len() - 1].0 {
            return points[points.len() - 1].1;
        }
        let next = points.partition_point(|(pt, _)| *pt <= t);
        let (t0, v0) = points[next - 1];
        let (t1, v1) = points[next];
        match self.interpolation {
            InterpolationType::Direct => v0,
            InterpolationType::Linear => {
                let span = (t1 - t0).num_milliseconds() as f64;
                if span <= 0.0 {
                    return v1;
                }
                let frac = (t - t0).num_milliseconds() as f64 / span;
                v0 + (v1 - v0) * frac
            }
        }
    }
}

impl CovariateSeries {
    /// Builds the series for all model covariates over `[start, end]`.
    ///
    /// Measured covariates are converted to the definition's unit; computed
    /// covariates are evaluated on their refresh grid against the measured
    /// ones.
    pub fn build(
        model: &DrugModel,
        patient: &[PatientCovariate],
        start: Instant,
        end: Instant,
    ) -> ComputingResult<CovariateSeries> {
        let mut series = CovariateSeries::default();

        // Measured covariates first: computed formulas read them.
        for definition in model.covariates.iter().filter(|d| d.computation.is_none()) {
            let mut points = Vec::new();
            for value in patient.iter().filter(|p| p.id == definition.id) {
                let converted = convert(value.value, &value.unit, &definition.unit)?;
                points.push((value.date, converted));
            }
            points.sort_by_key(|(t, _)| *t);
            series.insert(
                &definition.id,
                CovariateTrack {
                    standard_value: definition.standard_value,
                    interpolation: definition.interpolation,
                    points,
                },
            );
        }

        for definition in model.covariates.iter().filter(|d| d.computation.is_some()) {
            let track = series.compute_track(definition, start, end)?;
            series.insert(&definition.id, track);
        }

        debug!("covariate series built for {} covariates", series.order.len());
        Ok(series)
    }

    fn insert(&mut self, id: &str, track: CovariateTrack) {
        self.order.push(id.to_string());
        self.series.insert(id.to_string(), track);
    }

    /// Evaluates a computed covariate on its refresh grid. Without a
    /// refresh period the formula is evaluated once at `start`.
    fn compute_track(
        &self,
        definition: &CovariateDefinition,
        start: Instant,
        end: Instant,
    ) -> ComputingResult<CovariateTrack> {
        let operation = definition
            .computation
            .as_ref()
            .expect("caller filtered on computed covariates");
        let mut points = Vec::new();
        let mut t = start;
        loop {
            let inputs = self.values_at(t);
            let value = operation.evaluate(definition.standard_value, &inputs)?;
            points.push((t, value));
            match definition.refresh_period {
                Some(period) if period > Duration::zero() => {
                    t = t + period;
                    if t > end {
                        break;
                    }
                }
                _ => break,
            }
        }
        Ok(CovariateTrack {
            standard_value: definition.standard_value,
            // Refresh caching: the computed value holds until the next
            // refresh instant.
            interpolation: InterpolationType::Direct,
            points,
        })
    }

    pub fn value_at(&self, id: &str, t: Instant) -> ComputingResult<f64> {
        self.series
            .get(id)
            .map(|track| track.value_at(t))
            .ok_or_else(|| ComputingError::MissingCovariate(id.to_string()))
    }

    /// All covariate values in effect at `t`, the input of formula
    /// evaluation.
    pub fn values_at(&self, t: Instant) -> HashMap<String, f64> {
        self.series
            .iter()
            .map(|(id, track)| (id.clone(), track.value_at(t)))
            .collect()
    }

    /// Ordered (id, value) pairs for cycle snapshots.
    pub fn snapshot(&self, t: Instant) -> Vec<(String, f64)> {
        self.order
            .iter()
            .map(|id| (id.clone(), self.series[id].value_at(t)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
