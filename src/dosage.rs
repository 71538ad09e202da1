use crate::error::{ComputingError, ComputingResult};
use crate::time::{duration_hours, opt_duration_hours, Duration, Instant, TimeOfDay};
use crate::units::TypedUnit;
use serde::{Deserialize, Serialize};

/// Structural absorption model of a formulation, selecting the intake
/// interval calculator together with the analyte group's disposition model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsorptionModel {
    Bolus,
    Infusion,
    Extravascular,
    ExtravascularLag,
}

impl AbsorptionModel {
    pub fn key(&self) -> &'static str {
        match self {
            AbsorptionModel::Bolus => "bolus",
            AbsorptionModel::Infusion => "infusion",
            AbsorptionModel::Extravascular => "extra",
            AbsorptionModel::ExtravascularLag => "extra.lag",
        }
    }

    pub fn from_key(key: &str) -> ComputingResult<Self> {
        match key {
            "bolus" => Ok(AbsorptionModel::Bolus),
            "infusion" => Ok(AbsorptionModel::Infusion),
            "extra" => Ok(AbsorptionModel::Extravascular),
            "extra.lag" => Ok(AbsorptionModel::ExtravascularLag),
            _ => Err(ComputingError::BadRequest(format!(
                "unknown absorption model: {key}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdministrationRoute {
    Intravenous,
    IntravenousDrip,
    Oral,
    Intramuscular,
    Subcutaneous,
    Nasal,
    Rectal,
}

/// Identifies how a dose is given: galenic formulation, route and the
/// absorption model used to compute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulationAndRoute {
    pub formulation: String,
    pub route: AdministrationRoute,
    pub absorption_model: AbsorptionModel,
    pub administration_name: String,
}

impl FormulationAndRoute {
    pub fn new(
        formulation: &str,
        route: AdministrationRoute,
        absorption_model: AbsorptionModel,
        administration_name: &str,
    ) -> Self {
        Self {
            formulation: formulation.to_string(),
            route,
            absorption_model,
            administration_name: administration_name.to_string(),
        }
    }
}

/// A dose repeated at a fixed period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastingDose {
    pub dose: f64,
    pub unit: TypedUnit,
    pub formulation_and_route: FormulationAndRoute,
    #[serde(with = "opt_duration_hours", default)]
    pub infusion_duration: Option<Duration>,
    #[serde(with = "duration_hours")]
    pub interval: Duration,
}

/// A dose given once a day at a fixed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDose {
    pub dose: f64,
    pub unit: TypedUnit,
    pub formulation_and_route: FormulationAndRoute,
    #[serde(with = "opt_duration_hours", default)]
    pub infusion_duration: Option<Duration>,
    pub time_of_day: TimeOfDay,
}

/// A dose given once a week. `day_of_week` counts from 0 = Monday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyDose {
    pub dose: f64,
    pub unit: TypedUnit,
    pub formulation_and_route: FormulationAndRoute,
    #[serde(with = "opt_duration_hours", default)]
    pub infusion_duration: Option<Duration>,
    pub day_of_week: u8,
    pub time_of_day: TimeOfDay,
}

/// Structured recurrence of dosing within a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Dosage {
    Lasting(LastingDose),
    Daily(DailyDose),
    Weekly(WeeklyDose),
    Repeat {
        inner: Box<Dosage>,
        count: u32,
    },
    Loop {
        inner: Box<Dosage>,
    },
    SteadyState {
        inner: Box<Dosage>,
        last_dose: Instant,
    },
    Sequence {
        items: Vec<Dosage>,
    },
    Parallel {
        items: Vec<Dosage>,
        #[serde(with = "offsets_hours")]
        offsets: Vec<Duration>,
    },
}

mod offsets_hours {
    use crate::time::{duration_from_hours, duration_to_hours, Duration};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(|d| duration_to_hours(*d)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<f64>::deserialize(d)?
            .into_iter()
            .map(duration_from_hours)
            .collect())
    }
}

impl Dosage {
    /// Span of one full pass of the dosage, when it is finite by itself.
    /// A `Loop` has no intrinsic span: it fills its enclosing range.
    pub fn span(&self) -> Option<Duration> {
        match self {
            Dosage::Lasting(d) => Some(d.interval),
            Dosage::Daily(_) => Some(Duration::hours(24)),
            Dosage::Weekly(_) => Some(Duration::days(7)),
            Dosage::Repeat { inner, count } => {
                inner.span().map(|s| s * (*count as i32))
            }
            Dosage::Loop { .. } => None,
            Dosage::SteadyState { inner, .. } => inner.span(),
            Dosage::Sequence { items } => {
                let mut total = Duration::zero();
                for item in items {
                    total = total + item.span()?;
                }
                Some(total)
            }
            Dosage::Parallel { items, offsets } => {
                let mut max = Duration::zero();
                for (item, offset) in items.iter().zip(offsets) {
                    let end = *offset + item.span()?;
                    if end > max {
                        max = end;
                    }
                }
                Some(max)
            }
        }
    }

    pub fn contains_steady_state(&self) -> bool {
        match self {
            Dosage::SteadyState { .. } => true,
            Dosage::Repeat { inner, .. } | Dosage::Loop { inner } => {
                inner.contains_steady_state()
            }
            Dosage::Sequence { items } | Dosage::Parallel { items, .. } => {
                items.iter().any(Dosage::contains_steady_state)
            }
            _ => false,
        }
    }

    fn count_steady_state(&self) -> usize {
        match self {
            Dosage::SteadyState { inner, .. } => 1 + inner.count_steady_state(),
            Dosage::Repeat { inner, .. } | Dosage::Loop { inner } => inner.count_steady_state(),
            Dosage::Sequence { items } | Dosage::Parallel { items, .. } => {
                items.iter().map(Dosage::count_steady_state).sum()
            }
            _ => 0,
        }
    }

    fn contains_loop(&self) -> bool {
        match self {
            Dosage::Loop { .. } => true,
            Dosage::Repeat { inner, .. } => inner.contains_loop(),
            Dosage::SteadyState { inner, .. } => inner.contains_loop(),
            Dosage::Sequence { items } | Dosage::Parallel { items, .. } => {
                items.iter().any(Dosage::contains_loop)
            }
            _ => false,
        }
    }

    /// Formulation and route of the last single dose in document order.
    pub fn last_formulation_and_route(&self) -> Option<&FormulationAndRoute> {
        match self {
            Dosage::Lasting(d) => Some(&d.formulation_and_route),
            Dosage::Daily(d) => Some(&d.formulation_and_route),
            Dosage::Weekly(d) => Some(&d.formulation_and_route),
            Dosage::Repeat { inner, .. }
            | Dosage::Loop { inner }
            | Dosage::SteadyState { inner, .. } => inner.last_formulation_and_route(),
            Dosage::Sequence { items } | Dosage::Parallel { items, .. } => items
                .iter()
                .rev()
                .find_map(Dosage::last_formulation_and_route),
        }
    }
}

/// One entry of a dose history: a dosage applied over `[start, end)`.
/// An open end means the dosage continues indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Instant,
    pub end: Option<Instant>,
    pub dosage: Dosage,
}

impl TimeRange {
    pub fn new(start: Instant, end: Option<Instant>, dosage: Dosage) -> Self {
        Self { start, end, dosage }
    }
}

/// Ordered list of non-overlapping dosage time ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoseHistory {
    pub ranges: Vec<TimeRange>,
}

impl DoseHistory {
    pub fn new(ranges: Vec<TimeRange>) -> ComputingResult<Self> {
        let history = Self { ranges };
        history.validate()?;
        Ok(history)
    }

    pub fn validate(&self) -> ComputingResult<()> {
        let mut previous_end: Option<Instant> = None;
        for (i, range) in self.ranges.iter().enumerate() {
            if let Some(end) = range.end {
                if end < range.start {
                    return Err(ComputingError::BadRequest(
                        "time range ends before it starts".to_string(),
                    ));
                }
            }
            if let Some(prev) = previous_end {
                if range.start < prev {
                    return Err(ComputingError::BadRequest(
                        "dose history ranges overlap or are unsorted".to_string(),
                    ));
                }
            }
            if range.dosage.contains_loop() && range.end.is_none() {
                return Err(ComputingError::BadRequest(
                    "a dosage loop requires a finite enclosing range".to_string(),
                ));
            }
            if range.end.is_none() && i + 1 != self.ranges.len() {
                return Err(ComputingError::BadRequest(
                    "only the last range may be open-ended".to_string(),
                ));
            }
            previous_end = range.end.or(previous_end);
        }
        let steady_states: usize = self
            .ranges
            .iter()
            .map(|r| r.dosage.count_steady_state())
            .sum();
        if steady_states > 1 {
            return Err(ComputingError::BadRequest(
                "at most one steady-state dosage is allowed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Formulation and route of the last dose of the history, if any.
    pub fn last_formulation_and_route(&self) -> Option<&FormulationAndRoute> {
        self.ranges
            .iter()
            .rev()
            .find_map(|r| r.dosage.last_formulation_and_route())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::instant;

    fn bolus_f_and_r() -> FormulationAndRoute {
        FormulationAndRoute::new(
            "solution",
            AdministrationRoute::Intravenous,
            AbsorptionModel::Bolus,
            "iv push",
        )
    }

    fn lasting(dose: f64, interval_h: i64) -> Dosage {
        Dosage::Lasting(LastingDose {
            dose,
            unit: TypedUnit::mg(),
            formulation_and_route: bolus_f_and_r(),
            infusion_duration: None,
            interval: Duration::hours(interval_h),
        })
    }

    #[test]
    fn test_span_of_nested_dosages() {
        let repeat = Dosage::Repeat {
            inner: Box::new(lasting(100.0, 12)),
            count: 4,
        };
        assert_eq!(repeat.span(), Some(Duration::hours(48)));

        let seq = Dosage::Sequence {
            items: vec![lasting(100.0, 12), lasting(50.0, 6)],
        };
        assert_eq!(seq.span(), Some(Duration::hours(18)));

        let looped = Dosage::Loop {
            inner: Box::new(lasting(100.0, 12)),
        };
        assert_eq!(looped.span(), None);
    }

    #[test]
    fn test_loop_requires_finite_range() {
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 8, 0),
                None,
                Dosage::Loop {
                    inner: Box::new(lasting(100.0, 12)),
                },
            )],
        };
        assert!(history.validate().is_err());
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let history = DoseHistory {
            ranges: vec![
                TimeRange::new(
                    instant(2018, 9, 1, 8, 0),
                    Some(instant(2018, 9, 3, 8, 0)),
                    lasting(100.0, 12),
                ),
                TimeRange::new(
                    instant(2018, 9, 2, 8, 0),
                    Some(instant(2018, 9, 4, 8, 0)),
                    lasting(100.0, 12),
                ),
            ],
        };
        assert!(history.validate().is_err());
    }

    #[test]
    fn test_single_steady_state_allowed() {
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 8, 0),
                Some(instant(2018, 9, 5, 8, 0)),
                Dosage::SteadyState {
                    inner: Box::new(lasting(100.0, 12)),
                    last_dose: instant(2018, 9, 1, 8, 0),
                },
            )],
        };
        assert!(history.validate().is_ok());
    }

    #[test]
    fn test_last_formulation_and_route() {
        let mut oral = lasting(100.0, 12);
        if let Dosage::Lasting(ref mut d) = oral {
            d.formulation_and_route = FormulationAndRoute::new(
                "tablet",
                AdministrationRoute::Oral,
                AbsorptionModel::Extravascular,
                "oral",
            );
        }
        let history = DoseHistory {
            ranges: vec![
                TimeRange::new(
                    instant(2018, 9, 1, 8, 0),
                    Some(instant(2018, 9, 2, 8, 0)),
                    lasting(100.0, 12),
                ),
                TimeRange::new(
                    instant(2018, 9, 2, 8, 0),
                    Some(instant(2018, 9, 3, 8, 0)),
                    oral,
                ),
            ],
        };
        let f = history.last_formulation_and_route().unwrap();
        assert_eq!(f.absorption_model, AbsorptionModel::Extravascular);
    }
}
