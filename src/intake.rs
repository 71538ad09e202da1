use crate::dosage::{DailyDose, Dosage, DoseHistory, FormulationAndRoute, LastingDose, WeeklyDose};
use crate::error::{ComputingError, ComputingResult};
use crate::time::{duration_to_hours, Duration, Instant};
use crate::units::TypedUnit;
use log::debug;

/// Number of synthetic half-lives computed before the window to reach
/// steady state numerically.
const STEADY_STATE_HALF_LIVES: f64 = 20.0;
/// Bounds on the number of synthetic pre-window cycles.
const MIN_PRELUDE_CYCLES: i64 = 20;
const MAX_PRELUDE_CYCLES: i64 = 1000;
/// Sample count of residual-only cycles: start and end of the interval.
const RESIDUAL_ONLY_POINTS: usize = 2;

/// One flattened drug intake, the engine's unit of computation.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeEvent {
    pub start: Instant,
    pub interval: Duration,
    pub dose: f64,
    pub unit: TypedUnit,
    pub formulation_and_route: FormulationAndRoute,
    pub infusion_duration: Option<Duration>,
    /// Number of samples over [0, interval], both boundaries included.
    pub points: usize,
    /// The event starts before the prediction window: residual state
    /// accumulated before the window carries into it.
    pub carry_residuals: bool,
}

impl IntakeEvent {
    pub fn end(&self) -> Instant {
        self.start + self.interval
    }

    /// An event ending at or before the window start is computed for its
    /// terminal residuals only; its cycle is never emitted.
    pub fn is_residual_only(&self, window_start: Instant) -> bool {
        self.end() <= window_start
    }
}

/// Sample count for a cycle: points-per-hour times the interval, rounded
/// up, plus the closing boundary sample. The uniform grid this produces
/// places whole-fraction infusion stops on a grid point.
pub fn cycle_points(points_per_hour: f64, interval: Duration) -> usize {
    let raw = (points_per_hour * duration_to_hours(interval)).ceil() as usize;
    raw.max(1) + 1
}

/// Sum of the sample points of all emitted (in-window) events, the
/// quantity bounded by the overload evaluator.
pub fn total_window_points(intakes: &[IntakeEvent], window_start: Instant) -> usize {
    intakes
        .iter()
        .filter(|i| !i.is_residual_only(window_start))
        .map(|i| i.points)
        .sum()
}

struct RawIntake {
    start: Instant,
    interval: Duration,
    dose: f64,
    unit: TypedUnit,
    formulation_and_route: FormulationAndRoute,
    infusion_duration: Option<Duration>,
    sequence: usize,
}

struct Flattener {
    out: Vec<RawIntake>,
    window_start: Instant,
    clip_end: Instant,
    prelude_cycles: i64,
    sequence: usize,
}

impl Flattener {
    fn push_single(
        &mut self,
        start: Instant,
        interval: Duration,
        dose: f64,
        unit: &TypedUnit,
        formulation_and_route: &FormulationAndRoute,
        infusion_duration: Option<Duration>,
    ) {
        if start >= self.clip_end {
            return;
        }
        self.out.push(RawIntake {
            start,
            interval,
            dose,
            unit: unit.clone(),
            formulation_and_route: formulation_and_route.clone(),
            infusion_duration,
            sequence: self.sequence,
        });
        self.sequence += 1;
    }

    fn push_lasting(&mut self, d: &LastingDose, cursor: Instant) {
        self.push_single(
            cursor,
            d.interval,
            d.dose,
            &d.unit,
            &d.formulation_and_route,
            d.infusion_duration,
        );
    }

    /// Flattens a dosage starting at `cursor`, bounded by `range_end`.
    /// Returns the cursor after one full pass of the dosage.
    fn flatten(
        &mut self,
        dosage: &Dosage,
        cursor: Instant,
        range_end: Instant,
    ) -> ComputingResult<Instant> {
        match dosage {
            Dosage::Lasting(d) => {
                self.push_lasting(d, cursor);
                Ok(cursor + d.interval)
            }
            Dosage::Daily(d) => Ok(self.flatten_daily(d, cursor)),
            Dosage::Weekly(d) => Ok(self.flatten_weekly(d, cursor)),
            Dosage::Repeat { inner, count } => {
                let mut cursor = cursor;
                for _ in 0..*count {
                    cursor = self.flatten(inner, cursor, range_end)?;
                }
                Ok(cursor)
            }
            Dosage::Loop { inner } => {
                let mut cursor = cursor;
                while cursor < range_end {
                    let next = self.flatten(inner, cursor, range_end)?;
                    if next <= cursor {
                        return Err(ComputingError::BadRequest(
                            "dosage loop does not advance in time".to_string(),
                        ));
                    }
                    cursor = next;
                }
                Ok(cursor)
            }
            Dosage::SteadyState { inner, last_dose } => {
                self.flatten_steady_state(inner, *last_dose, range_end)
            }
            Dosage::Sequence { items } => {
                let mut cursor = cursor;
                for item in items {
                    cursor = self.flatten(item, cursor, range_end)?;
                }
                Ok(cursor)
            }
            Dosage::Parallel { items, offsets } => {
                if items.len() != offsets.len() {
                    return Err(ComputingError::BadRequest(
                        "parallel dosage needs one offset per item".to_string(),
                    ));
                }
                let mut furthest = cursor;
                for (item, offset) in items.iter().zip(offsets) {
                    let end = self.flatten(item, cursor + *offset, range_end)?;
                    if end > furthest {
                        furthest = end;
                    }
                }
                Ok(furthest)
            }
        }
    }

    fn flatten_daily(&mut self, d: &DailyDose, cursor: Instant) -> Instant {
        let occurrence = next_time_of_day(cursor, d.time_of_day.as_duration());
        self.push_single(
            occurrence,
            Duration::hours(24),
            d.dose,
            &d.unit,
            &d.formulation_and_route,
            d.infusion_duration,
        );
        occurrence + Duration::hours(24)
    }

    fn flatten_weekly(&mut self, d: &WeeklyDose, cursor: Instant) -> Instant {
        let occurrence = next_weekday_time(cursor, d.day_of_week, d.time_of_day.as_duration());
        self.push_single(
            occurrence,
            Duration::days(7),
            d.dose,
            &d.unit,
            &d.formulation_and_route,
            d.infusion_duration,
        );
        occurrence + Duration::days(7)
    }

    /// A steady-state dosage extends its periodic pattern into the past.
    /// Enough synthetic cycles are generated before the window so the
    /// residual state entering it has converged.
    fn flatten_steady_state(
        &mut self,
        inner: &Dosage,
        last_dose: Instant,
        range_end: Instant,
    ) -> ComputingResult<Instant> {
        let span = inner.span().ok_or_else(|| {
            ComputingError::BadRequest("steady-state dosage needs a finite inner span".to_string())
        })?;
        if span <= Duration::zero() {
            return Err(ComputingError::BadRequest(
                "steady-state dosage has an empty inner span".to_string(),
            ));
        }
        // Cycle index of the pattern occurrence containing the window start.
        let span_ms = span.num_milliseconds();
        let offset_ms = (self.window_start - last_dose).num_milliseconds();
        let k0 = offset_ms.div_euclid(span_ms);
        let mut cursor = last_dose + Duration::milliseconds((k0 - self.prelude_cycles) * span_ms);
        while cursor < range_end {
            let next = self.flatten(inner, cursor, range_end)?;
            if next <= cursor {
                return Err(ComputingError::BadRequest(
                    "steady-state dosage does not advance in time".to_string(),
                ));
            }
            cursor = next;
        }
        Ok(cursor)
    }
}

fn next_time_of_day(cursor: Instant, time_of_day: Duration) -> Instant {
    let day_ms = 24 * 3_600_000;
    let cursor_ms = cursor.timestamp_millis();
    let target = time_of_day.num_milliseconds();
    let in_day = cursor_ms.rem_euclid(day_ms);
    let delta = (target - in_day).rem_euclid(day_ms);
    cursor + Duration::milliseconds(delta)
}

fn next_weekday_time(cursor: Instant, day_of_week: u8, time_of_day: Duration) -> Instant {
    // Unix epoch (1970-01-01) was a Thursday, day 3 counting from Monday.
    let day_ms = 24 * 3_600_000;
    let week_ms = 7 * day_ms;
    let cursor_ms = cursor.timestamp_millis();
    let target = i64::from(day_of_week) * day_ms + time_of_day.num_milliseconds();
    let in_week = (cursor_ms + 3 * day_ms).rem_euclid(week_ms);
    let delta = (target - in_week).rem_euclid(week_ms);
    cursor + Duration::milliseconds(delta)
}

/// Flattens a dose history into the ordered finite list of intake events
/// needed to predict over `[window_start, window_end]`.
///
/// Events before the window are kept with a minimal grid: their terminal
/// residuals seed the first emitted cycle. `half_life_hint` sizes the
/// steady-state prelude.
pub fn extract_intakes(
    history: &DoseHistory,
    window_start: Instant,
    window_end: Instant,
    points_per_hour: f64,
    half_life_hint: Option<Duration>,
) -> ComputingResult<Vec<IntakeEvent>> {
    history.validate()?;
    if window_end <= window_start {
        return Err(ComputingError::BadRequest(
            "prediction window is empty".to_string(),
        ));
    }
    if points_per_hour <= 0.0 {
        return Err(ComputingError::BadRequest(
            "points per hour must be positive".to_string(),
        ));
    }

    let half_life = half_life_hint.unwrap_or_else(|| Duration::hours(12));

    let mut flattener = Flattener {
        out: Vec::new(),
        window_start,
        clip_end: window_end,
        prelude_cycles: 0,
        sequence: 0,
    };

    for range in &history.ranges {
        let range_end = match range.end {
            Some(end) => end.min(window_end),
            None => window_end,
        };
        if range_end <= range.start && !range.dosage.contains_steady_state() {
            continue;
        }
        // Events are constrained to the intersection of their range with
        // the window.
        flattener.clip_end = range_end;
        if let Some(span) = range.dosage.span() {
            // Prelude length in cycles of the dosage's own period.
            let cycles = (STEADY_STATE_HALF_LIVES * duration_to_hours(half_life)
                / duration_to_hours(span).max(1e-9))
            .ceil() as i64;
            flattener.prelude_cycles = cycles.clamp(MIN_PRELUDE_CYCLES, MAX_PRELUDE_CYCLES);
        } else {
            flattener.prelude_cycles = MIN_PRELUDE_CYCLES;
        }
        flattener.flatten(&range.dosage, range.start, range_end)?;
    }

    let mut raw = flattener.out;
    raw.sort_by(|a, b| a.start.cmp(&b.start).then(a.sequence.cmp(&b.sequence)));

    // Simultaneous identical administrations collapse into one dose.
    let mut merged: Vec<RawIntake> = Vec::with_capacity(raw.len());
    for event in raw {
        if let Some(last) = merged.last_mut() {
            if last.start == event.start
                && last.interval == event.interval
                && last.infusion_duration == event.infusion_duration
                && last.formulation_and_route == event.formulation_and_route
            {
                last.dose += event.dose;
                continue;
            }
        }
        merged.push(event);
    }

    // A cycle runs until the next intake: overlapping administrations
    // truncate the running one, its state carrying into the next cycle.
    for i in 0..merged.len() {
        if i + 1 < merged.len() {
            let next_start = merged[i + 1].start;
            if merged[i].start + merged[i].interval > next_start {
                merged[i].interval = next_start - merged[i].start;
            }
        }
    }
    merged.retain(|e| e.interval > Duration::zero());
    let raw = merged;

    // Dosing interruptions still decay the carried residuals: fill each
    // gap with a zero-dose event of the same route.
    let mut filled: Vec<RawIntake> = Vec::with_capacity(raw.len());
    for event in raw {
        if let Some(previous) = filled.last() {
            let previous_end = previous.start + previous.interval;
            if event.start > previous_end {
                filled.push(RawIntake {
                    start: previous_end,
                    interval: event.start - previous_end,
                    dose: 0.0,
                    unit: previous.unit.clone(),
                    formulation_and_route: previous.formulation_and_route.clone(),
                    infusion_duration: None,
                    sequence: previous.sequence,
                });
            }
        }
        filled.push(event);
    }
    let raw = filled;

    let intakes: Vec<IntakeEvent> = raw
        .into_iter()
        .filter(|r| r.start < window_end)
        .map(|r| {
            let residual_only = r.start + r.interval <= window_start;
            IntakeEvent {
                start: r.start,
                interval: r.interval,
                dose: r.dose,
                unit: r.unit,
                formulation_and_route: r.formulation_and_route,
                infusion_duration: r.infusion_duration,
                points: if residual_only {
                    RESIDUAL_ONLY_POINTS
                } else {
                    cycle_points(points_per_hour, r.interval)
                },
                carry_residuals: r.start < window_start,
            }
        })
        .collect();

    debug!(
        "extracted {} intakes ({} in window)",
        intakes.len(),
        intakes
            .iter()
            .filter(|i| !i.is_residual_only(window_start))
            .count()
    );
    Ok(intakes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dosage::{AbsorptionModel, AdministrationRoute, TimeRange};
    use crate::time::{instant, TimeOfDay};

    fn infusion_f_and_r() -> FormulationAndRoute {
        FormulationAndRoute::new(
            "solution",
            AdministrationRoute::IntravenousDrip,
            AbsorptionModel::Infusion,
            "iv drip",
        )
    }

    fn q12h_loop(dose: f64) -> Dosage {
        Dosage::Loop {
            inner: Box::new(Dosage::Lasting(LastingDose {
                dose,
                unit: TypedUnit::mg(),
                formulation_and_route: infusion_f_and_r(),
                infusion_duration: Some(Duration::minutes(120)),
                interval: Duration::hours(12),
            })),
        }
    }

    #[test]
    fn test_loop_extraction_over_four_days() {
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 8, 0),
                Some(instant(2018, 9, 5, 8, 0)),
                q12h_loop(1000.0),
            )],
        };
        let intakes = extract_intakes(
            &history,
            instant(2018, 9, 1, 8, 0),
            instant(2018, 9, 5, 8, 0),
            10.0,
            None,
        )
        .unwrap();
        assert_eq!(intakes.len(), 8);
        assert!(intakes.iter().all(|i| !i.carry_residuals));
        assert_eq!(intakes[0].start, instant(2018, 9, 1, 8, 0));
        assert_eq!(intakes[7].start, instant(2018, 9, 4, 20, 0));
        // 10 pts/h over 12 h, both boundaries included.
        assert_eq!(intakes[0].points, 121);
    }

    #[test]
    fn test_window_clipping_keeps_straddling_event() {
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 8, 0),
                Some(instant(2018, 9, 5, 8, 0)),
                q12h_loop(1000.0),
            )],
        };
        // Window starts mid-cycle on day 2 at 02:00.
        let window_start = instant(2018, 9, 2, 2, 0);
        let intakes = extract_intakes(
            &history,
            window_start,
            instant(2018, 9, 3, 8, 0),
            10.0,
            None,
        )
        .unwrap();
        // The straddling event is emitted with a full grid and carries
        // pre-window residuals; earlier events are residual-only.
        let emitted: Vec<_> = intakes
            .iter()
            .filter(|i| !i.is_residual_only(window_start))
            .collect();
        assert_eq!(emitted[0].start, instant(2018, 9, 1, 20, 0));
        assert!(emitted[0].carry_residuals);
        assert!(emitted[0].points > RESIDUAL_ONLY_POINTS);
        let pre: Vec<_> = intakes
            .iter()
            .filter(|i| i.is_residual_only(window_start))
            .collect();
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].points, RESIDUAL_ONLY_POINTS);
    }

    #[test]
    fn test_daily_dose_in_loop() {
        let daily = Dosage::Loop {
            inner: Box::new(Dosage::Daily(DailyDose {
                dose: 200.0,
                unit: TypedUnit::mg(),
                formulation_and_route: infusion_f_and_r(),
                infusion_duration: None,
                time_of_day: TimeOfDay::new(8, 0),
            })),
        };
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 6, 0),
                Some(instant(2018, 9, 4, 6, 0)),
                daily,
            )],
        };
        let intakes = extract_intakes(
            &history,
            instant(2018, 9, 1, 6, 0),
            instant(2018, 9, 4, 6, 0),
            2.0,
            None,
        )
        .unwrap();
        assert_eq!(intakes.len(), 3);
        assert_eq!(intakes[0].start, instant(2018, 9, 1, 8, 0));
        assert_eq!(intakes[1].start, instant(2018, 9, 2, 8, 0));
    }

    #[test]
    fn test_steady_state_prepends_prelude() {
        let steady = Dosage::SteadyState {
            inner: Box::new(Dosage::Lasting(LastingDose {
                dose: 1000.0,
                unit: TypedUnit::mg(),
                formulation_and_route: infusion_f_and_r(),
                infusion_duration: Some(Duration::minutes(120)),
                interval: Duration::hours(12),
            })),
            last_dose: instant(2018, 9, 1, 8, 0),
        };
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 8, 0),
                Some(instant(2018, 9, 3, 8, 0)),
                steady,
            )],
        };
        let window_start = instant(2018, 9, 1, 8, 0);
        let intakes = extract_intakes(
            &history,
            window_start,
            instant(2018, 9, 3, 8, 0),
            10.0,
            Some(Duration::hours(6)),
        )
        .unwrap();
        let pre: Vec<_> = intakes
            .iter()
            .filter(|i| i.is_residual_only(window_start))
            .collect();
        let emitted: Vec<_> = intakes
            .iter()
            .filter(|i| !i.is_residual_only(window_start))
            .collect();
        // ceil(20 * 6 / 12) = 10, clamped up to 20 cycles of prelude.
        assert_eq!(pre.len(), 20);
        assert_eq!(emitted.len(), 4);
        assert_eq!(emitted[0].start, instant(2018, 9, 1, 8, 0));
        assert!(pre.iter().all(|i| i.points == RESIDUAL_ONLY_POINTS));
    }

    #[test]
    fn test_sequence_and_repeat() {
        let sequence = Dosage::Repeat {
            inner: Box::new(Dosage::Sequence {
                items: vec![
                    Dosage::Lasting(LastingDose {
                        dose: 100.0,
                        unit: TypedUnit::mg(),
                        formulation_and_route: infusion_f_and_r(),
                        infusion_duration: None,
                        interval: Duration::hours(8),
                    }),
                    Dosage::Lasting(LastingDose {
                        dose: 50.0,
                        unit: TypedUnit::mg(),
                        formulation_and_route: infusion_f_and_r(),
                        infusion_duration: None,
                        interval: Duration::hours(16),
                    }),
                ],
            }),
            count: 2,
        };
        let history = DoseHistory {
            ranges: vec![TimeRange::new(
                instant(2018, 9, 1, 0, 0),
                Some(instant(2018, 9, 3, 0, 0)),
                sequence,
            )],
        };
        let intakes = extract_intakes(
            &history,
            instant(2018, 9, 1, 0, 0),
            instant(2018, 9, 3, 0, 0),
            1.0,
            None,
        )
        .unwrap();
        assert_eq!(intakes.len(), 4);
        assert_eq!(intakes[0].dose, 100.0);
        assert_eq!(intakes[1].dose, 50.0);
        assert_eq!(intakes[1].start, instant(2018, 9, 1, 8, 0));
        assert_eq!(intakes[2].start, instant(2018, 9, 2, 0, 0));
    }

    #[test]
    fn test_empty_window_rejected() {
        let history = DoseHistory::default();
        let t = instant(2018, 9, 1, 8, 0);
        assert!(extract_intakes(&history, t, t, 10.0, None).is_err());
    }
}
