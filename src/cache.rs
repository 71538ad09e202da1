use crate::computing::{
    percentile_cache_key, Aborter, ComputingComponent, ComputingRequest, ComputingResponse,
    ComputingTrait, ResponsePayload,
};
use crate::error::ComputingResult;
use crate::percentiles::PercentilesData;
use crate::time::Instant;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Memoizing front of the computing component for percentile requests.
///
/// Stores every computed percentiles payload and serves later requests
/// from a single covering entry, or by stitching together the cycles of
/// several overlapping entries. Other traits pass through untouched.
pub struct CacheComputing {
    component: ComputingComponent,
    entries: Mutex<Vec<CacheEntry>>,
    last_call_hit: AtomicBool,
}

struct CacheEntry {
    key: u64,
    payload: PercentilesData,
}

/// One cycle of a cached entry, indexed while reassembling an interval.
struct IndexSlot {
    entry_index: usize,
    cycle_index: usize,
    start: Instant,
    end: Instant,
}

impl CacheComputing {
    pub fn new(component: ComputingComponent) -> Self {
        Self {
            component,
            entries: Mutex::new(Vec::new()),
            last_call_hit: AtomicBool::new(false),
        }
    }

    /// True when the previous `compute` call was served from the cache.
    pub fn is_last_call_a_hit(&self) -> bool {
        self.last_call_hit.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn error_string(&self) -> String {
        self.component.error_string()
    }

    /// Computes a request, serving percentile traits from the cache when
    /// possible. Serialized: one computation at a time per cache instance.
    pub fn compute(
        &self,
        request: &ComputingRequest,
        aborter: &Aborter,
    ) -> ComputingResult<ComputingResponse> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(payload) = self.get_from_cache(&entries, request) {
            self.last_call_hit.store(true, Ordering::SeqCst);
            debug!("percentile cache hit for request {}", request.id);
            return Ok(ComputingResponse {
                id: request.id.clone(),
                payloads: vec![ResponsePayload::Percentiles(payload)],
            });
        }
        self.last_call_hit.store(false, Ordering::SeqCst);

        let response = self.component.compute(request, aborter)?;

        // Only complete successful payloads enter the cache.
        for (computing_trait, payload) in request.traits.iter().zip(&response.payloads) {
            if let (ComputingTrait::Percentiles(t), ResponsePayload::Percentiles(data)) =
                (computing_trait, payload)
            {
                if data.first_cycle_start().is_some() {
                    entries.push(CacheEntry {
                        key: percentile_cache_key(request, t),
                        payload: data.clone(),
                    });
                }
            }
        }
        Ok(response)
    }

    fn get_from_cache(
        &self,
        entries: &[CacheEntry],
        request: &ComputingRequest,
    ) -> Option<PercentilesData> {
        for computing_trait in &request.traits {
            if let ComputingTrait::Percentiles(t) = computing_trait {
                let key = percentile_cache_key(request, t);
                if let Some(payload) = self.get_interval(
                    entries,
                    key,
                    t.start,
                    t.end,
                    t.points_per_hour,
                ) {
                    return Some(payload);
                }
            }
        }
        None
    }

    fn get_interval(
        &self,
        entries: &[CacheEntry],
        key: u64,
        start: Instant,
        end: Instant,
        points_per_hour: f64,
    ) -> Option<PercentilesData> {
        let mut candidates: Vec<usize> = Vec::new();
        for (entry_index, entry) in entries.iter().enumerate() {
            if entry.key != key || entry.payload.points_per_hour < points_per_hour {
                continue;
            }
            let (Some(first), Some(last)) = (
                entry.payload.first_cycle_start(),
                entry.payload.last_cycle_end(),
            ) else {
                continue;
            };
            // A single entry covering the interval settles it.
            if first <= start && last >= end {
                return Some(entry.payload.clone());
            }
            // Keep any overlap as a reassembly candidate.
            if (first <= start && last > start) || (first < end && last >= end) {
                candidates.push(entry_index);
            }
        }
        self.build_response(entries, &candidates, start, end, points_per_hour)
    }

    /// Attempts to stitch a covering payload out of candidate cycles.
    fn build_response(
        &self,
        entries: &[CacheEntry],
        candidates: &[usize],
        start: Instant,
        end: Instant,
        points_per_hour: f64,
    ) -> Option<PercentilesData> {
        let index = build_index(entries, candidates, start, end);
        if !is_full_interval(&index, start, end) {
            return None;
        }
        let first_entry = &entries[candidates[0]].payload;
        let rank_count = first_entry.ranks.len();
        let mut rank_cycles = vec![Vec::with_capacity(index.len()); rank_count];
        for slot in &index {
            let source = &entries[slot.entry_index].payload;
            for (rank_index, cycles) in rank_cycles.iter_mut().enumerate() {
                cycles.push(source.rank_cycles[rank_index][slot.cycle_index].clone());
            }
        }
        Some(PercentilesData {
            ranks: first_entry.ranks.clone(),
            points_per_hour,
            unit: first_entry.unit.clone(),
            rank_cycles,
        })
    }
}

/// Orders the overlapping cycles of all candidates by start time,
/// skipping cycles whose start equals one already indexed.
fn build_index(
    entries: &[CacheEntry],
    candidates: &[usize],
    start: Instant,
    end: Instant,
) -> Vec<IndexSlot> {
    let mut index: Vec<IndexSlot> = Vec::new();
    for &entry_index in candidates {
        let payload = &entries[entry_index].payload;
        let Some(cycles) = payload.rank_cycles.first() else {
            continue;
        };
        for (cycle_index, cycle) in cycles.iter().enumerate() {
            if cycle.end > start && cycle.start < end {
                insert_cycle(
                    &mut index,
                    IndexSlot {
                        entry_index,
                        cycle_index,
                        start: cycle.start,
                        end: cycle.end,
                    },
                );
            }
        }
    }
    index
}

fn insert_cycle(index: &mut Vec<IndexSlot>, slot: IndexSlot) {
    let mut insert_at = 0;
    for (i, existing) in index.iter().enumerate().rev() {
        if slot.start == existing.start {
            return;
        }
        if slot.start > existing.start {
            insert_at = i + 1;
            break;
        }
    }
    index.insert(insert_at, slot);
}

/// The index covers the interval iff it reaches both bounds and every
/// consecutive pair meets end-to-start.
fn is_full_interval(index: &[IndexSlot], start: Instant, end: Instant) -> bool {
    let (Some(first), Some(last)) = (index.first(), index.last()) else {
        return false;
    };
    if first.start > start || last.end < end {
        return false;
    }
    let mut previous_end = first.start;
    for slot in index {
        if slot.start != previous_end {
            return false;
        }
        previous_end = slot.end;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::CycleData;
    use crate::time::{instant, Duration};
    use crate::units::TypedUnit;

    fn cycle(day: u32, hour: u32, interval_h: i64) -> CycleData {
        let start = instant(2018, 9, day, hour, 0);
        CycleData {
            start,
            end: start + Duration::hours(interval_h),
            times: vec![0.0, interval_h as f64],
            concentrations: vec![vec![1.0, 2.0]],
            parameters: Vec::new(),
            covariates: Vec::new(),
            statistics: None,
        }
    }

    fn payload(cycles: Vec<CycleData>, pph: f64) -> PercentilesData {
        PercentilesData {
            ranks: vec![50.0],
            points_per_hour: pph,
            unit: TypedUnit::mg_per_l(),
            rank_cycles: vec![cycles],
        }
    }

    fn entry(key: u64, cycles: Vec<CycleData>, pph: f64) -> CacheEntry {
        CacheEntry {
            key,
            payload: payload(cycles, pph),
        }
    }

    #[test]
    fn test_index_skips_duplicate_starts() {
        let entries = vec![
            entry(1, vec![cycle(1, 8, 12), cycle(1, 20, 12)], 10.0),
            entry(1, vec![cycle(1, 8, 12), cycle(2, 8, 12)], 10.0),
        ];
        let index = build_index(
            &entries,
            &[0, 1],
            instant(2018, 9, 1, 8, 0),
            instant(2018, 9, 2, 20, 0),
        );
        assert_eq!(index.len(), 3);
        // The duplicate 08:00 cycle of the second entry was skipped.
        assert_eq!(index[0].entry_index, 0);
        assert_eq!(index[2].entry_index, 1);
    }

    #[test]
    fn test_full_interval_requires_contiguity() {
        let entries = vec![entry(
            1,
            vec![cycle(1, 8, 12), cycle(2, 8, 12)],
            10.0,
        )];
        // A 12 h gap between the cycles: not contiguous.
        let index = build_index(
            &entries,
            &[0],
            instant(2018, 9, 1, 8, 0),
            instant(2018, 9, 2, 20, 0),
        );
        assert!(!is_full_interval(
            &index,
            instant(2018, 9, 1, 8, 0),
            instant(2018, 9, 2, 20, 0)
        ));
    }

    #[test]
    fn test_split_entries_reassemble() {
        let cache = CacheComputing::new(ComputingComponent::new());
        let entries = vec![
            entry(7, vec![cycle(1, 8, 12), cycle(1, 20, 12)], 10.0),
            entry(7, vec![cycle(2, 8, 12), cycle(2, 20, 12)], 10.0),
        ];
        let reassembled = cache
            .get_interval(
                &entries,
                7,
                instant(2018, 9, 1, 8, 0),
                instant(2018, 9, 3, 8, 0),
                10.0,
            )
            .unwrap();
        assert_eq!(reassembled.rank_cycles[0].len(), 4);
        assert_eq!(
            reassembled.rank_cycles[0][3].end,
            instant(2018, 9, 3, 8, 0)
        );
    }

    #[test]
    fn test_lower_resolution_entry_is_ignored() {
        let cache = CacheComputing::new(ComputingComponent::new());
        let entries = vec![entry(7, vec![cycle(1, 8, 12), cycle(1, 20, 12)], 10.0)];
        assert!(cache
            .get_interval(
                &entries,
                7,
                instant(2018, 9, 1, 8, 0),
                instant(2018, 9, 2, 8, 0),
                11.0,
            )
            .is_none());
        assert!(cache
            .get_interval(
                &entries,
                7,
                instant(2018, 9, 1, 8, 0),
                instant(2018, 9, 2, 8, 0),
                10.0,
            )
            .is_some());
    }

    #[test]
    fn test_key_mismatch_misses() {
        let cache = CacheComputing::new(ComputingComponent::new());
        let entries = vec![entry(7, vec![cycle(1, 8, 12), cycle(1, 20, 12)], 10.0)];
        assert!(cache
            .get_interval(
                &entries,
                8,
                instant(2018, 9, 1, 8, 0),
                instant(2018, 9, 2, 8, 0),
                10.0,
            )
            .is_none());
    }
}
