use pk_engine::cache::CacheComputing;
use pk_engine::computing::{
    Aborter, ComputingComponent, ComputingOption, ComputingRequest, ComputingTrait,
    PercentilesTrait, ResponsePayload,
};
use pk_engine::example_data::{vancomycin_model, vancomycin_treatment};
use pk_engine::parameters::PredictionParameterType;
use pk_engine::percentiles::PercentilesData;
use pk_engine::time::{instant, Instant};

fn cached_component(samples: usize) -> CacheComputing {
    CacheComputing::new(ComputingComponent::new().with_percentile_samples(samples))
}

fn percentiles_request(id: &str, start: Instant, end: Instant, pph: f64) -> ComputingRequest {
    let treatment_start = instant(2018, 9, 1, 8, 0);
    let treatment_end = instant(2018, 9, 15, 8, 0);
    ComputingRequest {
        id: id.to_string(),
        drug_model: vancomycin_model(),
        treatment: vancomycin_treatment(treatment_start, treatment_end),
        traits: vec![ComputingTrait::Percentiles(PercentilesTrait {
            start,
            end,
            points_per_hour: pph,
            ranks: vec![10.0, 50.0, 90.0],
            options: ComputingOption::with_parameter_type(PredictionParameterType::Population),
        })],
    }
}

fn run(cache: &CacheComputing, request: &ComputingRequest) -> PercentilesData {
    let response = cache.compute(request, &Aborter::new()).unwrap();
    match &response.payloads[0] {
        ResponsePayload::Percentiles(data) => data.clone(),
        other => panic!("expected percentiles, got {other:?}"),
    }
}

#[test]
fn second_identical_call_hits_and_matches() {
    let cache = cached_component(100);
    let request = percentiles_request(
        "idempotent",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    let first = run(&cache, &request);
    assert!(!cache.is_last_call_a_hit());
    let second = run(&cache, &request);
    assert!(cache.is_last_call_a_hit());
    assert_eq!(first, second);
}

#[test]
fn subinterval_is_served_from_the_superset() {
    let cache = cached_component(100);
    let wide = percentiles_request(
        "superset-wide",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 5, 8, 0),
        5.0,
    );
    run(&cache, &wide);
    assert!(!cache.is_last_call_a_hit());

    // Same resolution, inner window.
    let inner_start = instant(2018, 9, 2, 8, 0);
    let inner_end = instant(2018, 9, 4, 8, 0);
    let inner = percentiles_request("superset-inner", inner_start, inner_end, 5.0);
    let data = run(&cache, &inner);
    assert!(cache.is_last_call_a_hit());
    assert!(data.first_cycle_start().unwrap() <= inner_start);
    assert!(data.last_cycle_end().unwrap() >= inner_end);

    // A disjoint later window misses, then hits.
    let late = percentiles_request(
        "superset-late",
        instant(2018, 9, 9, 8, 0),
        instant(2018, 9, 12, 8, 0),
        5.0,
    );
    run(&cache, &late);
    assert!(!cache.is_last_call_a_hit());
    run(&cache, &late);
    assert!(cache.is_last_call_a_hit());
}

#[test]
fn higher_resolution_request_misses() {
    let cache = cached_component(100);
    let base = percentiles_request(
        "pph-base",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    run(&cache, &base);

    let finer = percentiles_request(
        "pph-finer",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.5,
    );
    run(&cache, &finer);
    assert!(!cache.is_last_call_a_hit());

    // A coarser request is satisfied by the finer cached entry.
    let coarser = percentiles_request(
        "pph-coarser",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        2.0,
    );
    run(&cache, &coarser);
    assert!(cache.is_last_call_a_hit());
}

#[test]
fn adjacent_windows_reassemble_for_the_union() {
    let cache = cached_component(100);
    let a = instant(2018, 9, 1, 8, 0);
    let m = instant(2018, 9, 3, 8, 0);
    let b = instant(2018, 9, 5, 8, 0);

    run(&cache, &percentiles_request("split-left", a, m, 5.0));
    run(&cache, &percentiles_request("split-right", m, b, 5.0));
    assert!(!cache.is_last_call_a_hit());

    let union = run(&cache, &percentiles_request("split-union", a, b, 5.0));
    assert!(cache.is_last_call_a_hit());
    assert!(union.first_cycle_start().unwrap() <= a);
    assert!(union.last_cycle_end().unwrap() >= b);
    // Eight q12h cycles over the four reassembled days.
    assert_eq!(union.rank_cycles[0].len(), 8);
    for cycles in &union.rank_cycles {
        for pair in cycles.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}

#[test]
fn different_treatment_does_not_hit() {
    let cache = cached_component(100);
    let request = percentiles_request(
        "key-a",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    run(&cache, &request);

    let mut other = percentiles_request(
        "key-b",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    other.treatment = vancomycin_treatment(
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 10, 8, 0),
    );
    run(&cache, &other);
    assert!(!cache.is_last_call_a_hit());
}

#[test]
fn clear_empties_the_cache() {
    let cache = cached_component(100);
    let request = percentiles_request(
        "clear",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 2, 8, 0),
        5.0,
    );
    run(&cache, &request);
    cache.clear();
    run(&cache, &request);
    assert!(!cache.is_last_call_a_hit());
}
