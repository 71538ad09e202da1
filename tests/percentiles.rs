use pk_engine::computing::{
    Aborter, ComputingComponent, ComputingOption, ComputingRequest, ComputingTrait,
    PercentilesTrait, ResponsePayload,
};
use pk_engine::error::{ComputingError, ComputingStatus};
use pk_engine::example_data::{vancomycin_model, vancomycin_treatment};
use pk_engine::parameters::PredictionParameterType;
use pk_engine::percentiles::PercentilesData;
use pk_engine::time::{instant, Duration, Instant};

fn percentiles_request(id: &str, start: Instant, end: Instant, pph: f64) -> ComputingRequest {
    let treatment_start = instant(2018, 9, 1, 8, 0);
    let treatment_end = instant(2018, 9, 12, 8, 0);
    ComputingRequest {
        id: id.to_string(),
        drug_model: vancomycin_model(),
        treatment: vancomycin_treatment(treatment_start, treatment_end),
        traits: vec![ComputingTrait::Percentiles(PercentilesTrait {
            start,
            end,
            points_per_hour: pph,
            ranks: vec![5.0, 25.0, 50.0, 75.0, 95.0],
            options: ComputingOption::with_parameter_type(PredictionParameterType::Population),
        })],
    }
}

fn run(component: &ComputingComponent, request: &ComputingRequest) -> PercentilesData {
    let response = component.compute(request, &Aborter::new()).unwrap();
    match &response.payloads[0] {
        ResponsePayload::Percentiles(data) => data.clone(),
        other => panic!("expected percentiles, got {other:?}"),
    }
}

#[test]
fn ranks_are_monotonic_at_every_sample_time() {
    let component = ComputingComponent::new().with_percentile_samples(200);
    let request = percentiles_request(
        "monotonic",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    let data = run(&component, &request);
    assert_eq!(data.rank_cycles.len(), 5);
    let cycles = data.rank_cycles[0].len();
    for cycle in 0..cycles {
        let points = data.rank_cycles[0][cycle].times.len();
        for point in 0..points {
            for rank in 1..data.ranks.len() {
                let lower = data.rank_cycles[rank - 1][cycle].concentrations[0][point];
                let upper = data.rank_cycles[rank][cycle].concentrations[0][point];
                assert!(
                    upper >= lower,
                    "rank order violated at cycle {cycle} point {point}"
                );
            }
        }
    }
}

#[test]
fn identical_requests_are_bitwise_identical() {
    let component = ComputingComponent::new().with_percentile_samples(150);
    let request = percentiles_request(
        "determinism",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    let first = run(&component, &request);
    let second = run(&component, &request);
    assert_eq!(first, second);

    // A different request id reseeds the Monte-Carlo draw.
    let other = percentiles_request(
        "determinism-other",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    let third = run(&component, &other);
    assert_ne!(first, third);
}

#[test]
fn percentile_curves_preserve_cycle_boundaries() {
    let component = ComputingComponent::new().with_percentile_samples(100);
    let request = percentiles_request(
        "boundaries",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    let data = run(&component, &request);
    for cycles in &data.rank_cycles {
        assert_eq!(cycles.len(), 4);
        for pair in cycles.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}

#[test]
fn oversized_percentile_request_is_refused() {
    let component = ComputingComponent::new().with_percentile_samples(100);
    // Eleven days at 10 points per hour exceeds the percentile budget.
    let request = percentiles_request(
        "toobig",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 12, 8, 0),
        10.0,
    );
    let error = component.compute(&request, &Aborter::new()).unwrap_err();
    assert_eq!(error.status(), ComputingStatus::TooBig);
    let message = error.to_string();
    assert!(message.contains("maximum allowed"), "message: {message}");
}

#[test]
fn preset_aborter_aborts_the_computation() {
    let component = ComputingComponent::new().with_percentile_samples(5_000);
    let request = percentiles_request(
        "aborted",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 3, 8, 0),
        5.0,
    );
    let aborter = Aborter::new();
    aborter.abort();
    let error = component.compute(&request, &aborter).unwrap_err();
    assert!(matches!(error, ComputingError::Aborted));
}

#[test]
fn invalid_ranks_are_rejected() {
    let component = ComputingComponent::new().with_percentile_samples(50);
    let mut request = percentiles_request(
        "bad-ranks",
        instant(2018, 9, 1, 8, 0),
        instant(2018, 9, 2, 8, 0),
        5.0,
    );
    if let ComputingTrait::Percentiles(ref mut t) = request.traits[0] {
        t.ranks = vec![0.0, 50.0];
    }
    let error = component.compute(&request, &Aborter::new()).unwrap_err();
    assert_eq!(error.status(), ComputingStatus::BadRequest);
}

#[test]
fn median_tracks_the_population_prediction() {
    use pk_engine::computing::{compute, ConcentrationTrait};

    let component = ComputingComponent::new().with_percentile_samples(400);
    let start = instant(2018, 9, 1, 8, 0);
    let end = start + Duration::hours(24);
    let request = percentiles_request("median", start, end, 5.0);
    let data = run(&component, &request);

    let concentration_request = ComputingRequest {
        id: "median-ref".to_string(),
        drug_model: request.drug_model.clone(),
        treatment: request.treatment.clone(),
        traits: vec![ComputingTrait::Concentration(ConcentrationTrait {
            start,
            end,
            points_per_hour: 5.0,
            options: ComputingOption::with_parameter_type(PredictionParameterType::Population),
        })],
    };
    let response = compute(&concentration_request, &Aborter::new()).unwrap();
    let ResponsePayload::SinglePrediction(reference) = &response.payloads[0] else {
        panic!("expected a prediction");
    };

    // The 50th percentile stays within a loose band of the typical curve.
    let median = &data.rank_cycles[2];
    let peak_median = median[0]
        .concentrations[0]
        .iter()
        .cloned()
        .fold(0.0, f64::max);
    let peak_reference = reference.cycles[0]
        .concentrations[0]
        .iter()
        .cloned()
        .fold(0.0, f64::max);
    let ratio = peak_median / peak_reference;
    assert!(
        (0.7..1.3).contains(&ratio),
        "median peak drifted: ratio {ratio}"
    );
}
