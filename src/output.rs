use crate::computing::{ComputingResponse, ResponsePayload};
use crate::error::ComputingResult;
use crate::prediction::CycleData;
use log::info;
use std::fs::File;
use std::path::Path;

/// Writes every payload of a response under `output_dir`: one CSV per
/// curve-shaped payload plus the full response as JSON.
pub fn save_response<P: AsRef<Path>>(
    response: &ComputingResponse,
    output_dir: P,
) -> ComputingResult<()> {
    let output_path = output_dir.as_ref();

    for (index, payload) in response.payloads.iter().enumerate() {
        match payload {
            ResponsePayload::SinglePrediction(prediction) => {
                save_cycles(
                    &prediction.cycles,
                    &output_path.join(format!("prediction_{index}.csv")),
                )?;
            }
            ResponsePayload::Percentiles(percentiles) => {
                for (rank, cycles) in percentiles.ranks.iter().zip(&percentiles.rank_cycles) {
                    save_cycles(
                        cycles,
                        &output_path.join(format!("percentile_{index}_{rank}.csv")),
                    )?;
                }
            }
            ResponsePayload::SinglePoints(points) => {
                let mut writer =
                    csv::Writer::from_path(output_path.join(format!("points_{index}.csv")))?;
                writer.write_record(["TIME", "CONCENTRATION", "UNIT"])?;
                for (instant, value) in points.instants.iter().zip(&points.concentrations[0]) {
                    writer.write_record(&[
                        instant.to_rfc3339(),
                        value.to_string(),
                        points.unit.symbol.clone(),
                    ])?;
                }
                writer.flush()?;
            }
            ResponsePayload::Adjustment(adjustment) => {
                let mut writer = csv::Writer::from_path(
                    output_path.join(format!("adjustments_{index}.csv")),
                )?;
                writer.write_record(["DOSE", "INTERVAL_H", "INFUSION_H", "SCORE"])?;
                for candidate in &adjustment.candidates {
                    writer.write_record(&[
                        candidate.dose.to_string(),
                        crate::time::duration_to_hours(candidate.interval).to_string(),
                        candidate
                            .infusion_duration
                            .map(|d| crate::time::duration_to_hours(d).to_string())
                            .unwrap_or_default(),
                        candidate.score.to_string(),
                    ])?;
                }
                writer.flush()?;
            }
        }
    }

    let file = File::create(output_path.join("response.json"))?;
    serde_json::to_writer_pretty(file, response)?;

    info!("response {} saved to {:?}", response.id, output_path);
    Ok(())
}

fn save_cycles<P: AsRef<Path>>(cycles: &[CycleData], path: P) -> ComputingResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["CYCLE", "TIME_H", "CONCENTRATION"])?;
    for (cycle_index, cycle) in cycles.iter().enumerate() {
        let offset = crate::time::hours_since(cycles[0].start, cycle.start);
        for (time, value) in cycle.times.iter().zip(&cycle.concentrations[0]) {
            writer.write_record(&[
                cycle_index.to_string(),
                (offset + time).to_string(),
                value.to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}
