//! Therapeutic drug monitoring computation engine.
//!
//! Given a drug model, a drug treatment and a list of computing traits,
//! the engine predicts blood concentration curves, computes percentile
//! distributions over the population variability, and searches dosage
//! adjustments reaching the therapeutic targets.

pub mod adjustment;
pub mod cache;
pub mod calculators;
pub mod computing;
pub mod covariate;
pub mod dosage;
pub mod drugmodel;
pub mod error;
pub mod example_data;
pub mod intake;
pub mod output;
pub mod overload;
pub mod parameters;
pub mod percentiles;
pub mod prediction;
pub mod residual;
pub mod targets;
pub mod time;
pub mod treatment;
pub mod units;

pub use computing::{
    compute, Aborter, ComputingComponent, ComputingRequest, ComputingResponse, ComputingTrait,
    ResponsePayload,
};
pub use error::{ComputingError, ComputingResult, ComputingStatus};
