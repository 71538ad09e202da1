use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit status of a computation, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputingStatus {
    Ok,
    TooBig,
    BadRequest,
    MissingCovariate,
    InvalidParameters,
    NoSample,
    NoAnalyteMatch,
    SampleBeforeTreatmentStart,
    BayesianFitFailed,
    NumericalError,
    Aborted,
    InternalError,
}

#[derive(Error, Debug)]
pub enum ComputingError {
    #[error("request too big: {0}")]
    TooBig(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing covariate: {0}")]
    MissingCovariate(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("no sample available for a posteriori computation")]
    NoSample,

    #[error("no analyte of the drug model matches: {0}")]
    NoAnalyteMatch(String),

    #[error("a sample is dated before the first intake of the treatment")]
    SampleBeforeTreatmentStart,

    #[error("bayesian fit failed: {0}")]
    BayesianFitFailed(String),

    #[error("numerical error: {0}")]
    NumericalError(String),

    #[error("computation aborted")]
    Aborted,

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ComputingError {
    /// Maps the error onto the closed status taxonomy.
    pub fn status(&self) -> ComputingStatus {
        match self {
            ComputingError::TooBig(_) => ComputingStatus::TooBig,
            ComputingError::BadRequest(_) => ComputingStatus::BadRequest,
            ComputingError::MissingCovariate(_) => ComputingStatus::MissingCovariate,
            ComputingError::InvalidParameters(_) => ComputingStatus::InvalidParameters,
            ComputingError::NoSample => ComputingStatus::NoSample,
            ComputingError::NoAnalyteMatch(_) => ComputingStatus::NoAnalyteMatch,
            ComputingError::SampleBeforeTreatmentStart => {
                ComputingStatus::SampleBeforeTreatmentStart
            }
            ComputingError::BayesianFitFailed(_) => ComputingStatus::BayesianFitFailed,
            ComputingError::NumericalError(_) => ComputingStatus::NumericalError,
            ComputingError::Aborted => ComputingStatus::Aborted,
            ComputingError::InternalError(_) => ComputingStatus::InternalError,
            ComputingError::Io(_) | ComputingError::Json(_) | ComputingError::Csv(_) => {
                ComputingStatus::BadRequest
            }
        }
    }
}

pub type ComputingResult<T> = Result<T, ComputingError>;
