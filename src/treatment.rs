use crate::dosage::DoseHistory;
use crate::drugmodel::CovariateDataType;
use crate::error::ComputingResult;
use crate::targets::TargetDefinition;
use crate::time::Instant;
use crate::units::TypedUnit;
use serde::{Deserialize, Serialize};

/// A measured covariate value of the patient at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientCovariate {
    pub id: String,
    pub value: f64,
    pub data_type: CovariateDataType,
    pub unit: TypedUnit,
    pub date: Instant,
}

impl PatientCovariate {
    pub fn numeric(id: &str, value: f64, unit: TypedUnit, date: Instant) -> Self {
        Self {
            id: id.to_string(),
            value,
            data_type: CovariateDataType::Numeric,
            unit,
            date,
        }
    }
}

/// A measured blood concentration of one analyte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub analyte_id: String,
    pub date: Instant,
    pub value: f64,
    pub unit: TypedUnit,
}

impl Sample {
    pub fn new(analyte_id: &str, date: Instant, value: f64, unit: TypedUnit) -> Self {
        Self {
            analyte_id: analyte_id.to_string(),
            date,
            value,
            unit,
        }
    }
}

/// The patient side of a computing request: dose history, covariate
/// measurements and observed samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrugTreatment {
    pub dose_history: DoseHistory,
    pub covariates: Vec<PatientCovariate>,
    pub samples: Vec<Sample>,
    /// Patient-specific targets, overriding or complementing the drug
    /// model ones depending on the target extraction option.
    #[serde(default)]
    pub targets: Vec<TargetDefinition>,
}

impl DrugTreatment {
    pub fn new(dose_history: DoseHistory) -> Self {
        Self {
            dose_history,
            covariates: Vec::new(),
            samples: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn validate(&self) -> ComputingResult<()> {
        self.dose_history.validate()
    }

    pub fn add_covariate(&mut self, covariate: PatientCovariate) {
        self.covariates.push(covariate);
        self.covariates.sort_by_key(|c| c.date);
    }

    pub fn add_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
        self.samples.sort_by_key(|s| s.date);
    }

    /// Start of the first dosage time range, if any.
    pub fn first_intake_time(&self) -> Option<Instant> {
        self.dose_history.ranges.first().map(|r| r.start)
    }
}
