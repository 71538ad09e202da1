use crate::dosage::{AbsorptionModel, FormulationAndRoute};
use crate::error::{ComputingError, ComputingResult};
use crate::residual::ErrorModel;
use crate::targets::TargetDefinition;
use crate::time::{Duration, opt_duration_hours};
use crate::units::TypedUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named scalar values of a resolved parameter set.
pub type ParameterValues = HashMap<String, f64>;

/// Formula tree evaluated against covariate values, used for a priori
/// parameter computation and computed covariates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Constant { value: f64 },
    /// The standard (population) value of the parameter being computed.
    Standard,
    /// The current value of a covariate.
    Covariate { id: String },
    Add { lhs: Box<Operation>, rhs: Box<Operation> },
    Sub { lhs: Box<Operation>, rhs: Box<Operation> },
    Mul { lhs: Box<Operation>, rhs: Box<Operation> },
    Div { lhs: Box<Operation>, rhs: Box<Operation> },
    Pow { base: Box<Operation>, exponent: Box<Operation> },
    Exp { arg: Box<Operation> },
    Ln { arg: Box<Operation> },
}

impl Operation {
    pub fn constant(value: f64) -> Operation {
        Operation::Constant { value }
    }

    pub fn covariate(id: &str) -> Operation {
        Operation::Covariate { id: id.to_string() }
    }

    pub fn mul(lhs: Operation, rhs: Operation) -> Operation {
        Operation::Mul {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn div(lhs: Operation, rhs: Operation) -> Operation {
        Operation::Div {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn pow(base: Operation, exponent: Operation) -> Operation {
        Operation::Pow {
            base: Box::new(base),
            exponent: Box::new(exponent),
        }
    }

    pub fn evaluate(
        &self,
        standard_value: f64,
        covariates: &HashMap<String, f64>,
    ) -> ComputingResult<f64> {
        let v = match self {
            Operation::Constant { value } => *value,
            Operation::Standard => standard_value,
            Operation::Covariate { id } => *covariates.get(id).ok_or_else(|| {
                ComputingError::MissingCovariate(format!("formula references covariate {id}"))
            })?,
            Operation::Add { lhs, rhs } => {
                lhs.evaluate(standard_value, covariates)? + rhs.evaluate(standard_value, covariates)?
            }
            Operation::Sub { lhs, rhs } => {
                lhs.evaluate(standard_value, covariates)? - rhs.evaluate(standard_value, covariates)?
            }
            Operation::Mul { lhs, rhs } => {
                lhs.evaluate(standard_value, covariates)? * rhs.evaluate(standard_value, covariates)?
            }
            Operation::Div { lhs, rhs } => {
                let denominator = rhs.evaluate(standard_value, covariates)?;
                if denominator == 0.0 {
                    return Err(ComputingError::NumericalError(
                        "division by zero in formula".to_string(),
                    ));
                }
                lhs.evaluate(standard_value, covariates)? / denominator
            }
            Operation::Pow { base, exponent } => base
                .evaluate(standard_value, covariates)?
                .powf(exponent.evaluate(standard_value, covariates)?),
            Operation::Exp { arg } => arg.evaluate(standard_value, covariates)?.exp(),
            Operation::Ln { arg } => {
                let inner = arg.evaluate(standard_value, covariates)?;
                if inner <= 0.0 {
                    return Err(ComputingError::NumericalError(
                        "logarithm of a non-positive value in formula".to_string(),
                    ));
                }
                inner.ln()
            }
        };
        if !v.is_finite() {
            return Err(ComputingError::NumericalError(
                "formula produced a non-finite value".to_string(),
            ));
        }
        Ok(v)
    }
}

/// Between-subject variability distribution type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BsvType {
    None,
    Additive,
    Proportional,
    Exponential,
    Lognormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bsv {
    pub bsv_type: BsvType,
    pub std_dev: f64,
}

impl Bsv {
    pub fn none() -> Self {
        Self {
            bsv_type: BsvType::None,
            std_dev: 0.0,
        }
    }

    pub fn exponential(std_dev: f64) -> Self {
        Self {
            bsv_type: BsvType::Exponential,
            std_dev,
        }
    }

    pub fn proportional(std_dev: f64) -> Self {
        Self {
            bsv_type: BsvType::Proportional,
            std_dev,
        }
    }

    /// Applies a random effect drawn from the distribution to a typical value.
    pub fn apply_eta(&self, value: f64, eta: f64) -> f64 {
        match self.bsv_type {
            BsvType::None => value,
            BsvType::Additive => value + eta,
            BsvType::Proportional => value * (1.0 + eta),
            BsvType::Exponential | BsvType::Lognormal => value * eta.exp(),
        }
    }

    pub fn is_variable(&self) -> bool {
        self.bsv_type != BsvType::None && self.std_dev > 0.0
    }
}

/// Definition of one PK parameter: typical value, variability, optional
/// a priori formula and validity bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub id: String,
    pub standard_value: f64,
    pub bsv: Bsv,
    #[serde(default)]
    pub apriori: Option<Operation>,
    /// Validity predicate: resolved values must stay within these bounds.
    #[serde(default)]
    pub bounds: Option<(f64, f64)>,
}

impl ParameterDefinition {
    pub fn fixed(id: &str, standard_value: f64) -> Self {
        Self {
            id: id.to_string(),
            standard_value,
            bsv: Bsv::none(),
            apriori: None,
            bounds: None,
        }
    }

    pub fn with_bsv(mut self, bsv: Bsv) -> Self {
        self.bsv = bsv;
        self
    }

    pub fn with_apriori(mut self, operation: Operation) -> Self {
        self.apriori = Some(operation);
        self
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.bounds = Some((lower, upper));
        self
    }

    pub fn is_valid(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.bounds {
            Some((lower, upper)) => value >= lower && value <= upper,
            None => true,
        }
    }
}

/// Disposition model key of an analyte group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuralModel {
    #[serde(rename = "linear.1comp.macro")]
    Linear1CompMacro,
    #[serde(rename = "linear.2comp.macro")]
    Linear2CompMacro,
    #[serde(rename = "linear.2comp.micro")]
    Linear2CompMicro,
    #[serde(rename = "linear.3comp.macro")]
    Linear3CompMacro,
    #[serde(rename = "michaelismenten.1comp")]
    MichaelisMenten1Comp,
    #[serde(rename = "michaelismenten.2comp.micro")]
    MichaelisMenten2CompMicro,
    #[serde(rename = "michaelismenten.2comp.macro")]
    MichaelisMenten2CompMacro,
    #[serde(rename = "michaelismenten.2comp.vmaxamount.macro")]
    MichaelisMenten2CompVmaxAmountMacro,
}

impl StructuralModel {
    pub fn key(&self) -> &'static str {
        match self {
            StructuralModel::Linear1CompMacro => "linear.1comp.macro",
            StructuralModel::Linear2CompMacro => "linear.2comp.macro",
            StructuralModel::Linear2CompMicro => "linear.2comp.micro",
            StructuralModel::Linear3CompMacro => "linear.3comp.macro",
            StructuralModel::MichaelisMenten1Comp => "michaelismenten.1comp",
            StructuralModel::MichaelisMenten2CompMicro => "michaelismenten.2comp.micro",
            StructuralModel::MichaelisMenten2CompMacro => "michaelismenten.2comp.macro",
            StructuralModel::MichaelisMenten2CompVmaxAmountMacro => {
                "michaelismenten.2comp.vmaxamount.macro"
            }
        }
    }

    pub fn from_key(key: &str) -> ComputingResult<Self> {
        match key {
            "linear.1comp.macro" => Ok(StructuralModel::Linear1CompMacro),
            "linear.2comp.macro" => Ok(StructuralModel::Linear2CompMacro),
            "linear.2comp.micro" => Ok(StructuralModel::Linear2CompMicro),
            "linear.3comp.macro" => Ok(StructuralModel::Linear3CompMacro),
            "michaelismenten.1comp" => Ok(StructuralModel::MichaelisMenten1Comp),
            "michaelismenten.2comp.micro" => Ok(StructuralModel::MichaelisMenten2CompMicro),
            "michaelismenten.2comp.macro" => Ok(StructuralModel::MichaelisMenten2CompMacro),
            "michaelismenten.2comp.vmaxamount.macro" => {
                Ok(StructuralModel::MichaelisMenten2CompVmaxAmountMacro)
            }
            _ => Err(ComputingError::BadRequest(format!(
                "unknown structural model: {key}"
            ))),
        }
    }

    /// Number of disposition compartments (the depot of an extravascular
    /// absorption comes on top of these).
    pub fn compartments(&self) -> usize {
        match self {
            StructuralModel::Linear1CompMacro | StructuralModel::MichaelisMenten1Comp => 1,
            StructuralModel::Linear2CompMacro
            | StructuralModel::Linear2CompMicro
            | StructuralModel::MichaelisMenten2CompMicro
            | StructuralModel::MichaelisMenten2CompMacro
            | StructuralModel::MichaelisMenten2CompVmaxAmountMacro => 2,
            StructuralModel::Linear3CompMacro => 3,
        }
    }

    /// Disposition parameters every resolved set must provide.
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            StructuralModel::Linear1CompMacro => &["CL", "V"],
            StructuralModel::Linear2CompMacro => &["CL", "V1", "Q", "V2"],
            StructuralModel::Linear2CompMicro => &["Ke", "V1", "K12", "K21"],
            StructuralModel::Linear3CompMacro => &["CL", "V1", "Q2", "V2", "Q3", "V3"],
            StructuralModel::MichaelisMenten1Comp => &["Km", "Vmax", "V"],
            StructuralModel::MichaelisMenten2CompMicro => &["Km", "Vmax", "V1", "K12", "K21"],
            StructuralModel::MichaelisMenten2CompMacro => &["Km", "Vmax", "V1", "Q", "V2"],
            StructuralModel::MichaelisMenten2CompVmaxAmountMacro => {
                &["Km", "Vmax", "V1", "Q", "V2"]
            }
        }
    }

    /// First-order elimination rate constant, when the model has one.
    /// Michaelis-Menten elimination is concentration-dependent and returns
    /// None; callers fall back to a fixed horizon.
    pub fn elimination_rate(&self, values: &ParameterValues) -> Option<f64> {
        let get = |key: &str| values.get(key).copied();
        match self {
            StructuralModel::Linear1CompMacro => Some(get("CL")? / get("V")?),
            StructuralModel::Linear2CompMacro | StructuralModel::Linear3CompMacro => {
                Some(get("CL")? / get("V1")?)
            }
            StructuralModel::Linear2CompMicro => get("Ke"),
            _ => None,
        }
    }
}

/// Absorption parameters a formulation must provide per absorption model.
pub fn absorption_parameters(absorption: AbsorptionModel) -> &'static [&'static str] {
    match absorption {
        AbsorptionModel::Bolus | AbsorptionModel::Infusion => &[],
        AbsorptionModel::Extravascular => &["F", "Ka"],
        AbsorptionModel::ExtravascularLag => &["F", "Ka", "Tlag"],
    }
}

/// One analyte with its disposition model, parameters and error model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyteGroup {
    pub analyte_id: String,
    pub structural_model: StructuralModel,
    pub parameters: Vec<ParameterDefinition>,
    pub error_model: ErrorModel,
    pub concentration_unit: TypedUnit,
    /// g/mol, needed to force molar model outputs to ug/l.
    #[serde(default)]
    pub molar_mass: Option<f64>,
}

impl AnalyteGroup {
    pub fn parameter(&self, id: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.id == id)
    }

    pub fn standard_values(&self) -> ParameterValues {
        self.parameters
            .iter()
            .map(|p| (p.id.clone(), p.standard_value))
            .collect()
    }
}

/// An active moiety groups analytes and carries the therapeutic targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMoiety {
    pub id: String,
    pub analyte_ids: Vec<String>,
    pub targets: Vec<TargetDefinition>,
}

/// A formulation-and-route of the drug model together with its absorption
/// parameters and the dosages it can be prescribed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullFormulationAndRoute {
    pub specification: FormulationAndRoute,
    /// F, Ka, Tlag definitions when the absorption model needs them.
    pub absorption_parameters: Vec<ParameterDefinition>,
    pub available_doses: Vec<f64>,
    pub dose_unit: TypedUnit,
    #[serde(with = "intervals_hours")]
    pub available_intervals: Vec<Duration>,
    #[serde(with = "intervals_hours", default)]
    pub available_infusions: Vec<Duration>,
    #[serde(default)]
    pub is_default: bool,
}

mod intervals_hours {
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

impl FullFormulationAndRoute {
    pub fn absorption_parameter(&self, id: &str) -> Option<&ParameterDefinition> {
        self.absorption_parameters.iter().find(|p| p.id == id)
    }
}

/// How a covariate value evolves between two patient measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationType {
    /// Linear interpolation between consecutive values.
    Linear,
    /// Step-wise, last value carried forward.
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovariateDataType {
    Numeric,
    Categorical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateDefinition {
    pub id: String,
    /// Value used before the first patient measurement.
    pub standard_value: f64,
    pub data_type: CovariateDataType,
    pub unit: TypedUnit,
    pub interpolation: InterpolationType,
    #[serde(with = "opt_duration_hours", default)]
    pub refresh_period: Option<Duration>,
    /// A computed covariate is evaluated from the others; it is a priori
    /// only and accepts no patient measurements.
    #[serde(default)]
    pub computation: Option<Operation>,
}

impl CovariateDefinition {
    pub fn numeric(id: &str, standard_value: f64, unit: TypedUnit) -> Self {
        Self {
            id: id.to_string(),
            standard_value,
            data_type: CovariateDataType::Numeric,
            unit,
            interpolation: InterpolationType::Linear,
            refresh_period: None,
            computation: None,
        }
    }

    pub fn with_interpolation(mut self, interpolation: InterpolationType) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = Some(period);
        self
    }

    pub fn computed(id: &str, standard_value: f64, operation: Operation) -> Self {
        Self {
            id: id.to_string(),
            standard_value,
            data_type: CovariateDataType::Numeric,
            unit: TypedUnit::dimensionless(),
            interpolation: InterpolationType::Direct,
            refresh_period: None,
            computation: Some(operation),
        }
    }
}

/// In-memory drug model: everything the engines need to know about a drug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrugModel {
    pub drug_id: String,
    pub drug_model_id: String,
    pub analyte_groups: Vec<AnalyteGroup>,
    pub active_moieties: Vec<ActiveMoiety>,
    pub formulation_and_routes: Vec<FullFormulationAndRoute>,
    pub covariates: Vec<CovariateDefinition>,
}

impl DrugModel {
    pub fn validate(&self) -> ComputingResult<()> {
        if self.analyte_groups.is_empty() {
            return Err(ComputingError::BadRequest(
                "drug model has no analyte group".to_string(),
            ));
        }
        if self.formulation_and_routes.is_empty() {
            return Err(ComputingError::BadRequest(
                "drug model has no formulation and route".to_string(),
            ));
        }
        for group in &self.analyte_groups {
            for required in group.structural_model.required_parameters() {
                if group.parameter(required).is_none() {
                    return Err(ComputingError::BadRequest(format!(
                        "analyte group {} misses required parameter {} for model {}",
                        group.analyte_id,
                        required,
                        group.structural_model.key()
                    )));
                }
            }
        }
        for f in &self.formulation_and_routes {
            for required in absorption_parameters(f.specification.absorption_model) {
                if f.absorption_parameter(required).is_none() {
                    return Err(ComputingError::BadRequest(format!(
                        "formulation {} misses absorption parameter {}",
                        f.specification.formulation, required
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn analyte_group(&self, analyte_id: &str) -> ComputingResult<&AnalyteGroup> {
        self.analyte_groups
            .iter()
            .find(|g| g.analyte_id == analyte_id)
            .ok_or_else(|| ComputingError::NoAnalyteMatch(analyte_id.to_string()))
    }

    pub fn default_formulation_and_route(&self) -> ComputingResult<&FullFormulationAndRoute> {
        self.formulation_and_routes
            .iter()
            .find(|f| f.is_default)
            .or_else(|| self.formulation_and_routes.first())
            .ok_or_else(|| {
                ComputingError::BadRequest("drug model has no formulation and route".to_string())
            })
    }

    /// Finds the full definition matching a prescribed formulation and route.
    pub fn formulation_and_route(
        &self,
        specification: &FormulationAndRoute,
    ) -> ComputingResult<&FullFormulationAndRoute> {
        self.formulation_and_routes
            .iter()
            .find(|f| {
                f.specification.absorption_model == specification.absorption_model
                    && f.specification.route == specification.route
            })
            .ok_or_else(|| {
                ComputingError::BadRequest(format!(
                    "no formulation and route matches {}",
                    specification.administration_name
                ))
            })
    }

    pub fn covariate_definition(&self, id: &str) -> Option<&CovariateDefinition> {
        self.covariates.iter().find(|c| c.id == id)
    }
}
