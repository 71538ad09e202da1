use crate::error::{ComputingError, ComputingResult};
use serde::{Deserialize, Serialize};

/// Physical dimension of a unit. Conversion is only defined within a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Mass,
    Volume,
    Time,
    Concentration,
    MolarConcentration,
    ConcentrationTime,
    NoDimension,
}

/// A unit with a dimension and a scale factor to the dimension's base unit.
///
/// Base units: g for mass, L for volume, h for time, g/L for concentration,
/// g*h/L for concentration-time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedUnit {
    pub dimension: Dimension,
    pub factor: f64,
    pub symbol: String,
}

impl TypedUnit {
    fn new(dimension: Dimension, factor: f64, symbol: &str) -> Self {
        Self {
            dimension,
            factor,
            symbol: symbol.to_string(),
        }
    }

    pub fn g() -> Self {
        Self::new(Dimension::Mass, 1.0, "g")
    }

    pub fn mg() -> Self {
        Self::new(Dimension::Mass, 1e-3, "mg")
    }

    pub fn ug() -> Self {
        Self::new(Dimension::Mass, 1e-6, "ug")
    }

    pub fn l() -> Self {
        Self::new(Dimension::Volume, 1.0, "l")
    }

    pub fn ml() -> Self {
        Self::new(Dimension::Volume, 1e-3, "ml")
    }

    pub fn h() -> Self {
        Self::new(Dimension::Time, 1.0, "h")
    }

    pub fn min() -> Self {
        Self::new(Dimension::Time, 1.0 / 60.0, "min")
    }

    pub fn g_per_l() -> Self {
        Self::new(Dimension::Concentration, 1.0, "g/l")
    }

    pub fn mg_per_l() -> Self {
        Self::new(Dimension::Concentration, 1e-3, "mg/l")
    }

    pub fn ug_per_l() -> Self {
        Self::new(Dimension::Concentration, 1e-6, "ug/l")
    }

    pub fn mg_h_per_l() -> Self {
        Self::new(Dimension::ConcentrationTime, 1e-3, "mg*h/l")
    }

    pub fn ug_h_per_l() -> Self {
        Self::new(Dimension::ConcentrationTime, 1e-6, "ug*h/l")
    }

    pub fn mol_per_l() -> Self {
        Self::new(Dimension::MolarConcentration, 1.0, "mol/l")
    }

    pub fn mmol_per_l() -> Self {
        Self::new(Dimension::MolarConcentration, 1e-3, "mmol/l")
    }

    pub fn umol_per_l() -> Self {
        Self::new(Dimension::MolarConcentration, 1e-6, "umol/l")
    }

    pub fn dimensionless() -> Self {
        Self::new(Dimension::NoDimension, 1.0, "-")
    }

    /// Parses the wire symbols used by drug model files.
    pub fn parse(symbol: &str) -> ComputingResult<Self> {
        match symbol {
            "g" => Ok(Self::g()),
            "mg" => Ok(Self::mg()),
            "ug" | "µg" => Ok(Self::ug()),
            "l" | "L" => Ok(Self::l()),
            "ml" | "mL" => Ok(Self::ml()),
            "h" => Ok(Self::h()),
            "min" => Ok(Self::min()),
            "g/l" | "g/L" => Ok(Self::g_per_l()),
            "mg/l" | "mg/L" => Ok(Self::mg_per_l()),
            "ug/l" | "ug/L" | "µg/l" | "µg/L" => Ok(Self::ug_per_l()),
            "mg*h/l" | "mg*h/L" | "h*mg/l" => Ok(Self::mg_h_per_l()),
            "ug*h/l" | "ug*h/L" | "h*ug/l" => Ok(Self::ug_h_per_l()),
            "mol/l" | "mol/L" => Ok(Self::mol_per_l()),
            "mmol/l" | "mmol/L" => Ok(Self::mmol_per_l()),
            "umol/l" | "umol/L" | "µmol/l" | "µmol/L" => Ok(Self::umol_per_l()),
            "-" | "" => Ok(Self::dimensionless()),
            _ => Err(ComputingError::BadRequest(format!(
                "unrecognized unit: {symbol}"
            ))),
        }
    }
}

/// Converts `value` from one unit to another of the same dimension.
pub fn convert(value: f64, from: &TypedUnit, to: &TypedUnit) -> ComputingResult<f64> {
    if from.dimension != to.dimension {
        return Err(ComputingError::BadRequest(format!(
            "cannot convert {} to {}: dimensions differ",
            from.symbol, to.symbol
        )));
    }
    Ok(value * from.factor / to.factor)
}

/// Converts a concentration across the molar boundary: a molar unit needs
/// the analyte's molar mass (g/mol) to land in a mass-based unit.
pub fn convert_concentration(
    value: f64,
    from: &TypedUnit,
    to: &TypedUnit,
    molar_mass: Option<f64>,
) -> ComputingResult<f64> {
    if from.dimension == to.dimension {
        return convert(value, from, to);
    }
    match (from.dimension, to.dimension) {
        (Dimension::MolarConcentration, Dimension::Concentration) => {
            let mass = molar_mass.ok_or_else(|| {
                ComputingError::BadRequest(format!(
                    "converting {} to {} requires a molar mass",
                    from.symbol, to.symbol
                ))
            })?;
            // mol/l -> g/l, then rescale.
            Ok(value * from.factor * mass / to.factor)
        }
        (Dimension::Concentration, Dimension::MolarConcentration) => {
            let mass = molar_mass.ok_or_else(|| {
                ComputingError::BadRequest(format!(
                    "converting {} to {} requires a molar mass",
                    from.symbol, to.symbol
                ))
            })?;
            Ok(value * from.factor / mass / to.factor)
        }
        _ => Err(ComputingError::BadRequest(format!(
            "cannot convert {} to {}: dimensions differ",
            from.symbol, to.symbol
        ))),
    }
}

/// Output unit policy for computed concentrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResultUnitOption {
    /// Keep the unit declared by the drug model analyte.
    #[default]
    RespectDrugModel,
    /// Convert concentrations to ug/l, using the molar mass when the
    /// model unit is molar.
    ForceUgPerLiter,
}
