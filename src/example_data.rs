//! Built-in example drug model and request, used by the CLI `--example`
//! flag and by the integration tests.

use crate::computing::{ComputingOption, ComputingRequest, ComputingTrait, ConcentrationTrait};
use crate::dosage::{
    AbsorptionModel, AdministrationRoute, Dosage, DoseHistory, FormulationAndRoute, LastingDose,
    TimeRange,
};
use crate::drugmodel::{
    ActiveMoiety, AnalyteGroup, Bsv, CovariateDefinition, DrugModel, FullFormulationAndRoute,
    Operation, ParameterDefinition, StructuralModel,
};
use crate::parameters::PredictionParameterType;
use crate::residual::ErrorModel;
use crate::targets::{TargetDefinition, TargetType};
use crate::time::{instant, Duration, Instant};
use crate::treatment::DrugTreatment;
use crate::units::TypedUnit;

/// Two-compartment vancomycin model with infusion dosing, the reference
/// drug of the concentration scenarios.
pub fn vancomycin_model() -> DrugModel {
    let infusion = FormulationAndRoute::new(
        "solution",
        AdministrationRoute::IntravenousDrip,
        AbsorptionModel::Infusion,
        "iv infusion",
    );
    DrugModel {
        drug_id: "vancomycin".to_string(),
        drug_model_id: "ch.tucuxi.vancomycin".to_string(),
        analyte_groups: vec![AnalyteGroup {
            analyte_id: "vancomycin".to_string(),
            structural_model: StructuralModel::Linear2CompMacro,
            parameters: vec![
                ParameterDefinition::fixed("CL", 3.505)
                    .with_bsv(Bsv::exponential(0.292))
                    .with_bounds(0.01, 100.0),
                ParameterDefinition::fixed("V1", 31.05)
                    .with_bsv(Bsv::exponential(0.364))
                    .with_bounds(0.1, 500.0),
                ParameterDefinition::fixed("Q", 7.48).with_bounds(0.01, 100.0),
                ParameterDefinition::fixed("V2", 99.0).with_bounds(0.1, 1000.0),
            ],
            error_model: ErrorModel::mixed(3.4, 0.227),
            concentration_unit: TypedUnit::mg_per_l(),
            molar_mass: None,
        }],
        active_moieties: vec![ActiveMoiety {
            id: "vancomycin".to_string(),
            analyte_ids: vec!["vancomycin".to_string()],
            targets: vec![TargetDefinition::new(
                TargetType::Residual,
                TypedUnit::mg_per_l(),
                10.0,
                15.0,
                20.0,
            )
            .with_alarms(5.0, 30.0)],
        }],
        formulation_and_routes: vec![FullFormulationAndRoute {
            specification: infusion,
            absorption_parameters: vec![],
            available_doses: vec![250.0, 500.0, 750.0, 1000.0, 1250.0, 1500.0],
            dose_unit: TypedUnit::mg(),
            available_intervals: vec![Duration::hours(6), Duration::hours(12), Duration::hours(24)],
            available_infusions: vec![Duration::minutes(60), Duration::minutes(120)],
            is_default: true,
        }],
        covariates: vec![CovariateDefinition::numeric(
            "bodyweight",
            75.0,
            TypedUnit::dimensionless(),
        )],
    }
}

/// One-compartment bolus test model without covariates, used by the
/// population/a-priori equivalence scenario.
pub fn mm_one_comp_model() -> DrugModel {
    let bolus = FormulationAndRoute::new(
        "solution",
        AdministrationRoute::Intravenous,
        AbsorptionModel::Bolus,
        "iv bolus",
    );
    DrugModel {
        drug_id: "testmm".to_string(),
        drug_model_id: "test.mm.1comp.bolus".to_string(),
        analyte_groups: vec![AnalyteGroup {
            analyte_id: "testmm".to_string(),
            structural_model: StructuralModel::MichaelisMenten1Comp,
            parameters: vec![
                ParameterDefinition::fixed("Km", 5.0).with_bsv(Bsv::proportional(0.2)),
                ParameterDefinition::fixed("Vmax", 20.0).with_bsv(Bsv::proportional(0.2)),
                ParameterDefinition::fixed("V", 10.0),
            ],
            error_model: ErrorModel::proportional(0.2),
            concentration_unit: TypedUnit::mg_per_l(),
            molar_mass: None,
        }],
        active_moieties: vec![ActiveMoiety {
            id: "testmm".to_string(),
            analyte_ids: vec!["testmm".to_string()],
            targets: vec![],
        }],
        formulation_and_routes: vec![FullFormulationAndRoute {
            specification: bolus,
            absorption_parameters: vec![],
            available_doses: vec![100.0, 200.0],
            dose_unit: TypedUnit::mg(),
            available_intervals: vec![Duration::hours(12)],
            available_infusions: vec![],
            is_default: true,
        }],
        covariates: vec![],
    }
}

/// A dose-proportional test drug whose clearance follows the `covM`
/// covariate, the adjustment scenario's drug.
pub fn covariate_driven_model(available_doses: Vec<f64>) -> DrugModel {
    let bolus = FormulationAndRoute::new(
        "solution",
        AdministrationRoute::Intravenous,
        AbsorptionModel::Bolus,
        "iv bolus",
    );
    DrugModel {
        drug_id: "testadjust".to_string(),
        drug_model_id: "test.constantelimination".to_string(),
        analyte_groups: vec![AnalyteGroup {
            analyte_id: "testadjust".to_string(),
            structural_model: StructuralModel::Linear1CompMacro,
            parameters: vec![
                // Half-life of one dosing day at the reference covariate,
                // so residuals accumulate dose-proportionally.
                ParameterDefinition::fixed("CL", 0.028_881).with_apriori(Operation::div(
                    Operation::mul(Operation::Standard, Operation::constant(200.0)),
                    Operation::covariate("covM"),
                )),
                ParameterDefinition::fixed("V", 1.0),
            ],
            error_model: ErrorModel::proportional(0.1),
            concentration_unit: TypedUnit::mg_per_l(),
            molar_mass: None,
        }],
        active_moieties: vec![ActiveMoiety {
            id: "testadjust".to_string(),
            analyte_ids: vec!["testadjust".to_string()],
            targets: vec![TargetDefinition::new(
                TargetType::Residual,
                TypedUnit::mg_per_l(),
                1.0,
                1200.0,
                100_000.0,
            )],
        }],
        formulation_and_routes: vec![FullFormulationAndRoute {
            specification: bolus,
            absorption_parameters: vec![],
            available_doses,
            dose_unit: TypedUnit::mg(),
            available_intervals: vec![Duration::hours(24)],
            available_infusions: vec![],
            is_default: true,
        }],
        covariates: vec![CovariateDefinition::numeric(
            "covM",
            200.0,
            TypedUnit::dimensionless(),
        )],
    }
}

/// The q12h 1000 mg infusion treatment of the vancomycin scenario.
pub fn vancomycin_treatment(start: Instant, end: Instant) -> DrugTreatment {
    let dosage = Dosage::Loop {
        inner: Box::new(Dosage::Lasting(LastingDose {
            dose: 1000.0,
            unit: TypedUnit::mg(),
            formulation_and_route: FormulationAndRoute::new(
                "solution",
                AdministrationRoute::IntravenousDrip,
                AbsorptionModel::Infusion,
                "iv infusion",
            ),
            infusion_duration: Some(Duration::minutes(120)),
            interval: Duration::hours(12),
        })),
    };
    DrugTreatment::new(DoseHistory {
        ranges: vec![TimeRange::new(start, Some(end), dosage)],
    })
}

/// A runnable example request: four days of vancomycin, population
/// concentration prediction.
pub fn example_request() -> ComputingRequest {
    let start = instant(2018, 9, 1, 8, 0);
    let end = instant(2018, 9, 5, 8, 0);
    ComputingRequest {
        id: "example".to_string(),
        drug_model: vancomycin_model(),
        treatment: vancomycin_treatment(start, end),
        traits: vec![ComputingTrait::Concentration(ConcentrationTrait {
            start,
            end,
            points_per_hour: 10.0,
            options: ComputingOption::with_parameter_type(PredictionParameterType::Population),
        })],
    }
}
