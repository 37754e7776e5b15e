//! End-to-end scheduling of small districts.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cityflex_algo::{
    run, AlgorithmConfig, AlgorithmKind, CentralOptimization, ClarabelBackend, Model, Robustness,
    RunOptions, RunStatus, SchedulingAlgorithm, SchedulingError, SchedulingResult, SolveStatus,
    Solution, SolverBackend, SolverOptions,
};
use cityflex_core::metrics::costs;
use cityflex_core::{CityDistrict, Device, Objective, Quantity, CURRENT};
use common::*;

#[test]
fn every_algorithm_plans_the_determined_district() {
    for kind in [
        AlgorithmKind::Central,
        AlgorithmKind::ExchangeAdmm,
        AlgorithmKind::DualDecomposition,
        AlgorithmKind::StandAlone,
    ] {
        let (district, b1, b2) = two_heated_buildings();
        let report = run(&AlgorithmConfig::new(kind), &district)
            .unwrap_or_else(|e| panic!("{kind} failed: {e}"));
        assert_eq!(report.algorithm, kind);
        assert!(!report.is_approximate(), "{kind} did not finish cleanly");

        assert_close(&current_p_el(&district, b1), &[20.0; 2], 1e-4);
        assert_close(&current_p_el(&district, b2), &[40.0; 2], 1e-4);
        assert_close(&current_p_el(&district, district.id()), &[60.0; 2], 1e-3);
        assert!((report.district_objective - 7200.0).abs() < 0.1);
    }
}

#[test]
fn central_reports_single_optimal_solve() {
    let (district, _, _) = two_heated_buildings();
    let report = CentralOptimization::new(RunOptions::default())
        .run(&district)
        .unwrap();
    assert_eq!(report.status, RunStatus::Optimal);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.history.len(), 1);
}

#[test]
fn stand_alone_runs_one_round() {
    let (district, _, _) = two_heated_buildings();
    let report = run(&AlgorithmConfig::new(AlgorithmKind::StandAlone), &district).unwrap();
    assert_eq!(report.status, RunStatus::Converged);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.history[0].primal_residual, 0.0);
}

#[test]
fn stand_alone_follows_the_building_objective() {
    // the district asks for a flat profile, the building only sees prices
    let mut district = CityDistrict::new(env(3600, vec![1.0, 5.0]), Objective::PeakShaving);
    let a = district
        .add_building(battery_building("a", Objective::Price, vec![2.0, 2.0]), (0.0, 0.0))
        .unwrap();
    run(&AlgorithmConfig::new(AlgorithmKind::StandAlone), &district).unwrap();
    assert_close(&current_p_el(&district, a), &[7.0, -3.0], 1e-3);
}

#[test]
fn central_rerun_is_idempotent() {
    let mut district = CityDistrict::new(env(3600, vec![1.0, 1.0, 5.0, 5.0]), Objective::PeakShaving);
    let a = district
        .add_building(battery_building("a", Objective::Price, vec![2.0, 8.0, 2.0, 8.0]), (0.0, 0.0))
        .unwrap();
    let central = CentralOptimization::new(RunOptions::default());
    central.run(&district).unwrap();
    let first = district.store().snapshot();
    central.run(&district).unwrap();
    let second = district.store().snapshot();
    assert_eq!(first.len(), second.len());
    for (id, slots) in &first {
        assert_close(
            second[id][CURRENT].p_el().unwrap_or_default(),
            slots[CURRENT].p_el().unwrap_or_default(),
            1e-6,
        );
    }
    assert!(current_p_el(&district, a).iter().all(|p| p.is_finite()));
}

#[test]
fn central_respects_leaf_bounds_and_aggregation() {
    let mut district = CityDistrict::new(env(3600, vec![1.0, 1.0, 5.0, 5.0]), Objective::PeakShaving);
    let a = district
        .add_building(battery_building("a", Objective::Price, vec![2.0, 8.0, 2.0, 8.0]), (0.0, 0.0))
        .unwrap();
    let b = district
        .add_building(
            heated_building("b", Objective::PeakShaving, vec![3.0; 4], vec![6.0, 2.0, 6.0, 2.0], 10.0, 8.0),
            (1.0, 0.0),
        )
        .unwrap();
    CentralOptimization::new(RunOptions::default())
        .run(&district)
        .unwrap();

    let store = district.store();
    for building in district.buildings() {
        let total = current_p_el(&district, building.id());
        let mut sum = vec![0.0; 4];
        for (entity, device) in building.devices() {
            let schedule = store.require(entity.id(), CURRENT).unwrap();
            if let Some(p) = schedule.p_el() {
                for (s, v) in sum.iter_mut().zip(p) {
                    *s += v;
                }
            }
            match device {
                Device::Battery(bat) => {
                    let e = schedule.get(Quantity::EEl).unwrap();
                    assert!(e.iter().all(|v| *v >= -1e-6 && *v <= bat.capacity + 1e-6));
                    assert!(p_within(schedule.p_el().unwrap(), -bat.p_discharge_max, bat.p_charge_max));
                }
                Device::ThermalHeatingStorage(ths) => {
                    let e = schedule.get(Quantity::EThHeat).unwrap();
                    assert!(e.iter().all(|v| *v >= -1e-6 && *v <= ths.capacity + 1e-6));
                    assert!(*e.last().unwrap() >= ths.soc_init * ths.capacity - 1e-6);
                }
                Device::ElectricalHeater(eh) => {
                    let p_th = schedule.get(Quantity::PThHeat).unwrap();
                    assert!(p_within(p_th, -eh.p_th_nom, 0.0));
                }
                _ => {}
            }
        }
        assert_close(&total, &sum, 1e-5);
    }

    let district_p = current_p_el(&district, district.id());
    let sum: Vec<f64> = current_p_el(&district, a)
        .iter()
        .zip(current_p_el(&district, b))
        .map(|(x, y)| x + y)
        .collect();
    assert_close(&district_p, &sum, 1e-5);
}

fn p_within(values: &[f64], lower: f64, upper: f64) -> bool {
    values.iter().all(|v| *v >= lower - 1e-6 && *v <= upper + 1e-6)
}

#[test]
fn stand_alone_never_beats_central_on_district_objective() {
    let build = || {
        let mut district = CityDistrict::new(env(3600, vec![1.0, 1.0, 5.0, 5.0]), Objective::PeakShaving);
        district
            .add_building(battery_building("a", Objective::Price, vec![5.0; 4]), (0.0, 0.0))
            .unwrap();
        district
            .add_building(battery_building("b", Objective::Price, vec![3.0, 6.0, 3.0, 6.0]), (1.0, 0.0))
            .unwrap();
        district
    };
    let central = run(&AlgorithmConfig::new(AlgorithmKind::Central), &build()).unwrap();
    let stand_alone = run(&AlgorithmConfig::new(AlgorithmKind::StandAlone), &build()).unwrap();
    assert!(central.district_objective <= stand_alone.district_objective + 1e-4);
}

#[test]
fn robust_storage_costs_at_least_nominal() {
    let prices = vec![6.0, 6.0, 6.0, 10.0, 10.0, 10.0];
    let plan = |robustness: Option<Robustness>| {
        let mut district = CityDistrict::new(env(900, prices.clone()), Objective::None);
        let id = district
            .add_building(
                heated_building("bd", Objective::Price, vec![0.0; 6], vec![10.0; 6], 20.0, 20.0),
                (0.0, 0.0),
            )
            .unwrap();
        CentralOptimization::new(RunOptions {
            robustness,
            ..RunOptions::default()
        })
        .run(&district)
        .unwrap();
        costs(&current_p_el(&district, id), &prices, None, 0.25)
    };
    let nominal = plan(None);
    let robust = plan(Some(Robustness {
        protected_steps: 6.0,
        deviation: 0.5,
    }));
    assert!((nominal - 90.0).abs() < 1e-3, "nominal cost {nominal}");
    assert!(robust >= nominal + 1.0, "robust cost {robust} vs nominal {nominal}");
}

/// Delegates to Clarabel but reports infeasibility from the `fail_at`-th
/// solve on.
struct FailingBackend {
    calls: AtomicUsize,
    fail_at: usize,
}

impl SolverBackend for FailingBackend {
    fn id(&self) -> &str {
        "failing"
    }

    fn solve(&self, model: &Model, options: &SolverOptions) -> SchedulingResult<Solution> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut solution = ClarabelBackend.solve(model, options)?;
        if call >= self.fail_at {
            solution.status = SolveStatus::Infeasible;
        }
        Ok(solution)
    }
}

#[test]
fn failed_run_leaves_store_untouched() {
    let (district, _, _) = two_heated_buildings();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &district).unwrap();
    let before = district.store().snapshot();

    for kind in [
        AlgorithmKind::Central,
        AlgorithmKind::ExchangeAdmm,
        AlgorithmKind::DualDecomposition,
    ] {
        // central fails on its only solve, the iterative ones mid-round
        let fail_at = if kind == AlgorithmKind::Central { 1 } else { 3 };
        let backend = Arc::new(FailingBackend {
            calls: AtomicUsize::new(0),
            fail_at,
        });
        let err = AlgorithmConfig::new(kind).build(backend).run(&district).unwrap_err();
        assert!(matches!(err, SchedulingError::Infeasible(_)), "{kind}: {err}");
        assert_eq!(district.store().snapshot(), before);
    }
}

#[test]
fn negative_robust_deviation_fails_before_solving() {
    let (district, _, _) = two_heated_buildings();
    let backend = Arc::new(FailingBackend {
        calls: AtomicUsize::new(0),
        fail_at: usize::MAX,
    });
    for kind in [AlgorithmKind::Central, AlgorithmKind::ExchangeAdmm] {
        let mut config = AlgorithmConfig::new(kind);
        config.options.robustness = Some(Robustness {
            protected_steps: 2.0,
            deviation: -0.5,
        });
        let err = config.build(backend.clone()).run(&district).unwrap_err();
        assert!(matches!(err, SchedulingError::ModelBuild(_)), "{kind}: {err}");
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert!(district.store().snapshot().is_empty());
}

#[test]
fn concurrent_run_is_rejected() {
    let (district, _, _) = two_heated_buildings();
    let guard = district.begin_run().unwrap();
    let err = run(&AlgorithmConfig::new(AlgorithmKind::Central), &district).unwrap_err();
    assert!(matches!(err, SchedulingError::CommitConflict));
    assert!(district.store().snapshot().is_empty());
    drop(guard);
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &district).unwrap();
}
