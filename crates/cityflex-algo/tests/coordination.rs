//! Convergence behaviour of the iterative algorithms.

mod common;

use cityflex_algo::{
    run, AlgorithmConfig, AlgorithmKind, DistributedOptimization, DualDecomposition, ExchangeAdmm,
    IterationPolicy, RunOptions, RunStatus, SchedulingAlgorithm, SchedulingError,
};
use cityflex_core::{CityDistrict, Device, Entity, Generator, Objective};
use common::*;

fn fixed_load_district() -> CityDistrict {
    let mut district = CityDistrict::new(env(900, vec![10.0; 2]), Objective::PeakShaving);
    district
        .add_building(load_building("a", vec![10.0; 2]), (0.0, 0.0))
        .unwrap();
    district
        .add_building(load_building("b", vec![20.0; 2]), (1.0, 0.0))
        .unwrap();
    district
}

#[test]
fn dual_decomposition_residual_halves_each_round() {
    let district = fixed_load_district();
    let rule = DualDecomposition {
        rho: 1.0,
        ..DualDecomposition::default()
    };
    let report = DistributedOptimization::new(rule, RunOptions::default())
        .run(&district)
        .unwrap();
    assert_eq!(report.status, RunStatus::Converged);

    let residuals: Vec<f64> = report.history.iter().map(|r| r.primal_residual).collect();
    assert!((residuals[0] - 30.0).abs() < 1e-4);
    for pair in residuals.windows(2) {
        assert!(pair[1] < pair[0]);
        assert!((pair[1] / pair[0] - 0.5).abs() < 1e-3);
    }
    // 30 / 2^9 is the first value below 0.1
    assert_eq!(report.iterations, 10);
    assert!(residuals.last().unwrap() <= &0.1);
}

#[test]
fn dual_decomposition_with_large_step_diverges() {
    let district = fixed_load_district();
    let rule = DualDecomposition {
        rho: 5.0,
        ..DualDecomposition::default()
    };
    let policy = IterationPolicy {
        divergence_threshold: 1e4,
        divergence_patience: 2,
        ..IterationPolicy::default()
    };
    let err = DistributedOptimization::new(rule, RunOptions::default())
        .with_policy(policy)
        .run(&district)
        .unwrap_err();
    match err {
        SchedulingError::CoordinationDiverged {
            iterations,
            residual,
        } => {
            // residual grows by 1.5 per round from 30
            assert_eq!(iterations, 17);
            assert!(residual > 1e4);
        }
        other => panic!("expected divergence, got {other}"),
    }
    assert!(district.store().snapshot().is_empty());
    // the run lock was released
    district.begin_run().unwrap();
}

#[test]
fn iteration_budget_commits_best_iterate() {
    let district = fixed_load_district();
    let rule = DualDecomposition {
        rho: 1.0,
        ..DualDecomposition::default()
    };
    let policy = IterationPolicy {
        max_iterations: 3,
        ..IterationPolicy::default()
    };
    let report = DistributedOptimization::new(rule, RunOptions::default())
        .with_policy(policy)
        .run(&district)
        .unwrap();
    assert_eq!(report.status, RunStatus::Approximate);
    assert!(report.is_approximate());
    assert_eq!(report.iterations, 3);
    assert_eq!(report.history.len(), 3);
    assert_close(&current_p_el(&district, district.id()), &[30.0; 2], 1e-4);
}

#[test]
fn admm_reaches_central_optimum() {
    let build = || {
        let mut district = CityDistrict::new(env(3600, vec![10.0; 4]), Objective::PeakShaving);
        district
            .add_building(
                battery_building("a", Objective::PeakShaving, vec![2.0, 8.0, 2.0, 8.0]),
                (0.0, 0.0),
            )
            .unwrap();
        district
            .add_building(
                battery_building("b", Objective::PeakShaving, vec![6.0, 6.0, 2.0, 2.0]),
                (1.0, 0.0),
            )
            .unwrap();
        district
    };

    let central = build();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &central).unwrap();

    let distributed = build();
    let mut config = AlgorithmConfig::new(AlgorithmKind::ExchangeAdmm);
    config.admm = ExchangeAdmm {
        eps_primal: 0.01,
        eps_dual: 0.01,
        ..ExchangeAdmm::default()
    };
    let report = run(&config, &distributed).unwrap();
    assert_eq!(report.status, RunStatus::Converged);
    assert!(report.history.iter().all(|r| r.dual_residual.is_some()));

    assert_close(
        &current_p_el(&distributed, distributed.id()),
        &current_p_el(&central, central.id()),
        0.5,
    );
    for (c, d) in central.buildings().iter().zip(distributed.buildings()) {
        assert_close(&current_p_el(&distributed, d.id()), &current_p_el(&central, c.id()), 0.5);
    }
}

#[test]
fn district_generator_is_coordinated_as_a_node() {
    let build = || {
        let mut district = fixed_load_district();
        let pv = Device::Photovoltaic(Generator::new(vec![15.0; 2]).curtailable());
        let pv = district
            .add_generator(Entity::device("pv", pv), (2.0, 0.0))
            .unwrap();
        (district, pv)
    };

    let (central, central_pv) = build();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &central).unwrap();
    assert_close(&current_p_el(&central, central_pv), &[-15.0; 2], 1e-3);
    assert_close(&current_p_el(&central, central.id()), &[15.0; 2], 1e-3);

    for kind in [AlgorithmKind::ExchangeAdmm, AlgorithmKind::DualDecomposition] {
        let (district, pv) = build();
        let mut config = AlgorithmConfig::new(kind);
        config.dual.rho = 0.5;
        let report = run(&config, &district).unwrap();
        assert_eq!(report.status, RunStatus::Converged, "{kind}");
        assert_close(&current_p_el(&district, pv), &[-15.0; 2], 0.5);
        assert_close(&current_p_el(&district, district.id()), &[15.0; 2], 0.5);
    }
}

#[test]
fn invalid_rule_parameters_fail_before_solving() {
    let district = fixed_load_district();
    let rule = ExchangeAdmm {
        rho: -1.0,
        ..ExchangeAdmm::default()
    };
    let err = DistributedOptimization::new(rule, RunOptions::default())
        .run(&district)
        .unwrap_err();
    assert!(matches!(err, SchedulingError::ModelBuild(_)));
}

#[test]
fn distributed_kind_follows_rule() {
    let admm = DistributedOptimization::new(ExchangeAdmm::default(), RunOptions::default());
    assert_eq!(admm.kind(), AlgorithmKind::ExchangeAdmm);
    let config = AlgorithmConfig::new(AlgorithmKind::StandAlone);
    assert_eq!(
        config.build(std::sync::Arc::new(cityflex_algo::ClarabelBackend)).kind(),
        AlgorithmKind::StandAlone
    );
}
