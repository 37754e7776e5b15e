//! Clarabel backend for quadratic programs.
//!
//! Lowers a [`Model`] to Clarabel's conic form
//!
//! ```text
//!   minimize    (1/2)x'Px + q'x
//!   subject to  Ax + s = b,  s ∈ {0}^m_eq × R+^m_ineq
//! ```
//!
//! Equalities (including pinned variables) go to the zero cone; `≤`, `≥`
//! rows and finite variable bounds go to the nonnegative cone.

use ::clarabel::{
    algebra::CscMatrix,
    solver::{DefaultSettingsBuilder, IPSolver, SolverStatus, SupportedConeT},
};
use tracing::debug;
use web_time::Instant;

use super::{Model, Sense, SolveStatus, Solution, SolverBackend, SolverOptions};
use crate::error::{SchedulingError, SchedulingResult};

/// Clarabel is a pure-Rust interior-point solver that's always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClarabelBackend;

struct Row {
    entries: Vec<(usize, f64)>,
    rhs: f64,
}

impl SolverBackend for ClarabelBackend {
    fn id(&self) -> &str {
        "clarabel"
    }

    fn solve(&self, model: &Model, options: &SolverOptions) -> SchedulingResult<Solution> {
        let start = Instant::now();
        let n_var = model.num_vars();
        if n_var == 0 {
            return Ok(Solution {
                status: SolveStatus::Optimal,
                objective: model.evaluate_objective(&[]),
                values: Vec::new(),
                iterations: 0,
                solve_time_ms: 0,
            });
        }

        let (eq_rows, ineq_rows) = lower_rows(model);
        let n_eq = eq_rows.len();
        let mut rows = eq_rows;
        rows.extend(ineq_rows);
        let mut n_ineq = rows.len() - n_eq;
        if rows.is_empty() {
            // Clarabel needs at least one cone; 0·x ≤ 1 is always satisfied.
            rows.push(Row {
                entries: Vec::new(),
                rhs: 1.0,
            });
            n_ineq = 1;
        }

        let mut cones = Vec::with_capacity(2);
        if n_eq > 0 {
            cones.push(SupportedConeT::ZeroConeT(n_eq));
        }
        if n_ineq > 0 {
            cones.push(SupportedConeT::NonnegativeConeT(n_ineq));
        }

        // Accumulate column-wise for CSC
        let mut columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_var];
        let mut rhs = Vec::with_capacity(rows.len());
        for (r, row) in rows.iter().enumerate() {
            for &(col, coeff) in &row.entries {
                columns[col].push((r, coeff));
            }
            rhs.push(row.rhs);
        }
        let a_mat = csc(rows.len(), n_var, columns);

        // P holds 2c on the diagonal and c above it for Σ c_ij x_i x_j
        let mut p_columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_var];
        for (&(i, j), &c) in model.quadratic_terms() {
            if c == 0.0 {
                continue;
            }
            let value = if i == j { 2.0 * c } else { c };
            p_columns[j].push((i, value));
        }
        let p_mat = csc(n_var, n_var, p_columns);
        let q = model.linear_coefficients().to_vec();

        let mut builder = DefaultSettingsBuilder::default();
        builder
            .verbose(options.verbose)
            .max_iter(options.max_iterations)
            .tol_gap_abs(options.tol_gap_abs)
            .tol_gap_rel(options.tol_gap_rel)
            .tol_feas(options.tol_feas);
        if let Some(limit) = options.time_limit_secs {
            builder.time_limit(limit);
        }
        let settings = builder.build().map_err(|e| {
            SchedulingError::NumericalIssue(format!("Clarabel settings error: {:?}", e))
        })?;

        let mut solver =
            ::clarabel::solver::DefaultSolver::new(&p_mat, &q, &a_mat, &rhs, &cones, settings)
                .map_err(|e| {
                    SchedulingError::NumericalIssue(format!(
                        "Clarabel initialization failed: {:?}",
                        e
                    ))
                })?;
        solver.solve();

        let sol = solver.solution;
        let status = map_status(sol.status);
        let values = sol.x;
        let objective = model.evaluate_objective(&values);
        debug!(
            vars = n_var,
            rows = rhs.len(),
            status = %status,
            iterations = sol.iterations,
            "clarabel solve finished"
        );
        Ok(Solution {
            status,
            objective,
            values,
            iterations: sol.iterations,
            solve_time_ms: start.elapsed().as_millis(),
        })
    }
}

fn map_status(status: SolverStatus) -> SolveStatus {
    match status {
        SolverStatus::Solved => SolveStatus::Optimal,
        SolverStatus::AlmostSolved => SolveStatus::FeasibleSuboptimal,
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            SolveStatus::Infeasible
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
            SolveStatus::Unbounded
        }
        SolverStatus::MaxIterations | SolverStatus::MaxTime => SolveStatus::Timeout,
        _ => SolveStatus::NumericalError,
    }
}

/// Split constraints and bounds into zero-cone and nonnegative-cone rows.
fn lower_rows(model: &Model) -> (Vec<Row>, Vec<Row>) {
    let mut eq = Vec::new();
    let mut ineq = Vec::new();

    for c in model.constraints() {
        let entries: Vec<(usize, f64)> = c.expr.terms.iter().map(|(v, k)| (v.index(), *k)).collect();
        let rhs = c.rhs - c.expr.constant;
        match c.sense {
            Sense::Eq => eq.push(Row { entries, rhs }),
            Sense::Le => ineq.push(Row { entries, rhs }),
            Sense::Ge => ineq.push(Row {
                entries: entries.into_iter().map(|(i, k)| (i, -k)).collect(),
                rhs: -rhs,
            }),
        }
    }

    for (i, (&lb, &ub)) in model
        .lower_bounds()
        .iter()
        .zip(model.upper_bounds())
        .enumerate()
    {
        if lb == ub {
            eq.push(Row {
                entries: vec![(i, 1.0)],
                rhs: ub,
            });
            continue;
        }
        if ub.is_finite() {
            ineq.push(Row {
                entries: vec![(i, 1.0)],
                rhs: ub,
            });
        }
        if lb.is_finite() {
            ineq.push(Row {
                entries: vec![(i, -1.0)],
                rhs: -lb,
            });
        }
    }

    (eq, ineq)
}

/// Build a CSC matrix from per-column `(row, value)` entries, merging
/// duplicates.
fn csc(m: usize, n: usize, mut columns: Vec<Vec<(usize, f64)>>) -> CscMatrix<f64> {
    let mut col_ptr = Vec::with_capacity(n + 1);
    let mut row_idx = Vec::new();
    let mut values = Vec::new();
    for column in columns.iter_mut() {
        col_ptr.push(row_idx.len());
        column.sort_by_key(|(r, _)| *r);
        for &(r, v) in column.iter() {
            if row_idx.len() > *col_ptr.last().unwrap_or(&0) && row_idx.last() == Some(&r) {
                if let Some(last) = values.last_mut() {
                    *last += v;
                }
            } else {
                row_idx.push(r);
                values.push(v);
            }
        }
    }
    col_ptr.push(row_idx.len());
    CscMatrix::new(m, n, col_ptr, row_idx, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::LinExpr;

    fn solve(model: &Model) -> Solution {
        ClarabelBackend
            .solve(model, &SolverOptions::default())
            .unwrap()
    }

    #[test]
    fn test_clarabel_backend_id() {
        assert_eq!(ClarabelBackend.id(), "clarabel");
    }

    #[test]
    fn unconstrained_quadratic() {
        // min (x - 3)² = x² - 6x + 9
        let mut model = Model::new();
        let x = model
            .add_var("x", f64::NEG_INFINITY, f64::INFINITY)
            .unwrap();
        model.add_square(x, 1.0);
        model.add_linear(x, -6.0);
        model.add_offset(9.0);
        let sol = solve(&model);
        assert_eq!(sol.status, SolveStatus::Optimal);
        assert!((sol.value(x) - 3.0).abs() < 1e-6);
        assert!(sol.objective.abs() < 1e-6);
    }

    #[test]
    fn bounded_linear_program() {
        // min -x - 2y  s.t. x + y ≤ 4, 0 ≤ x ≤ 3, 0 ≤ y ≤ 1
        let mut model = Model::new();
        let x = model.add_var("x", 0.0, 3.0).unwrap();
        let y = model.add_var("y", 0.0, 1.0).unwrap();
        model.add_linear(x, -1.0);
        model.add_linear(y, -2.0);
        model.add_constraint("cap", LinExpr::sum(&[x, y]), Sense::Le, 4.0);
        let sol = solve(&model);
        assert!((sol.value(x) - 3.0).abs() < 1e-5);
        assert!((sol.value(y) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn equality_and_fixed_variables() {
        // min x² + y²  s.t. x + y = 2, z = 5 (fixed), x ≥ z - 4
        let mut model = Model::new();
        let x = model.add_var("x", f64::NEG_INFINITY, f64::INFINITY).unwrap();
        let y = model.add_var("y", f64::NEG_INFINITY, f64::INFINITY).unwrap();
        let z = model.add_var("z", 5.0, 5.0).unwrap();
        model.add_square(x, 1.0);
        model.add_square(y, 1.0);
        model.add_constraint("sum", LinExpr::sum(&[x, y]), Sense::Eq, 2.0);
        model.add_constraint(
            "link",
            LinExpr::from(x).term(z, -1.0),
            Sense::Ge,
            -4.0,
        );
        let sol = solve(&model);
        assert!((sol.value(x) - 1.0).abs() < 1e-5);
        assert!((sol.value(y) - 1.0).abs() < 1e-5);
        assert!((sol.value(z) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn infeasible_detected() {
        let mut model = Model::new();
        let x = model.add_var("x", 0.0, 1.0).unwrap();
        model.add_constraint("too-much", LinExpr::from(x), Sense::Ge, 2.0);
        let sol = solve(&model);
        assert_eq!(sol.status, SolveStatus::Infeasible);
    }

    #[test]
    fn unbounded_detected() {
        let mut model = Model::new();
        let x = model.add_var("x", 0.0, f64::INFINITY).unwrap();
        model.add_linear(x, -1.0);
        let sol = solve(&model);
        assert_eq!(sol.status, SolveStatus::Unbounded);
    }

    #[test]
    fn duplicate_terms_are_merged() {
        let columns = vec![vec![(0, 1.0), (0, 2.0), (1, 1.0)]];
        let mat = csc(2, 1, columns);
        assert_eq!(mat.rowval, vec![0, 1]);
        assert_eq!(mat.nzval, vec![3.0, 1.0]);
    }
}
