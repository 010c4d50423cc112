use nalgebra::{DMatrix, DVector};

use crate::layout::VariableLayout;
use crate::residual::{assemble_jacobian, assemble_residuals, total_rows, ResidualProvider};
use crate::{IterationReport, SolveHost};

/// Damping ceiling; exceeding it without a downhill step fails the
/// attempt.
const LAMBDA_MAX: f64 = 1e12;
const LAMBDA_MIN: f64 = 1e-12;
/// Absolute floor added to the augmented diagonal so gradient-free
/// variables keep the system positive definite.
const DIAGONAL_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub initial_damping: f64,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 500,
            initial_damping: 0.1,
            verbose: false,
        }
    }
}

/// Why an attempt stopped short of convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveFailure {
    /// λ reached its ceiling without an accepted step.
    DampingFailed,
    /// Residuals were non-finite at the starting point.
    DegenerateResidual,
}

impl SolveFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            SolveFailure::DampingFailed => "damping adjustment failed",
            SolveFailure::DegenerateResidual => "degenerate residual",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveStats {
    /// Final sum of squared residuals.
    pub residual: f64,
    /// Accepted iterations.
    pub iterations: usize,
    pub converged: bool,
    pub failure: Option<SolveFailure>,
    pub cancelled: bool,
}

fn cost_of(residuals: &[f64]) -> f64 {
    residuals.iter().map(|r| r * r).sum()
}

/// Levenberg-Marquardt on the damped normal equations
/// `(JᵀJ + λ·diag(JᵀJ))·δ = −Jᵀr`.
///
/// Triples are reduced into `JᵀJ` sequentially in emission order, so the
/// arithmetic is reproducible for equal inputs. Quaternion slots are
/// renormalized after every trial step. Steps whose trial residual is
/// non-finite are rejected like uphill steps.
pub fn solve(
    layout: &VariableLayout,
    providers: &[Box<dyn ResidualProvider>],
    x: &mut DVector<f64>,
    options: &SolverOptions,
    host: &mut dyn SolveHost,
) -> SolveStats {
    let n = layout.len();
    let m = total_rows(providers);

    let mut residuals = assemble_residuals(providers, x);
    let mut cost = cost_of(&residuals);
    if !cost.is_finite() {
        return SolveStats {
            residual: cost,
            iterations: 0,
            converged: false,
            failure: Some(SolveFailure::DegenerateResidual),
            cancelled: false,
        };
    }
    if n == 0 {
        // nothing is free; the residual is already final
        return SolveStats {
            residual: cost,
            iterations: 0,
            converged: true,
            failure: None,
            cancelled: false,
        };
    }

    let mut lambda = options.initial_damping;
    let mut iterations = 0;
    let mut converged = false;
    let mut failure = None;
    let mut cancelled = false;

    while iterations < options.max_iterations {
        if host.should_cancel() {
            cancelled = true;
            break;
        }

        let triples = assemble_jacobian(providers, x);

        // normal equations from the sparse triples, reduced row by row
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); m];
        for (row, col, value) in triples {
            rows[row].push((col, value));
        }
        let mut jtj = DMatrix::<f64>::zeros(n, n);
        let mut neg_jtr = DVector::<f64>::zeros(n);
        for (row, entries) in rows.iter().enumerate() {
            let r = residuals[row];
            for &(c1, v1) in entries {
                neg_jtr[c1] -= v1 * r;
                for &(c2, v2) in entries {
                    jtj[(c1, c2)] += v1 * v2;
                }
            }
        }

        let gradient_norm = neg_jtr.amax();
        if gradient_norm < 1e-12 * (1.0 + cost) {
            converged = true;
            break;
        }

        // inner damping loop: grow λ until a downhill step is found
        let mut accepted = false;
        while lambda <= LAMBDA_MAX {
            let mut augmented = jtj.clone();
            for i in 0..n {
                augmented[(i, i)] += lambda * jtj[(i, i)] + DIAGONAL_FLOOR;
            }

            let step = match augmented.cholesky() {
                Some(chol) => chol.solve(&neg_jtr),
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };

            let mut x_trial = &*x + step;
            layout.normalize_quaternions(&mut x_trial);
            let trial_residuals = assemble_residuals(providers, &x_trial);
            let trial_cost = cost_of(&trial_residuals);

            if trial_cost.is_finite() && trial_cost < cost {
                let change = (cost - trial_cost) / cost.max(1e-300);
                *x = x_trial;
                residuals = trial_residuals;
                cost = trial_cost;
                lambda = (lambda * 0.5).max(LAMBDA_MIN);
                iterations += 1;
                accepted = true;

                host.on_iteration(&IterationReport {
                    iteration: iterations,
                    residual: cost,
                    lambda,
                });
                if options.verbose {
                    host.log(&format!(
                        "iteration {iterations}: residual {cost:.6e}, lambda {lambda:.3e}"
                    ));
                }
                host.yield_now();

                if change < options.tolerance {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }

        if !accepted {
            tracing::debug!(lambda, cost, "damping ceiling reached without descent");
            failure = Some(SolveFailure::DampingFailed);
            break;
        }
        if converged {
            break;
        }
    }

    SolveStats {
        residual: cost,
        iterations,
        converged: converged && failure.is_none(),
        failure,
        cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residual::build_providers;
    use crate::NullHost;
    use approx::assert_relative_eq;
    use scene_mvg::SeededRng;
    use scene_types::{Constraint, Project, WorldPoint};

    /// Distance-only toy problem: two free points pulled to distance 5.
    fn distance_project() -> Project {
        let mut project = Project::new("lm");
        let mut a = WorldPoint::new("a");
        a.optimized_xyz = Some([0.0, 0.0, 0.0]);
        let a = project.add_world_point(a);
        let mut b = WorldPoint::new("b");
        b.optimized_xyz = Some([1.0, 0.0, 0.0]);
        let b = project.add_world_point(b);
        project.add_constraint(Constraint::Distance {
            a,
            b,
            target: 5.0,
        });
        // pin one point so the problem is well posed
        project.add_constraint(Constraint::FixedPoint {
            point: a,
            target: [0.0, 0.0, 0.0],
        });
        project
    }

    #[test]
    fn converges_on_distance_problem() {
        let project = distance_project();
        let layout = crate::layout::VariableLayout::build(&project);
        let providers = build_providers(&project, &layout);
        let mut rng = SeededRng::new(0);
        let mut x = layout.initial_vector(&project, &mut rng);

        let stats = solve(
            &layout,
            &providers,
            &mut x,
            &SolverOptions::default(),
            &mut NullHost,
        );
        assert!(stats.converged, "{stats:?}");
        assert!(stats.residual < 1e-10, "residual {}", stats.residual);

        let (a_id, _) = project.world_point_by_name("a").unwrap();
        let (b_id, _) = project.world_point_by_name("b").unwrap();
        let pa = layout.point_ref(a_id).unwrap().position(&x);
        let pb = layout.point_ref(b_id).unwrap().position(&x);
        assert_relative_eq!((pb - pa).norm(), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn already_solved_problem_stops_immediately() {
        let mut project = Project::new("idempotent");
        let mut a = WorldPoint::new("a");
        a.optimized_xyz = Some([0.0, 0.0, 0.0]);
        let a = project.add_world_point(a);
        let mut b = WorldPoint::new("b");
        b.optimized_xyz = Some([5.0, 0.0, 0.0]);
        let b = project.add_world_point(b);
        project.add_constraint(Constraint::Distance {
            a,
            b,
            target: 5.0,
        });

        let layout = crate::layout::VariableLayout::build(&project);
        let providers = build_providers(&project, &layout);
        let mut rng = SeededRng::new(0);
        let mut x = layout.initial_vector(&project, &mut rng);

        let stats = solve(
            &layout,
            &providers,
            &mut x,
            &SolverOptions::default(),
            &mut NullHost,
        );
        assert!(stats.converged);
        assert!(stats.iterations <= 1);
    }

    #[test]
    fn cancellation_stops_between_iterations() {
        struct CancelAfter {
            remaining: std::cell::Cell<usize>,
        }
        impl SolveHost for CancelAfter {
            fn should_cancel(&self) -> bool {
                if self.remaining.get() == 0 {
                    return true;
                }
                self.remaining.set(self.remaining.get() - 1);
                false
            }
        }

        let project = distance_project();
        let layout = crate::layout::VariableLayout::build(&project);
        let providers = build_providers(&project, &layout);
        let mut rng = SeededRng::new(0);
        let mut x = layout.initial_vector(&project, &mut rng);

        let mut host = CancelAfter {
            remaining: std::cell::Cell::new(2),
        };
        let stats = solve(
            &layout,
            &providers,
            &mut x,
            &SolverOptions::default(),
            &mut host,
        );
        assert!(stats.cancelled);
        assert!(stats.iterations <= 2);
    }

    #[test]
    fn deterministic_for_equal_inputs() {
        let run = || {
            let project = distance_project();
            let layout = crate::layout::VariableLayout::build(&project);
            let providers = build_providers(&project, &layout);
            let mut rng = SeededRng::new(0);
            let mut x = layout.initial_vector(&project, &mut rng);
            let stats = solve(
                &layout,
                &providers,
                &mut x,
                &SolverOptions::default(),
                &mut NullHost,
            );
            (stats.residual, stats.iterations, x)
        };
        let (r1, i1, x1) = run();
        let (r2, i2, x2) = run();
        assert_eq!(r1.to_bits(), r2.to_bits());
        assert_eq!(i1, i2);
        assert_eq!(x1, x2);
    }

    #[test]
    fn accepted_steps_strictly_reduce_cost() {
        struct Monotone {
            last: std::cell::Cell<f64>,
        }
        impl SolveHost for Monotone {
            fn on_iteration(&mut self, report: &IterationReport) {
                assert!(report.residual < self.last.get());
                self.last.set(report.residual);
            }
        }

        let project = distance_project();
        let layout = crate::layout::VariableLayout::build(&project);
        let providers = build_providers(&project, &layout);
        let mut rng = SeededRng::new(0);
        let mut x = layout.initial_vector(&project, &mut rng);

        let mut host = Monotone {
            last: std::cell::Cell::new(f64::INFINITY),
        };
        let stats = solve(
            &layout,
            &providers,
            &mut x,
            &SolverOptions::default(),
            &mut host,
        );
        assert!(stats.converged);
    }
}
