//! Constraint-driven bundle adjustment.
//!
//! Given a [`Project`] of world points (partially or fully locked),
//! viewpoints, hand-clicked image points, vanishing lines, and geometric
//! constraints, [`optimize`] jointly refines camera intrinsics/extrinsics
//! and 3D coordinates so reprojection error and constraint violations are
//! minimized together.
//!
//! The pipeline: reset optimization state → propagate coordinate
//! inferences → enumerate initialization candidates (vanishing-point
//! rotation, PnP resection, essential-matrix two-view, or plain
//! refinement) → run the sparse Levenberg-Marquardt solver per candidate
//! → keep the best by median reprojection error → optionally remove
//! outlier observations and re-solve once → write results back into the
//! entity graph.
//!
//! Exclusive ownership of the project (`&mut Project`) serializes solves;
//! there is no global state beyond the caller-provided RNG seed. Hosts
//! integrate through the [`SolveHost`] trait (per-iteration snapshots,
//! cooperative cancellation, logging, and a yield point for UI
//! responsiveness).
#![deny(rust_2018_idioms)]

use serde::{Deserialize, Serialize};

use scene_mvg::{Camera, SeededRng};
use scene_types::{ImagePointId, Project, ViewpointId};

pub mod candidates;
pub mod infer;
pub mod layout;
pub mod lm;
pub mod outlier;
pub mod residual;

pub use candidates::{CandidatePlan, InitError, PlanKind};
pub use layout::VariableLayout;
pub use lm::{SolveFailure, SolveStats, SolverOptions};
pub use outlier::OutlierObservation;

/// Tuning knobs of [`optimize`]; every field has the documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeOptions {
    /// Relative residual change below which the solver stops.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Initial Levenberg-Marquardt damping.
    pub damping: f64,
    /// Emit per-iteration lines through the host's `log` hook.
    pub verbose: bool,
    pub auto_initialize_cameras: bool,
    pub auto_initialize_world_points: bool,
    pub detect_outliers: bool,
    pub outlier_threshold_multiplier: f64,
    /// Number of initialization candidates tried.
    pub max_attempts: usize,
    /// Seed of the deterministic RNG used by initialization.
    pub seed: u64,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 500,
            damping: 0.1,
            verbose: false,
            auto_initialize_cameras: true,
            auto_initialize_world_points: true,
            detect_outliers: true,
            outlier_threshold_multiplier: 5.0,
            max_attempts: 3,
            seed: 0,
        }
    }
}

/// Outcome of [`optimize`]. `error` is `None` on success; on failure the
/// project is restored to its pre-call state (except cancellation, which
/// keeps the best accepted intermediate state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResult {
    pub converged: bool,
    /// Accepted solver iterations (both passes when outliers re-solve).
    pub iterations: usize,
    /// Final sum of squared residuals.
    pub residual: f64,
    pub median_reprojection_error: Option<f64>,
    pub rms_reprojection_error: Option<f64>,
    pub outliers: Vec<OutlierObservation>,
    pub cameras_initialized: Vec<String>,
    pub cameras_excluded: Vec<String>,
    pub error: Option<String>,
}

/// Per-iteration snapshot passed to [`SolveHost::on_iteration`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub residual: f64,
    pub lambda: f64,
}

/// Host integration seam.
///
/// All hooks default to no-ops; servers typically use [`NullHost`].
/// `yield_now` is called after each accepted iteration so interactive
/// hosts can keep their event loop responsive; `should_cancel` is checked
/// at iteration boundaries.
pub trait SolveHost {
    fn on_iteration(&mut self, _report: &IterationReport) {}
    fn should_cancel(&self) -> bool {
        false
    }
    fn log(&mut self, _message: &str) {}
    fn yield_now(&mut self) {}
}

/// The no-op host.
pub struct NullHost;

impl SolveHost for NullHost {}

/// Per-observation reprojection magnitudes after a solve.
struct Evaluation {
    /// `(observation, magnitude)` for in-front observations.
    observed: Vec<(ImagePointId, f64)>,
    behind: usize,
}

impl Evaluation {
    fn median(&self) -> Option<f64> {
        let magnitudes: Vec<f64> = self.observed.iter().map(|(_, e)| *e).collect();
        outlier::median_error(&magnitudes)
    }

    fn rms(&self) -> Option<f64> {
        if self.observed.is_empty() {
            return None;
        }
        let sum_sq: f64 = self.observed.iter().map(|(_, e)| e * e).sum();
        Some((sum_sq / self.observed.len() as f64).sqrt())
    }
}

/// Evaluate every enabled observation against the current entity state,
/// writing `last_residuals` and per-point RMS along the way.
fn evaluate_observations(project: &mut Project) -> Evaluation {
    let mut cameras: Vec<(ViewpointId, Camera)> = Vec::new();
    for (id, vp) in project.viewpoints.iter() {
        if vp.enabled_in_solve {
            cameras.push((id, Camera::from_viewpoint(vp)));
        }
    }
    let camera_of = |id: ViewpointId| cameras.iter().find(|(cid, _)| *cid == id);

    let mut observed = Vec::new();
    let mut behind = 0;
    let mut per_point: std::collections::BTreeMap<scene_types::WorldPointId, Vec<f64>> =
        std::collections::BTreeMap::new();

    let updates: Vec<(ImagePointId, [f64; 2], bool)> = project
        .image_points
        .iter()
        .filter_map(|(ip_id, ip)| {
            let (_, camera) = camera_of(ip.viewpoint)?;
            let point = project.world_points.get(ip.world_point)?;
            let xyz = point.effective_xyz()?;
            let residual = camera.reprojection_residual(&xyz, &ip.uv);
            let is_behind = camera.project(&xyz).pixel().is_none();
            Some((ip_id, residual, is_behind))
        })
        .collect();

    for (ip_id, residual, is_behind) in updates {
        let world_point = {
            let ip = project.image_points.get_mut(ip_id).expect("image point");
            ip.last_residuals = Some(residual);
            ip.world_point
        };
        if is_behind {
            behind += 1;
        } else {
            let magnitude = (residual[0] * residual[0] + residual[1] * residual[1]).sqrt();
            observed.push((ip_id, magnitude));
            per_point.entry(world_point).or_default().push(magnitude);
        }
    }

    for (point_id, magnitudes) in per_point {
        if let Some(point) = project.world_points.get_mut(point_id) {
            let sum_sq: f64 = magnitudes.iter().map(|m| m * m).sum();
            point.last_rms = Some((sum_sq / magnitudes.len() as f64).sqrt());
        }
    }

    Evaluation { observed, behind }
}

/// Build the layout and providers for the current entity state and run
/// one LM pass, writing the result back into the project.
fn run_solver_pass(
    project: &mut Project,
    options: &OptimizeOptions,
    rng: &mut SeededRng,
    host: &mut dyn SolveHost,
) -> SolveStats {
    let layout = VariableLayout::build(project);
    let providers = residual::build_providers(project, &layout);
    let mut x = layout.initial_vector(project, &mut rng.scoped(7));
    let solver_options = SolverOptions {
        tolerance: options.tolerance,
        max_iterations: options.max_iterations,
        initial_damping: options.damping,
        verbose: options.verbose,
    };
    let stats = lm::solve(&layout, &providers, &mut x, &solver_options, host);
    layout.write_back(&x, project);
    stats
}

fn failure_result(error: String) -> OptimizeResult {
    OptimizeResult {
        converged: false,
        iterations: 0,
        residual: f64::INFINITY,
        median_reprojection_error: None,
        rms_reprojection_error: None,
        outliers: Vec::new(),
        cameras_initialized: Vec::new(),
        cameras_excluded: Vec::new(),
        error: Some(error),
    }
}

/// Run the full optimization pipeline on a project.
///
/// On success entity fields hold the solution; on failure they are
/// restored to the pre-call state and `error` describes the problem.
/// Cooperative cancellation through [`SolveHost::should_cancel`] returns
/// `error = "cancelled"` with entities at the best accepted intermediate
/// state.
pub fn optimize(
    project: &mut Project,
    options: &OptimizeOptions,
    host: &mut dyn SolveHost,
) -> OptimizeResult {
    if !project
        .viewpoints
        .iter()
        .any(|(_, vp)| vp.enabled_in_solve)
    {
        return failure_result("project has no enabled viewpoints".into());
    }
    if project.image_points.is_empty() {
        return failure_result("project has no image points".into());
    }
    if let Err(e) = project.check_consistency() {
        return failure_result(format!("inconsistent project: {e}"));
    }

    let snapshot = project.clone();
    project.reset_optimization_state();
    let baseline = project.clone();

    let rng = SeededRng::new(options.seed);
    let plans = candidates::enumerate_candidates(project, options.max_attempts);
    tracing::debug!(count = plans.len(), "initialization candidates enumerated");

    struct CandidateResult {
        state: Project,
        stats: SolveStats,
        outcome: candidates::InitOutcome,
        median: Option<f64>,
    }
    let mut best: Option<CandidateResult> = None;
    let mut failures: Vec<String> = Vec::new();

    for (index, plan) in plans.iter().enumerate() {
        *project = baseline.clone();
        if options.verbose {
            host.log(&format!("attempt {}: {}", index + 1, plan.description));
        }
        tracing::debug!(attempt = index + 1, description = %plan.description, "trying candidate");

        let mut plan_rng = rng.scoped(index as u64 + 1);
        let outcome = match candidates::apply_plan(
            project,
            plan,
            options.auto_initialize_cameras,
            options.auto_initialize_world_points,
            &mut plan_rng,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                failures.push(format!("{}: {e}", plan.description));
                continue;
            }
        };

        let stats = run_solver_pass(project, options, &mut plan_rng, host);
        let evaluation = evaluate_observations(project);

        if stats.cancelled {
            // leave the best accepted intermediate state in place
            return OptimizeResult {
                converged: false,
                iterations: stats.iterations,
                residual: stats.residual,
                median_reprojection_error: evaluation.median(),
                rms_reprojection_error: evaluation.rms(),
                outliers: Vec::new(),
                cameras_initialized: outcome.cameras_initialized,
                cameras_excluded: outcome.cameras_excluded,
                error: Some("cancelled".into()),
            };
        }
        if let Some(failure) = stats.failure {
            failures.push(format!("{}: {}", plan.description, failure.as_str()));
            continue;
        }

        let median = evaluation.median();
        tracing::debug!(
            attempt = index + 1,
            residual = stats.residual,
            median = ?median,
            behind = evaluation.behind,
            converged = stats.converged,
            "candidate finished"
        );
        if options.verbose {
            host.log(&format!(
                "attempt {} finished: residual {:.6e}, median reprojection {:?}",
                index + 1,
                stats.residual,
                median
            ));
        }

        let better = match &best {
            None => true,
            Some(current) => {
                // converged candidates outrank the rest; ties by median
                let key = |converged: bool, median: Option<f64>| {
                    (converged, median.map(|m| -m))
                };
                key(stats.converged, median) > key(current.stats.converged, current.median)
            }
        };
        if better {
            best = Some(CandidateResult {
                state: project.clone(),
                stats,
                outcome,
                median,
            });
        }
    }

    let Some(mut winner) = best else {
        *project = snapshot;
        let detail = if failures.is_empty() {
            "no initialization candidate produced a usable starting point".to_string()
        } else {
            failures.join("; ")
        };
        return failure_result(detail);
    };

    *project = winner.state;
    let mut total_iterations = winner.stats.iterations;
    let mut outlier_report = Vec::new();

    if options.detect_outliers {
        let evaluation = evaluate_observations(project);
        let selected =
            outlier::select_outliers(&evaluation.observed, options.outlier_threshold_multiplier);
        if !selected.is_empty() {
            outlier_report = outlier::remove_outliers(project, &selected);
            tracing::info!(count = outlier_report.len(), "outlier observations removed");
            if options.verbose {
                host.log(&format!(
                    "removed {} outlier observations, re-solving",
                    outlier_report.len()
                ));
            }
            // one re-solve from the current state, no reinitialization
            let mut rng = SeededRng::new(options.seed).scoped(0xdead);
            let stats = run_solver_pass(project, options, &mut rng, host);
            total_iterations += stats.iterations;
            let cancelled = stats.cancelled;
            winner.stats = stats;
            if cancelled {
                let evaluation = evaluate_observations(project);
                return OptimizeResult {
                    converged: false,
                    iterations: total_iterations,
                    residual: winner.stats.residual,
                    median_reprojection_error: evaluation.median(),
                    rms_reprojection_error: evaluation.rms(),
                    outliers: outlier_report,
                    cameras_initialized: winner.outcome.cameras_initialized,
                    cameras_excluded: winner.outcome.cameras_excluded,
                    error: Some("cancelled".into()),
                };
            }
        }
    }

    let evaluation = evaluate_observations(project);
    let result = OptimizeResult {
        converged: winner.stats.converged,
        iterations: total_iterations,
        residual: winner.stats.residual,
        median_reprojection_error: evaluation.median(),
        rms_reprojection_error: evaluation.rms(),
        outliers: outlier_report,
        cameras_initialized: winner.outcome.cameras_initialized,
        cameras_excluded: winner.outcome.cameras_excluded,
        error: None,
    };
    tracing::info!(
        converged = result.converged,
        iterations = result.iterations,
        residual = result.residual,
        median = ?result.median_reprojection_error,
        "optimization finished"
    );
    result
}
