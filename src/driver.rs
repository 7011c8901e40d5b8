//! Reverse-communication driver.
//!
//! The driver never calls the evaluator itself. It stops at one of two
//! hand-off states, the caller fills `fj` at [`Driver::x`] and calls
//! [`Driver::resume`]. Between hand-offs the driver runs the subproblem,
//! trust-region and convergence logic synchronously.

use faer_core::{Mat, MatRef, Parallelism};

use crate::active_set::{ActiveIndex, ActiveSetParams, ActiveSetSolver, LinearModel, Objective};
use crate::convergence::ConvergenceMonitor;
use crate::linalg::{l2_norm, max_abs};
use crate::problem::{Bound, Problem};
use crate::report::{IterationReport, SolveStatus, SolverStats};
use crate::solver::{EvalOutcome, EvalRequest, JacobianMut, SolverOptions};
use crate::trust_region::TrustRegion;

/// Projection passes allowed before iterating from an infeasible point.
const MAX_PROJECTIONS: usize = 3;

/// Why a solve failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    IterationLimitExceeded,
    NoProgress,
    Infeasible,
    CallerRequestedHalt,
    NumericalFailure,
}

/// Externally observable state of a [`Driver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Fill only the value column at [`Driver::x`].
    NeedResidualsOnly,
    /// Fill values and partials at [`Driver::x`].
    NeedResidualsAndJacobian,
    /// Internal computation; never observed between hand-offs.
    Solving,
    Converged,
    Failed(FailureKind),
}

impl DriverState {
    /// Evaluation the caller owes the driver, if any.
    pub fn request(self) -> Option<EvalRequest> {
        match self {
            Self::NeedResidualsOnly => Some(EvalRequest::Residuals),
            Self::NeedResidualsAndJacobian => Some(EvalRequest::ResidualsAndJacobian),
            Self::Solving | Self::Converged | Self::Failed(_) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::Failed(_))
    }
}

impl From<SolveStatus> for DriverState {
    fn from(status: SolveStatus) -> Self {
        match status {
            SolveStatus::ConvergedResidual
            | SolveStatus::ConvergedSlowProgress
            | SolveStatus::ConvergedStep
            | SolveStatus::ConvergedRankDeficient => Self::Converged,
            SolveStatus::IterationLimitExceeded => {
                Self::Failed(FailureKind::IterationLimitExceeded)
            }
            SolveStatus::NoProgress => Self::Failed(FailureKind::NoProgress),
            SolveStatus::Infeasible => Self::Failed(FailureKind::Infeasible),
            SolveStatus::CallerRequestedHalt => Self::Failed(FailureKind::CallerRequestedHalt),
            SolveStatus::NumericalFailure => Self::Failed(FailureKind::NumericalFailure),
        }
    }
}

/// What the pending evaluation is for.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Linearization at the starting point or after a projection.
    Start,
    /// Residuals at `x_trial`.
    Trial,
    /// Linearization at a freshly accepted point.
    Accepted { prev_fnorm: f64 },
}

#[derive(Debug, Clone, Copy)]
struct Subproblem {
    predicted_norm: f64,
    violation: f64,
    active: usize,
    rank_deficient: bool,
}

/// Buffers owned by a [`crate::Solver`] and lent to each driver.
#[derive(Debug)]
pub(crate) struct Workspace {
    pub(crate) fj: Mat<f64>,
    fj_saved: Mat<f64>,
    x: Vec<f64>,
    x_trial: Vec<f64>,
    step: Vec<f64>,
    var_lower: Vec<f64>,
    var_upper: Vec<f64>,
    step_lower: Vec<f64>,
    step_upper: Vec<f64>,
    cons_lower: Vec<f64>,
    cons_upper: Vec<f64>,
    subproblem: ActiveSetSolver,
    reports: Vec<IterationReport>,
}

impl Workspace {
    pub(crate) fn new(problem: &Problem) -> Self {
        let n = problem.nvars();
        let rows = problem.nrows();
        Self {
            fj: Mat::zeros(rows, n + 1),
            fj_saved: Mat::zeros(rows, n + 1),
            x: vec![0.0; n],
            x_trial: vec![0.0; n],
            step: vec![0.0; n],
            var_lower: problem.variable_bounds().iter().map(Bound::lower).collect(),
            var_upper: problem.variable_bounds().iter().map(Bound::upper).collect(),
            step_lower: vec![0.0; n],
            step_upper: vec![0.0; n],
            cons_lower: problem.constraint_bounds().iter().map(Bound::lower).collect(),
            cons_upper: problem.constraint_bounds().iter().map(Bound::upper).collect(),
            subproblem: ActiveSetSolver::new(problem.mequa(), n, problem.mcon()),
            reports: Vec::new(),
        }
    }
}

fn copy_mat(dst: &mut Mat<f64>, src: &Mat<f64>) {
    for j in 0..src.ncols() {
        for i in 0..src.nrows() {
            dst.write(i, j, src.read(i, j));
        }
    }
}

/// State machine for one solve.
pub struct Driver<'a> {
    problem: &'a Problem,
    ws: &'a mut Workspace,
    options: SolverOptions,
    parallelism: Parallelism,
    active_set: ActiveSetParams,
    trust: TrustRegion,
    monitor: ConvergenceMonitor,
    state: DriverState,
    phase: Phase,
    status: Option<SolveStatus>,
    fnorm: f64,
    violation: f64,
    step_norm: f64,
    predicted_fnorm: f64,
    active: usize,
    iterations: usize,
    rejections: usize,
    projections: usize,
    residual_evaluations: usize,
    jacobian_evaluations: usize,
    rank_deficient_solves: usize,
    last_rank_deficient: bool,
}

impl<'a> Driver<'a> {
    pub(crate) fn new(
        problem: &'a Problem,
        ws: &'a mut Workspace,
        x0: &[f64],
        options: SolverOptions,
        parallelism: Parallelism,
    ) -> Self {
        for (i, bound) in problem.variable_bounds().iter().enumerate() {
            ws.x[i] = bound.clamp(x0[i]);
        }
        ws.reports.clear();

        let radius = options.initial_radius * max_abs(&ws.x).max(1.0);
        let trust = TrustRegion::new(
            radius,
            options.max_radius,
            options.shrink_factor,
            options.grow_factor,
            options.accept_ratio,
            options.expand_ratio,
        );
        let monitor = ConvergenceMonitor::new(
            options.residual_tol,
            options.slow_progress_tol,
            options.slow_progress_iters,
            options.step_tol,
            options.max_iters,
        );
        let active_set = ActiveSetParams {
            max_iters: match options.max_active_set_iters {
                0 => 3 * (problem.nvars() + problem.mcon()) + 20,
                n => n,
            },
            rank_tol: options.rank_tol,
            constraint_weight: options.constraint_weight,
        };

        let mut driver = Self {
            problem,
            ws,
            options,
            parallelism,
            active_set,
            trust,
            monitor,
            state: DriverState::Solving,
            phase: Phase::Start,
            status: None,
            fnorm: f64::INFINITY,
            violation: 0.0,
            step_norm: 0.0,
            predicted_fnorm: f64::INFINITY,
            active: 0,
            iterations: 0,
            rejections: 0,
            projections: 0,
            residual_evaluations: 0,
            jacobian_evaluations: 0,
            rank_deficient_solves: 0,
            last_rank_deficient: false,
        };
        driver.request_linearization();
        driver
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Evaluation the caller owes the driver, if any.
    pub fn request(&self) -> Option<EvalRequest> {
        self.state.request()
    }

    /// Integer status flag: `0` residuals only, `1` residuals and Jacobian,
    /// otherwise the terminal [`SolveStatus::code`].
    pub fn igo(&self) -> i32 {
        match (self.status, self.state) {
            (Some(status), _) => status.code(),
            (None, DriverState::NeedResidualsOnly) => 0,
            (None, _) => 1,
        }
    }

    /// Terminal status, once reached.
    pub fn status(&self) -> Option<SolveStatus> {
        self.status
    }

    /// Point at which the pending evaluation must be done.
    pub fn x(&self) -> &[f64] {
        match self.phase {
            Phase::Trial => &self.ws.x_trial,
            Phase::Start | Phase::Accepted { .. } => &self.ws.x,
        }
    }

    /// Last accepted iterate.
    pub fn solution(&self) -> &[f64] {
        &self.ws.x
    }

    /// Residual norm at the last accepted iterate.
    pub fn fnorm(&self) -> f64 {
        self.fnorm
    }

    pub fn jacobian(&self) -> MatRef<'_, f64> {
        self.ws.fj.as_ref()
    }

    pub fn jacobian_mut(&mut self) -> JacobianMut<'_> {
        JacobianMut::new(&mut self.ws.fj, self.problem.mcon(), self.problem.nvars())
    }

    /// Evaluation point and output view together.
    pub fn evaluation(&mut self) -> (&[f64], JacobianMut<'_>) {
        let (mcon, nvars) = (self.problem.mcon(), self.problem.nvars());
        let ws = &mut *self.ws;
        let x = match self.phase {
            Phase::Trial => &ws.x_trial,
            Phase::Start | Phase::Accepted { .. } => &ws.x,
        };
        (x, JacobianMut::new(&mut ws.fj, mcon, nvars))
    }

    /// Iteration rows produced by the last [`Driver::resume`].
    pub fn reports(&self) -> &[IterationReport] {
        &self.ws.reports
    }

    /// Final statistics, once the driver is terminal.
    pub fn stats(&self) -> Option<SolverStats> {
        let status = self.status?;
        Some(SolverStats {
            status,
            iterations: self.iterations,
            residual_evaluations: self.residual_evaluations,
            jacobian_evaluations: self.jacobian_evaluations,
            fnorm: self.fnorm,
            step_norm: self.step_norm,
            radius: self.trust.radius(),
            constraint_violation: self.violation,
            rank_deficient_solves: self.rank_deficient_solves,
        })
    }

    /// Hand back control after the requested evaluation.
    ///
    /// Calling this in a terminal state has no effect.
    pub fn resume(&mut self, outcome: EvalOutcome) -> DriverState {
        let Some(request) = self.state.request() else {
            return self.state;
        };
        self.ws.reports.clear();
        if request.needs_jacobian() {
            self.jacobian_evaluations += 1;
        } else {
            self.residual_evaluations += 1;
        }
        self.state = DriverState::Solving;

        if outcome == EvalOutcome::Halt {
            if matches!(self.phase, Phase::Trial) {
                copy_mat(&mut self.ws.fj, &self.ws.fj_saved);
            }
            self.terminate(SolveStatus::CallerRequestedHalt);
            return self.state;
        }

        match self.phase {
            Phase::Start => self.after_start(),
            Phase::Trial => self.after_trial(),
            Phase::Accepted { prev_fnorm } => self.after_accept(prev_fnorm),
        }
        self.state
    }

    fn after_start(&mut self) {
        if !self.finite(true) {
            self.terminate(SolveStatus::NumericalFailure);
            return;
        }
        let (fnorm, violation) = self.measure();
        self.fnorm = fnorm;
        self.violation = violation;

        if violation > self.feasibility_tol() && self.projections < MAX_PROJECTIONS {
            self.project();
            return;
        }
        if let Some(status) = self.monitor.check_initial(fnorm) {
            self.terminate(status);
            return;
        }
        self.solve_step();
    }

    /// Moves to the nearest point meeting the linearized constraints.
    fn project(&mut self) {
        self.projections += 1;
        let sub = self.solve_subproblem(Objective::MinimumNorm, false);
        if sub.violation > self.feasibility_tol() {
            log::debug!(
                "constraint rows inconsistent (violation {:.3e})",
                sub.violation
            );
            self.terminate(SolveStatus::Infeasible);
            return;
        }
        let ws = &mut *self.ws;
        for k in 0..ws.x.len() {
            ws.x[k] = (ws.x[k] + ws.step[k]).max(ws.var_lower[k]).min(ws.var_upper[k]);
        }
        log::debug!(
            "projected onto constraints (pass {}, violation {:.3e})",
            self.projections,
            self.violation
        );
        self.phase = Phase::Start;
        self.request_linearization();
    }

    /// Computes a candidate step and asks for residuals at the trial point.
    fn solve_step(&mut self) {
        loop {
            self.state = DriverState::Solving;
            let tol = self.feasibility_tol();
            let mut sub = self.solve_subproblem(Objective::Residuals, true);
            if sub.violation > tol.max(self.violation) {
                // The box cuts off the linearized feasible set: try the step
                // without it and leave the verdict to the ratio test.
                sub = self.solve_subproblem(Objective::Residuals, false);
                if sub.violation > tol {
                    log::debug!(
                        "linearized constraints cannot be met (violation {:.3e})",
                        sub.violation
                    );
                    self.terminate(SolveStatus::Infeasible);
                    return;
                }
            }
            self.last_rank_deficient = sub.rank_deficient;
            if sub.rank_deficient {
                log::warn!(
                    "rank-deficient linear model at iteration {}; using minimum-norm step",
                    self.iterations
                );
            }

            self.step_norm = l2_norm(&self.ws.step);
            self.predicted_fnorm = sub.predicted_norm;
            self.active = sub.active;

            let x_norm = l2_norm(&self.ws.x);
            if !self.trust.is_binding(&self.ws.step)
                && self.monitor.step_is_small(self.step_norm, x_norm)
            {
                self.terminate(SolveStatus::ConvergedStep);
                return;
            }

            if self.fnorm - sub.predicted_norm <= 0.0 {
                // The model predicts no decrease: shrink without evaluating.
                self.trust.update(None);
                self.record(f64::NAN, None, false);
                if self.reject() {
                    return;
                }
                continue;
            }

            let ws = &mut *self.ws;
            for k in 0..ws.x.len() {
                ws.x_trial[k] = (ws.x[k] + ws.step[k])
                    .max(ws.var_lower[k])
                    .min(ws.var_upper[k]);
            }
            copy_mat(&mut ws.fj_saved, &ws.fj);
            self.phase = Phase::Trial;
            self.state = DriverState::NeedResidualsOnly;
            return;
        }
    }

    fn after_trial(&mut self) {
        let finite = self.finite(false);
        let (trial_fnorm, trial_violation) = self.measure();
        let mut ratio = if finite {
            TrustRegion::ratio(self.fnorm - trial_fnorm, self.fnorm - self.predicted_fnorm)
        } else {
            None
        };
        if trial_violation > self.feasibility_tol().max(self.violation) {
            ratio = None;
        }
        let decision = self.trust.update(ratio);
        self.record(trial_fnorm, ratio, decision.accepted());

        if decision.accepted() {
            let prev_fnorm = self.fnorm;
            let ws = &mut *self.ws;
            core::mem::swap(&mut ws.x, &mut ws.x_trial);
            self.fnorm = trial_fnorm;
            self.violation = trial_violation;
            self.iterations += 1;
            self.rejections = 0;
            self.phase = Phase::Accepted { prev_fnorm };
            self.request_linearization();
        } else {
            copy_mat(&mut self.ws.fj, &self.ws.fj_saved);
            if self.reject() {
                return;
            }
            self.solve_step();
        }
    }

    fn after_accept(&mut self, prev_fnorm: f64) {
        if !self.finite(true) {
            self.terminate(SolveStatus::NumericalFailure);
            return;
        }
        let (fnorm, violation) = self.measure();
        self.fnorm = fnorm;
        self.violation = violation;

        let x_norm = l2_norm(&self.ws.x);
        if let Some(status) =
            self.monitor
                .check(prev_fnorm, fnorm, self.step_norm, x_norm, self.iterations)
        {
            self.terminate(status);
            return;
        }
        self.solve_step();
    }

    fn solve_subproblem(&mut self, objective: Objective, boxed: bool) -> Subproblem {
        let ws = &mut *self.ws;
        for k in 0..ws.x.len() {
            ws.step_lower[k] = ws.var_lower[k] - ws.x[k];
            ws.step_upper[k] = ws.var_upper[k] - ws.x[k];
        }
        if boxed {
            self.trust
                .clamp_step_bounds(&mut ws.step_lower, &mut ws.step_upper);
        }
        let model = LinearModel {
            fj: &ws.fj,
            mcon: self.problem.mcon(),
            mequa: self.problem.mequa(),
            nvars: self.problem.nvars(),
            objective,
            step_lower: &ws.step_lower,
            step_upper: &ws.step_upper,
            constraint_lower: &ws.cons_lower,
            constraint_upper: &ws.cons_upper,
        };
        let sol = ws.subproblem.solve(&model, &self.active_set, self.parallelism);
        ws.step.copy_from_slice(sol.step);
        if sol.rank_deficient {
            self.rank_deficient_solves += 1;
        }
        log::debug!(
            "subproblem: {} active, model norm {:.4e}, violation {:.3e}, {} iterations{}",
            sol.active.len(),
            sol.predicted_norm,
            sol.constraint_violation,
            sol.iterations,
            if sol.capped { " (capped)" } else { "" }
        );
        for index in sol.active {
            match *index {
                ActiveIndex::Variable(i, side) => {
                    log::trace!("variable {i} held at {side:?} bound")
                }
                ActiveIndex::Constraint(j, side) => {
                    log::trace!("constraint row {j} held at {side:?} bound")
                }
            }
        }
        Subproblem {
            predicted_norm: sol.predicted_norm,
            violation: sol.constraint_violation,
            active: sol.active.len(),
            rank_deficient: sol.rank_deficient,
        }
    }

    /// Counts a rejected step; true when the solve has been terminated.
    fn reject(&mut self) -> bool {
        self.rejections += 1;
        if self.rejections > self.options.max_rejections
            || self.trust.radius() < self.options.min_radius
        {
            self.terminate(SolveStatus::NoProgress);
            return true;
        }
        false
    }

    fn record(&mut self, trial_fnorm: f64, ratio: Option<f64>, accepted: bool) {
        self.ws.reports.push(IterationReport {
            iteration: self.iterations,
            fnorm: self.fnorm,
            trial_fnorm,
            predicted_fnorm: self.predicted_fnorm,
            ratio: ratio.unwrap_or(f64::NAN),
            radius: self.trust.radius(),
            step_norm: self.step_norm,
            active: self.active,
            accepted,
        });
    }

    fn request_linearization(&mut self) {
        let fj = &mut self.ws.fj;
        for j in 0..fj.ncols() {
            for i in 0..fj.nrows() {
                fj.write(i, j, 0.0);
            }
        }
        self.state = DriverState::NeedResidualsAndJacobian;
    }

    fn terminate(&mut self, status: SolveStatus) {
        log::debug!(
            "terminated with {status:?} after {} iterations (fnorm {:.4e})",
            self.iterations,
            self.fnorm
        );
        let status = if status.is_converged() && self.last_rank_deficient {
            SolveStatus::ConvergedRankDeficient
        } else {
            status
        };
        self.status = Some(status);
        self.state = status.into();
    }

    /// Residual norm and worst constraint violation from the value column.
    fn measure(&self) -> (f64, f64) {
        let fj = &self.ws.fj;
        let mcon = self.problem.mcon();
        let n = self.problem.nvars();
        let mut sum = 0.0;
        for i in 0..self.problem.mequa() {
            let r = fj.read(mcon + i, n);
            sum += r * r;
        }
        let mut violation = 0.0_f64;
        for (j, bound) in self.problem.constraint_bounds().iter().enumerate() {
            violation = violation.max(bound.violation(fj.read(j, n)));
        }
        (sum.sqrt(), violation)
    }

    fn finite(&self, with_partials: bool) -> bool {
        let fj = &self.ws.fj;
        let n = self.problem.nvars();
        let first = if with_partials { 0 } else { n };
        (first..=n).all(|j| (0..fj.nrows()).all(|i| fj.read(i, j).is_finite()))
    }

    fn feasibility_tol(&self) -> f64 {
        self.options.feasibility_tol * (1.0 + max_abs(&self.ws.x))
    }
}
