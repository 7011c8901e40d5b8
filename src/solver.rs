use core::fmt;

use faer_core::{Mat, MatMut, MatRef, Parallelism};
use std::time::{Duration, Instant};

use crate::driver::{Driver, Workspace};
use crate::problem::Problem;
use crate::report::{emit_line, Reporter, SolverStats, StdoutReporter};

/// Invalid tuning values rejected by [`SolverOptions::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum OptionsError {
    /// A tolerance, factor or radius is NaN or outside its admissible range.
    InvalidValue { name: &'static str, value: f64 },
    /// `accept_ratio <= expand_ratio` does not hold.
    InvalidRatios { accept: f64, expand: f64 },
    /// `slow_progress_iters` must be at least one.
    ZeroSlowProgressIters,
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { name, value } => write!(f, "invalid value for {name}: {value}"),
            Self::InvalidRatios { accept, expand } => {
                write!(f, "accept_ratio {accept} exceeds expand_ratio {expand}")
            }
            Self::ZeroSlowProgressIters => write!(f, "slow_progress_iters must be positive"),
        }
    }
}

impl std::error::Error for OptionsError {}

/// Errors specific to a solve call.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveError {
    /// The provided x has the wrong length.
    DimensionMismatch { expected: usize, actual: usize },
    /// The options failed validation.
    InvalidOptions(OptionsError),
    /// `x0[index]` is NaN or infinite.
    NonFiniteStart { index: usize },
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "x length {actual} does not match expected {expected}")
            }
            Self::InvalidOptions(err) => write!(f, "invalid options: {err}"),
            Self::NonFiniteStart { index } => {
                write!(f, "starting point entry {index} is not finite")
            }
        }
    }
}

impl std::error::Error for SolveError {}

impl From<OptionsError> for SolveError {
    fn from(err: OptionsError) -> Self {
        Self::InvalidOptions(err)
    }
}

/// Options controlling the solve.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Maximum number of accepted steps.
    pub max_iters: usize,
    /// Converge when ||f|| <= residual_tol.
    pub residual_tol: f64,
    /// Converge when the relative decrease of ||f|| stays below this value...
    pub slow_progress_tol: f64,
    /// ...for this many consecutive accepted steps.
    pub slow_progress_iters: usize,
    /// Converge when ||p||_2 <= step_tol * (||x||_2 + step_tol).
    pub step_tol: f64,
    /// Constraint rows may miss their bounds by feasibility_tol * (1 + ||x||_inf).
    pub feasibility_tol: f64,
    /// Initial trust-region radius, in units of max(1, ||x0||_inf).
    pub initial_radius: f64,
    /// Radius below which the solve reports `NoProgress`.
    pub min_radius: f64,
    /// Upper cap for the radius.
    pub max_radius: f64,
    /// Radius multiplier after a rejected step.
    pub shrink_factor: f64,
    /// Radius multiplier after a very successful step.
    pub grow_factor: f64,
    /// Accept a step when actual/predicted reduction >= accept_ratio.
    pub accept_ratio: f64,
    /// Grow the radius when actual/predicted reduction >= expand_ratio.
    pub expand_ratio: f64,
    /// Consecutive rejected steps before reporting `NoProgress`.
    pub max_rejections: usize,
    /// Active-set iteration cap per subproblem; 0 selects 3 * (nvars + mcon) + 20.
    pub max_active_set_iters: usize,
    /// Singular values below `rank_tol * s_max` are treated as zero.
    pub rank_tol: f64,
    /// Weight of constraint rows relative to the equation rows.
    pub constraint_weight: f64,
    /// Emit per-iteration diagnostics to stdout by default.
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iters: 75,
            residual_tol: 1e-10,
            slow_progress_tol: 1e-8,
            slow_progress_iters: 3,
            step_tol: 1e-10,
            feasibility_tol: 1e-8,
            initial_radius: 1.0,
            min_radius: 1e-12,
            max_radius: 1e10,
            shrink_factor: 0.5,
            grow_factor: 2.0,
            accept_ratio: 0.25,
            expand_ratio: 0.75,
            max_rejections: 40,
            max_active_set_iters: 0,
            rank_tol: 1e-13,
            constraint_weight: 1e6,
            verbose: false,
        }
    }
}

impl SolverOptions {
    /// Checks every value against its admissible range.
    pub fn validate(&self) -> Result<(), OptionsError> {
        fn check(name: &'static str, value: f64, ok: bool) -> Result<(), OptionsError> {
            if ok && !value.is_nan() {
                Ok(())
            } else {
                Err(OptionsError::InvalidValue { name, value })
            }
        }

        check("residual_tol", self.residual_tol, self.residual_tol >= 0.0)?;
        check(
            "slow_progress_tol",
            self.slow_progress_tol,
            self.slow_progress_tol.is_finite(),
        )?;
        check("step_tol", self.step_tol, self.step_tol >= 0.0)?;
        check(
            "feasibility_tol",
            self.feasibility_tol,
            self.feasibility_tol >= 0.0,
        )?;
        check(
            "initial_radius",
            self.initial_radius,
            self.initial_radius > 0.0 && self.initial_radius.is_finite(),
        )?;
        check("min_radius", self.min_radius, self.min_radius >= 0.0)?;
        check(
            "max_radius",
            self.max_radius,
            self.max_radius > 0.0 && self.max_radius >= self.min_radius,
        )?;
        check(
            "shrink_factor",
            self.shrink_factor,
            self.shrink_factor > 0.0 && self.shrink_factor < 1.0,
        )?;
        check(
            "grow_factor",
            self.grow_factor,
            self.grow_factor >= 1.0 && self.grow_factor.is_finite(),
        )?;
        check("accept_ratio", self.accept_ratio, self.accept_ratio > 0.0)?;
        check("expand_ratio", self.expand_ratio, self.expand_ratio.is_finite())?;
        if self.accept_ratio > self.expand_ratio {
            return Err(OptionsError::InvalidRatios {
                accept: self.accept_ratio,
                expand: self.expand_ratio,
            });
        }
        check(
            "rank_tol",
            self.rank_tol,
            self.rank_tol >= 0.0 && self.rank_tol < 1.0,
        )?;
        check(
            "constraint_weight",
            self.constraint_weight,
            self.constraint_weight > 0.0 && self.constraint_weight.is_finite(),
        )?;
        if self.slow_progress_iters == 0 {
            return Err(OptionsError::ZeroSlowProgressIters);
        }
        Ok(())
    }
}

/// What the evaluator must compute at the requested point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalRequest {
    /// Only the value column (residuals and constraint values).
    Residuals,
    /// Values and all partial derivatives.
    ResidualsAndJacobian,
}

impl EvalRequest {
    pub fn needs_jacobian(self) -> bool {
        matches!(self, Self::ResidualsAndJacobian)
    }
}

/// Evaluator verdict handed back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    Continue,
    /// Stop the solve; reported as `CallerRequestedHalt`.
    Halt,
}

/// Computes constraint values, residuals and their partials.
pub trait Evaluator {
    /// Fill `fj` at `x` as requested.
    fn evaluate(
        &mut self,
        x: &[f64],
        fj: &mut JacobianMut<'_>,
        request: EvalRequest,
    ) -> EvalOutcome;
}

impl<F> Evaluator for F
where
    F: FnMut(&[f64], &mut JacobianMut<'_>, EvalRequest) -> EvalOutcome,
{
    fn evaluate(
        &mut self,
        x: &[f64],
        fj: &mut JacobianMut<'_>,
        request: EvalRequest,
    ) -> EvalOutcome {
        self(x, fj, request)
    }
}

/// Mutable view of the `(mcon + mequa) x (nvars + 1)` evaluation matrix.
///
/// Constraint rows come first; the last column holds the function values.
pub struct JacobianMut<'a> {
    fj: &'a mut Mat<f64>,
    mcon: usize,
    nvars: usize,
}

impl<'a> JacobianMut<'a> {
    pub(crate) fn new(fj: &'a mut Mat<f64>, mcon: usize, nvars: usize) -> Self {
        Self { fj, mcon, nvars }
    }

    /// Number of constraint plus equation rows.
    pub fn nrows(&self) -> usize {
        self.fj.nrows()
    }

    /// Number of unknowns (columns before the value column).
    pub fn nvars(&self) -> usize {
        self.nvars
    }

    pub fn mcon(&self) -> usize {
        self.mcon
    }

    pub fn mequa(&self) -> usize {
        self.fj.nrows() - self.mcon
    }

    /// Raw entry access; column `nvars` is the value column.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.fj.read(row, col)
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.fj.write(row, col, value);
    }

    /// Residual of equation `i`.
    pub fn set_residual(&mut self, i: usize, value: f64) {
        self.fj.write(self.mcon + i, self.nvars, value);
    }

    /// Partial of equation `i` with respect to variable `col`.
    pub fn set_partial(&mut self, i: usize, col: usize, value: f64) {
        self.fj.write(self.mcon + i, col, value);
    }

    /// Value of constraint row `j`.
    pub fn set_constraint(&mut self, j: usize, value: f64) {
        self.fj.write(j, self.nvars, value);
    }

    /// Partial of constraint row `j` with respect to variable `col`.
    pub fn set_constraint_partial(&mut self, j: usize, col: usize, value: f64) {
        self.fj.write(j, col, value);
    }

    pub fn as_mat_mut(&mut self) -> MatMut<'_, f64> {
        self.fj.as_mut()
    }
}

/// Bounded, linearly constrained nonlinear least-squares solver.
///
/// Buffers are sized from the problem at construction and reused across
/// solves.
pub struct Solver {
    problem: Problem,
    parallelism: Parallelism,
    workspace: Workspace,
}

enum ReporterSlot<'a> {
    External(&'a mut dyn Reporter),
    Local(StdoutReporter),
    None,
}

impl<'a> ReporterSlot<'a> {
    fn new(reporter: Option<&'a mut dyn Reporter>, verbose: bool) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose => Self::Local(StdoutReporter::new()),
            None => Self::None,
        }
    }

    fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(*r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

impl Solver {
    /// Create a solver for the given problem and parallelism mode.
    pub fn new(problem: Problem, parallelism: Parallelism) -> Self {
        let workspace = Workspace::new(&problem);
        Self {
            problem,
            parallelism,
            workspace,
        }
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    /// Constraint rows and equations with partials at the last iterate.
    pub fn jacobian(&self) -> MatRef<'_, f64> {
        self.workspace.fj.as_ref()
    }

    /// Begin a reverse-communication solve from `x0`.
    pub fn start(
        &mut self,
        x0: &[f64],
        options: &SolverOptions,
    ) -> Result<Driver<'_>, SolveError> {
        let n = self.problem.nvars();
        if x0.len() != n {
            return Err(SolveError::DimensionMismatch {
                expected: n,
                actual: x0.len(),
            });
        }
        if let Some(index) = x0.iter().position(|v| !v.is_finite()) {
            return Err(SolveError::NonFiniteStart { index });
        }
        options.validate()?;
        Ok(Driver::new(
            &self.problem,
            &mut self.workspace,
            x0,
            options.clone(),
            self.parallelism,
        ))
    }

    /// Solve for x in-place, calling `evaluator` whenever the driver needs
    /// new values.
    pub fn solve(
        &mut self,
        evaluator: &mut impl Evaluator,
        x: &mut [f64],
        options: &SolverOptions,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolverStats, SolveError> {
        let start_time = options.verbose.then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, options.verbose);

        let mut driver = self.start(x, options)?;
        let stats = loop {
            if let Some(stats) = driver.stats() {
                break stats;
            }
            let request = driver
                .request()
                .unwrap_or(EvalRequest::ResidualsAndJacobian);
            let outcome = {
                let (point, mut fj) = driver.evaluation();
                evaluator.evaluate(point, &mut fj, request)
            };
            driver.resume(outcome);
            if let Some(reporter) = reporter.as_mut() {
                for report in driver.reports() {
                    reporter.on_iteration(report);
                }
            }
        };
        x.copy_from_slice(driver.solution());
        Ok(finish_stats(stats, start_time, &mut reporter))
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

fn finish_stats(
    stats: SolverStats,
    start_time: Option<Instant>,
    reporter: &mut ReporterSlot<'_>,
) -> SolverStats {
    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish(&stats);
    }
    if let Some(start) = start_time {
        let elapsed = format_duration(start.elapsed());
        emit_line(&format!("time: {elapsed}"));
    }
    stats
}
