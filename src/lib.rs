//! Bounded, linearly constrained nonlinear least squares with a box trust region.
//!
//! This crate minimizes `||f(x)||_2` over `x` subject to simple bounds on each
//! variable and to bounds on the values of constraint rows `c(x)`. Each
//! iteration linearizes `f` and `c`, solves a bounded linear least-squares
//! subproblem with an active-set method, and accepts or rejects the step by
//! comparing the actual and the predicted decrease.
//!
//! How it works (high level):
//! - Clamp `x0` into the variable bounds and, if the constraint rows are
//!   violated, project onto their linearization.
//! - Solve `min ||f + J p||` with `lo - x <= p <= hi - x`, `|p_i| <= radius`
//!   and the linearized constraint bounds.
//! - Grow or shrink the radius from the ratio of actual to predicted decrease.
//!
//! Calling it:
//! - Describe dimensions and bounds with a `Problem`.
//! - Either implement `Evaluator` (or pass a closure) and call `Solver::solve`,
//!   or drive the reverse-communication loop yourself with `Solver::start`.
//!
//! Example:
//! ```rust,no_run
//! use bcnls_rs::{Bound, EvalOutcome, EvalRequest, JacobianMut, Problem, Solver, SolverOptions};
//! use faer_core::Parallelism;
//!
//! let problem = Problem::new(1, vec![Bound::Both(0.0, 3.0)], Vec::new()).unwrap();
//! let mut solver = Solver::new(problem, Parallelism::None);
//! let mut eval = |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
//!     fj.set_residual(0, x[0] - 5.0);
//!     fj.set_partial(0, 0, 1.0);
//!     EvalOutcome::Continue
//! };
//! let mut x = vec![0.0];
//! let stats = solver.solve(&mut eval, &mut x, &SolverOptions::default(), None).unwrap();
//! assert!(stats.status.is_converged());
//!
//! // The same solve, driven by hand.
//! let options = SolverOptions::default();
//! let mut driver = solver.start(&[0.0], &options).unwrap();
//! while let Some(request) = driver.request() {
//!     let (x, mut fj) = driver.evaluation();
//!     fj.set_residual(0, x[0] - 5.0);
//!     if request.needs_jacobian() {
//!         fj.set_partial(0, 0, 1.0);
//!     }
//!     driver.resume(EvalOutcome::Continue);
//! }
//! assert_eq!(driver.solution(), &[3.0]);
//! ```

mod active_set;
mod convergence;
mod driver;
mod linalg;
mod problem;
mod report;
mod solver;
mod trust_region;

pub use convergence::ConvergenceMonitor;
pub use driver::{Driver, DriverState, FailureKind};
pub use problem::{Bound, BoundKind, BoundTarget, Problem, ProblemError};
pub use report::{IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter};
pub use solver::{
    EvalOutcome, EvalRequest, Evaluator, JacobianMut, OptionsError, SolveError, Solver,
    SolverOptions,
};
pub use trust_region::{StepDecision, TrustRegion};
