use crate::report::SolveStatus;

/// Termination tests run after every accepted step.
///
/// All tests are evaluated; the first satisfied one in the order residual
/// norm, slow progress, step size, iteration limit decides the status.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    residual_tol: f64,
    slow_progress_tol: f64,
    slow_progress_iters: usize,
    step_tol: f64,
    max_iters: usize,
    slow_count: usize,
}

impl ConvergenceMonitor {
    pub fn new(
        residual_tol: f64,
        slow_progress_tol: f64,
        slow_progress_iters: usize,
        step_tol: f64,
        max_iters: usize,
    ) -> Self {
        Self {
            residual_tol,
            slow_progress_tol,
            slow_progress_iters,
            step_tol,
            max_iters,
            slow_count: 0,
        }
    }

    /// Residual test alone, used before the first step.
    pub fn check_initial(&self, fnorm: f64) -> Option<SolveStatus> {
        if fnorm <= self.residual_tol {
            Some(SolveStatus::ConvergedResidual)
        } else if self.max_iters == 0 {
            Some(SolveStatus::IterationLimitExceeded)
        } else {
            None
        }
    }

    /// Whether a step is small enough to call the iterate stationary.
    pub fn step_is_small(&self, step_norm: f64, x_norm: f64) -> bool {
        step_norm <= self.step_tol * (x_norm + self.step_tol)
    }

    /// Runs the tests after an accepted step from `prev_fnorm` to `fnorm`.
    pub fn check(
        &mut self,
        prev_fnorm: f64,
        fnorm: f64,
        step_norm: f64,
        x_norm: f64,
        iterations: usize,
    ) -> Option<SolveStatus> {
        let relative = if prev_fnorm > 0.0 {
            (prev_fnorm - fnorm) / prev_fnorm
        } else {
            0.0
        };
        if relative <= self.slow_progress_tol {
            self.slow_count += 1;
        } else {
            self.slow_count = 0;
        }

        let tests = [
            (fnorm <= self.residual_tol, SolveStatus::ConvergedResidual),
            (
                self.slow_count >= self.slow_progress_iters,
                SolveStatus::ConvergedSlowProgress,
            ),
            (
                self.step_is_small(step_norm, x_norm),
                SolveStatus::ConvergedStep,
            ),
            (
                iterations >= self.max_iters,
                SolveStatus::IterationLimitExceeded,
            ),
        ];
        tests
            .iter()
            .find(|(hit, _)| *hit)
            .map(|&(_, status)| status)
    }
}
