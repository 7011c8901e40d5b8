use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use bcnls_rs::{
    Bound, DriverState, EvalOutcome, EvalRequest, FailureKind, IterationReport, JacobianMut,
    Problem, Reporter, SolveError, SolveStatus, Solver, SolverOptions, SolverStats,
};
use faer_core::Parallelism;

struct CountingAlloc;

static ALLOC_TOTAL: AtomicUsize = AtomicUsize::new(0);

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            ALLOC_TOTAL.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            ALLOC_TOTAL.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            System.dealloc(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            ALLOC_TOTAL.fetch_add(new_size, Ordering::Relaxed);
        }
        new_ptr
    }
}

fn reset_alloc_counter() {
    ALLOC_TOTAL.store(0, Ordering::SeqCst);
}

fn allocated_bytes() -> usize {
    ALLOC_TOTAL.load(Ordering::SeqCst)
}

#[derive(Default)]
struct Recorder {
    rows: Vec<IterationReport>,
    finished: Option<SolveStatus>,
}

impl Reporter for Recorder {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self, stats: &SolverStats) {
        self.finished = Some(stats.status);
    }
}

fn solver_options() -> SolverOptions {
    SolverOptions {
        max_iters: 200,
        verbose: false,
        ..SolverOptions::default()
    }
}

fn assert_converged(status: SolveStatus) {
    assert!(status.is_converged(), "unexpected status: {status:?}");
}

fn solve_problem<F>(
    problem: Problem,
    x0: Vec<f64>,
    options: &SolverOptions,
    mut eval: F,
) -> (Vec<f64>, SolverStats)
where
    F: FnMut(&[f64], &mut JacobianMut<'_>, EvalRequest) -> EvalOutcome,
{
    let mut solver = Solver::new(problem, Parallelism::None);
    let mut x = x0;
    let stats = solver.solve(&mut eval, &mut x, options, None).unwrap();
    (x, stats)
}

fn linear_shift(target: f64) -> impl FnMut(&[f64], &mut JacobianMut<'_>, EvalRequest) -> EvalOutcome {
    move |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
        fj.set_residual(0, x[0] - target);
        fj.set_partial(0, 0, 1.0);
        EvalOutcome::Continue
    }
}

#[test]
fn interior_minimum() {
    let problem = Problem::new(1, vec![Bound::Both(0.0, 10.0)], Vec::new()).unwrap();
    let (x, stats) = solve_problem(problem, vec![0.0], &solver_options(), linear_shift(5.0));
    assert_converged(stats.status);
    assert!((x[0] - 5.0).abs() <= 1e-8);
    assert!(stats.fnorm <= 1e-8);
}

#[test]
fn minimum_on_upper_bound() {
    let problem = Problem::new(1, vec![Bound::Both(0.0, 3.0)], Vec::new()).unwrap();
    let (x, stats) = solve_problem(problem, vec![0.0], &solver_options(), linear_shift(5.0));
    assert_converged(stats.status);
    assert!((x[0] - 3.0).abs() <= 1e-12);
    assert!((stats.fnorm - 2.0).abs() <= 1e-12);
}

#[test]
fn linear_equality_constraint() {
    let problem = Problem::new(
        2,
        vec![Bound::Unbounded, Bound::Unbounded],
        vec![Bound::Fixed(1.0)],
    )
    .unwrap();
    let (x, stats) = solve_problem(
        problem,
        vec![0.0, 0.0],
        &solver_options(),
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            fj.set_constraint(0, x[0] + x[1]);
            fj.set_constraint_partial(0, 0, 1.0);
            fj.set_constraint_partial(0, 1, 1.0);
            fj.set_residual(0, x[0] - 1.0);
            fj.set_residual(1, x[1] - 1.0);
            fj.set_partial(0, 0, 1.0);
            fj.set_partial(1, 1, 1.0);
            EvalOutcome::Continue
        },
    );
    assert_converged(stats.status);
    assert!((x[0] - 0.5).abs() <= 1e-6);
    assert!((x[1] - 0.5).abs() <= 1e-6);
    assert!(stats.constraint_violation <= 1e-8);
}

#[test]
fn bounds_exclude_positive_root() {
    let problem = Problem::new(1, vec![Bound::Both(-10.0, -0.5)], Vec::new()).unwrap();
    let mut largest = f64::NEG_INFINITY;
    let (x, stats) = solve_problem(
        problem,
        vec![-5.0],
        &solver_options(),
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            largest = largest.max(x[0]);
            fj.set_residual(0, x[0] * x[0] - 1.0);
            fj.set_partial(0, 0, 2.0 * x[0]);
            EvalOutcome::Continue
        },
    );
    assert_converged(stats.status);
    assert!((x[0] + 1.0).abs() <= 1e-6);
    assert!(largest <= -0.5);
}

#[test]
fn inconsistent_constraints_are_infeasible() {
    let problem = Problem::new(
        1,
        vec![Bound::Unbounded],
        vec![Bound::Fixed(0.0), Bound::Fixed(1.0)],
    )
    .unwrap();
    let (_x, stats) = solve_problem(
        problem,
        vec![0.0],
        &solver_options(),
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            fj.set_constraint(0, x[0]);
            fj.set_constraint_partial(0, 0, 1.0);
            fj.set_constraint(1, x[0]);
            fj.set_constraint_partial(1, 0, 1.0);
            fj.set_residual(0, x[0] - 0.5);
            fj.set_partial(0, 0, 1.0);
            EvalOutcome::Continue
        },
    );
    assert_eq!(stats.status, SolveStatus::Infeasible);
    assert!(!stats.status.is_converged());
    assert_eq!(stats.iterations, 0);
}

fn mild_system(x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest) -> EvalOutcome {
    fj.set_residual(0, x[0] + 0.1 * x[1] * x[1] - 1.0);
    fj.set_residual(1, x[1] + 0.1 * x[0] * x[0] - 2.0);
    fj.set_partial(0, 0, 1.0);
    fj.set_partial(0, 1, 0.2 * x[1]);
    fj.set_partial(1, 0, 0.2 * x[0]);
    fj.set_partial(1, 1, 1.0);
    EvalOutcome::Continue
}

#[test]
fn matches_gauss_newton_without_active_constraints() {
    let problem = Problem::unconstrained(2, 2).unwrap();
    let mut solver = Solver::new(problem, Parallelism::None);
    let options = SolverOptions {
        initial_radius: 1e3,
        ..solver_options()
    };
    let mut recorder = Recorder::default();
    let mut x = vec![0.0, 0.0];
    let stats = solver
        .solve(
            &mut mild_system,
            &mut x,
            &options,
            Some(&mut recorder as &mut dyn Reporter),
        )
        .unwrap();
    assert_converged(stats.status);
    assert_eq!(recorder.finished, Some(stats.status));
    assert!(recorder.rows.iter().all(|row| row.accepted));

    // Plain Gauss-Newton (Newton for a square system) on the same residuals.
    let mut g = [0.0_f64, 0.0];
    for row in &recorder.rows {
        let r0 = g[0] + 0.1 * g[1] * g[1] - 1.0;
        let r1 = g[1] + 0.1 * g[0] * g[0] - 2.0;
        let (a, b, c, d) = (1.0, 0.2 * g[1], 0.2 * g[0], 1.0);
        let det = a * d - b * c;
        g[0] -= (d * r0 - b * r1) / det;
        g[1] -= (a * r1 - c * r0) / det;
        let r0 = g[0] + 0.1 * g[1] * g[1] - 1.0;
        let r1 = g[1] + 0.1 * g[0] * g[0] - 2.0;
        let fnorm = (r0 * r0 + r1 * r1).sqrt();
        assert!(
            (row.trial_fnorm - fnorm).abs() <= 1e-9,
            "iteration {}: {} vs {}",
            row.iteration,
            row.trial_fnorm,
            fnorm
        );
    }
    assert!((x[0] - g[0]).abs() <= 1e-9);
    assert!((x[1] - g[1]).abs() <= 1e-9);
}

fn rosenbrock(x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest) -> EvalOutcome {
    fj.set_constraint(0, x[0] + x[1]);
    fj.set_constraint_partial(0, 0, 1.0);
    fj.set_constraint_partial(0, 1, 1.0);
    fj.set_residual(0, 1.0 - x[0]);
    fj.set_residual(1, 10.0 * (x[1] - x[0] * x[0]));
    fj.set_partial(0, 0, -1.0);
    fj.set_partial(1, 0, -20.0 * x[0]);
    fj.set_partial(1, 1, 10.0);
    EvalOutcome::Continue
}

fn bounded_rosenbrock() -> Problem {
    Problem::new(
        2,
        vec![Bound::Both(-1.5, 0.8), Bound::Both(-0.5, 2.0)],
        vec![Bound::Upper(1.5)],
    )
    .unwrap()
}

#[test]
fn iterates_stay_feasible() {
    let problem = bounded_rosenbrock();
    let bounds = problem.variable_bounds().to_vec();
    let mut solver = Solver::new(problem, Parallelism::None);
    let options = solver_options();
    let mut driver = solver.start(&[-1.2, 1.0], &options).unwrap();

    let mut accepted = 0;
    let mut last_fnorm = f64::INFINITY;
    while let Some(request) = driver.request() {
        for (xi, bound) in driver.x().iter().zip(&bounds) {
            assert!(*xi >= bound.lower() && *xi <= bound.upper());
        }
        let outcome = {
            let (x, mut fj) = driver.evaluation();
            rosenbrock(x, &mut fj, request)
        };
        let state = driver.resume(outcome);
        let iterations = driver.reports().iter().filter(|r| r.accepted).count();
        if iterations > 0 {
            accepted += iterations;
            let x = driver.solution();
            assert!(x[0] + x[1] <= 1.5 + 1e-7, "constraint violated at {x:?}");
            assert!(driver.fnorm() < last_fnorm);
            last_fnorm = driver.fnorm();
            assert_eq!(state, DriverState::NeedResidualsAndJacobian);
        }
    }

    let stats = driver.stats().unwrap();
    assert_converged(stats.status);
    assert_eq!(stats.iterations, accepted);
    let x = driver.solution();
    assert!((x[0] - 0.8).abs() <= 1e-6);
    assert!((x[1] - 0.64).abs() <= 1e-5);
}

#[test]
fn resolving_from_solution_is_stationary() {
    let options = solver_options();
    let (x, stats) = solve_problem(bounded_rosenbrock(), vec![-1.2, 1.0], &options, rosenbrock);
    assert_converged(stats.status);

    let (x2, stats2) = solve_problem(bounded_rosenbrock(), x.clone(), &options, rosenbrock);
    assert_converged(stats2.status);
    assert!(stats2.iterations <= 1);
    assert!((x2[0] - x[0]).abs() <= 1e-8);
    assert!((x2[1] - x[1]).abs() <= 1e-8);
}

#[test]
fn accepted_steps_decrease_residual() {
    let problem = Problem::unconstrained(2, 2).unwrap();
    let mut solver = Solver::new(problem, Parallelism::None);
    let mut recorder = Recorder::default();
    let mut x = vec![-1.2, 1.0];
    let stats = solver
        .solve(
            &mut |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
                fj.set_residual(0, 1.0 - x[0]);
                fj.set_residual(1, 10.0 * (x[1] - x[0] * x[0]));
                fj.set_partial(0, 0, -1.0);
                fj.set_partial(1, 0, -20.0 * x[0]);
                fj.set_partial(1, 1, 10.0);
                EvalOutcome::Continue
            },
            &mut x,
            &solver_options(),
            Some(&mut recorder as &mut dyn Reporter),
        )
        .unwrap();
    assert_converged(stats.status);
    assert!((x[0] - 1.0).abs() <= 1e-5);
    assert!((x[1] - 1.0).abs() <= 1e-5);

    for row in recorder.rows.iter().filter(|row| row.accepted) {
        assert!(row.trial_fnorm < row.fnorm);
    }
    for row in recorder.rows.iter().filter(|row| !row.accepted) {
        assert!(row.radius > 0.0);
    }
}

#[test]
fn halt_keeps_last_accepted_point() {
    let problem = Problem::new(1, vec![Bound::Both(0.0, 10.0)], Vec::new()).unwrap();
    let mut calls = 0;
    let mut seen = Vec::new();
    let (x, stats) = solve_problem(
        problem,
        vec![0.0],
        &solver_options(),
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            calls += 1;
            seen.push(x[0]);
            if calls == 4 {
                return EvalOutcome::Halt;
            }
            fj.set_residual(0, x[0] - 5.0);
            fj.set_partial(0, 0, 1.0);
            EvalOutcome::Continue
        },
    );
    assert_eq!(stats.status, SolveStatus::CallerRequestedHalt);
    assert_eq!(stats.status.code(), 8);
    // Calls: start, trial, relinearize at the trial, halted trial.
    assert_eq!(seen.len(), 4);
    assert_eq!(x[0], seen[2]);
    assert_ne!(x[0], seen[3]);
}

#[test]
fn non_finite_trial_is_rejected() {
    let problem = Problem::unconstrained(1, 1).unwrap();
    let options = SolverOptions {
        initial_radius: 100.0,
        ..solver_options()
    };
    let mut solver = Solver::new(problem, Parallelism::None);
    let mut recorder = Recorder::default();
    let mut x = vec![0.5];
    let stats = solver
        .solve(
            &mut |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
                let value = if x[0] > 2.5 {
                    f64::NAN
                } else {
                    x[0] * x[0] * x[0] - 8.0
                };
                fj.set_residual(0, value);
                fj.set_partial(0, 0, 3.0 * x[0] * x[0]);
                EvalOutcome::Continue
            },
            &mut x,
            &options,
            Some(&mut recorder as &mut dyn Reporter),
        )
        .unwrap();
    assert_converged(stats.status);
    assert!((x[0] - 2.0).abs() <= 1e-8);
    assert!(recorder
        .rows
        .iter()
        .any(|row| !row.accepted && row.trial_fnorm.is_nan()));
}

#[test]
fn non_finite_residual_at_start_is_numerical_failure() {
    let problem = Problem::unconstrained(1, 1).unwrap();
    let (_x, stats) = solve_problem(
        problem,
        vec![0.0],
        &solver_options(),
        |_x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            fj.set_residual(0, f64::INFINITY);
            EvalOutcome::Continue
        },
    );
    assert_eq!(stats.status, SolveStatus::NumericalFailure);
}

#[test]
fn non_finite_start_is_rejected() {
    let mut solver = Solver::new(Problem::unconstrained(1, 2).unwrap(), Parallelism::None);
    let mut x = vec![1.0, f64::NAN];
    let err = solver
        .solve(&mut linear_shift(5.0), &mut x, &solver_options(), None)
        .unwrap_err();
    assert_eq!(err, SolveError::NonFiniteStart { index: 1 });
    assert_eq!(x[0], 1.0);
    assert!(x[1].is_nan());
}

#[test]
fn iteration_limit_keeps_best_iterate() {
    let problem = Problem::unconstrained(2, 2).unwrap();
    let options = SolverOptions {
        max_iters: 2,
        ..solver_options()
    };
    let x0 = vec![-1.2, 1.0];
    let initial = (2.2_f64 * 2.2 + 4.4 * 4.4).sqrt();
    let (x, stats) = solve_problem(
        problem,
        x0.clone(),
        &options,
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            fj.set_residual(0, 1.0 - x[0]);
            fj.set_residual(1, 10.0 * (x[1] - x[0] * x[0]));
            fj.set_partial(0, 0, -1.0);
            fj.set_partial(1, 0, -20.0 * x[0]);
            fj.set_partial(1, 1, 10.0);
            EvalOutcome::Continue
        },
    );
    assert_eq!(stats.status, SolveStatus::IterationLimitExceeded);
    assert_eq!(stats.iterations, 2);
    assert_ne!(x, x0);
    assert!(stats.fnorm < initial);
}

#[test]
fn misleading_trial_values_end_without_progress() {
    // The model promises a decrease that trial evaluations never deliver.
    let problem = Problem::unconstrained(1, 1).unwrap();
    let (x, stats) = solve_problem(
        problem,
        vec![0.0],
        &solver_options(),
        |x: &[f64], fj: &mut JacobianMut<'_>, request: EvalRequest| {
            if request.needs_jacobian() {
                fj.set_residual(0, x[0] - 5.0);
                fj.set_partial(0, 0, 1.0);
            } else {
                fj.set_residual(0, 100.0);
            }
            EvalOutcome::Continue
        },
    );
    assert_eq!(stats.status, SolveStatus::NoProgress);
    assert_eq!(stats.iterations, 0);
    assert_eq!(x, vec![0.0]);
    assert_eq!(stats.fnorm, 5.0);
    assert!(stats.radius < 1.0);
}

#[test]
fn loose_slow_progress_tolerance_stops_early() {
    // Box radius 1 then 2: ||f|| goes 5 -> 4 -> 2, relative decreases 0.2 and 0.5.
    let problem = Problem::unconstrained(1, 1).unwrap();
    let options = SolverOptions {
        slow_progress_tol: 0.6,
        slow_progress_iters: 2,
        ..solver_options()
    };
    let (x, stats) = solve_problem(problem, vec![0.0], &options, linear_shift(5.0));
    assert_eq!(stats.status, SolveStatus::ConvergedSlowProgress);
    assert_eq!(stats.iterations, 2);
    assert!((x[0] - 3.0).abs() <= 1e-10);
    assert!((stats.fnorm - 2.0).abs() <= 1e-10);
}

#[test]
fn rank_deficient_model_uses_minimum_norm_step() {
    let problem = Problem::unconstrained(2, 2).unwrap();
    let options = SolverOptions {
        initial_radius: 10.0,
        ..solver_options()
    };
    let (x, stats) = solve_problem(
        problem,
        vec![0.0, 0.0],
        &options,
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            fj.set_residual(0, x[0] + x[1] - 2.0);
            fj.set_residual(1, 2.0 * x[0] + 2.0 * x[1] - 4.0);
            fj.set_partial(0, 0, 1.0);
            fj.set_partial(0, 1, 1.0);
            fj.set_partial(1, 0, 2.0);
            fj.set_partial(1, 1, 2.0);
            EvalOutcome::Continue
        },
    );
    assert_eq!(stats.status, SolveStatus::ConvergedRankDeficient);
    assert_eq!(stats.status.code(), 10);
    assert!(stats.rank_deficient_solves > 0);
    assert!((x[0] - 1.0).abs() <= 1e-8);
    assert!((x[1] - 1.0).abs() <= 1e-8);
}

fn quartic(x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest) -> EvalOutcome {
    let d = x[0] - 100.0;
    fj.set_residual(0, d * d * d * d);
    fj.set_partial(0, 0, 4.0 * d * d * d);
    EvalOutcome::Continue
}

#[test]
fn quartic_with_and_without_bounds() {
    let options = SolverOptions {
        residual_tol: 1e-16,
        max_iters: 100,
        ..SolverOptions::default()
    };

    let (x, stats) = solve_problem(Problem::unconstrained(1, 1).unwrap(), vec![1.0], &options, quartic);
    assert_converged(stats.status);
    assert!((x[0] / 100.0 - 1.0).abs() <= 1e-5);

    let problem = Problem::new(1, vec![Bound::Upper(50.0)], Vec::new()).unwrap();
    let (x, stats) = solve_problem(problem, vec![1.0], &options, quartic);
    assert_converged(stats.status);
    assert!((x[0] - 50.0).abs() <= 1e-10);

    let problem = Problem::new(1, vec![Bound::Lower(-50.0)], Vec::new()).unwrap();
    let (x, stats) = solve_problem(problem, vec![1.0], &options, quartic);
    assert_converged(stats.status);
    assert!((x[0] / 100.0 - 1.0).abs() <= 1e-5);
}

#[test]
fn exponential_fit_with_separation_constraint() {
    let t = [0.05, 0.1, 0.4, 0.5, 1.0];
    let f = [2.206, 1.994, 1.350, 1.216, 0.7358];
    let problem = Problem::new(
        5,
        vec![
            Bound::Lower(0.0),
            Bound::Both(-25.0, 0.0),
            Bound::Lower(0.0),
            Bound::Both(-25.0, 0.0),
        ],
        vec![Bound::Lower(0.05)],
    )
    .unwrap();
    let bounds = problem.variable_bounds().to_vec();
    let options = SolverOptions {
        max_iters: 100,
        ..solver_options()
    };
    let (x, stats) = solve_problem(
        problem,
        vec![0.0; 4],
        &options,
        |x: &[f64], fj: &mut JacobianMut<'_>, _request: EvalRequest| {
            fj.set_constraint(0, x[1] - x[3]);
            fj.set_constraint_partial(0, 1, 1.0);
            fj.set_constraint_partial(0, 3, -1.0);
            for i in 0..t.len() {
                let e1 = (x[1] * t[i]).exp();
                let e2 = (x[3] * t[i]).exp();
                fj.set_residual(i, x[0] * e1 + x[2] * e2 - f[i]);
                fj.set_partial(i, 0, e1);
                fj.set_partial(i, 1, x[0] * t[i] * e1);
                fj.set_partial(i, 2, e2);
                fj.set_partial(i, 3, x[2] * t[i] * e2);
            }
            EvalOutcome::Continue
        },
    );

    assert_converged(stats.status);
    assert_ne!(stats.status, SolveStatus::ConvergedRankDeficient);
    // Data sampled from 2 exp(-t) + 0.5 exp(-10 t), rounded.
    let expected = [1.999475, -0.999801, 0.500057, -9.953988];
    for (xi, ei) in x.iter().zip(expected) {
        assert!((xi / ei - 1.0).abs() < 1e-4, "x = {x:?}");
    }
    for (xi, bound) in x.iter().zip(&bounds) {
        assert!(*xi >= bound.lower() && *xi <= bound.upper());
    }
    assert!(x[1] - x[3] >= 0.05);
    assert!(stats.fnorm < 5e-4);
}

#[test]
fn driver_reports_integer_flags() {
    let problem = Problem::new(1, vec![Bound::Both(0.0, 10.0)], Vec::new()).unwrap();
    let mut solver = Solver::new(problem, Parallelism::None);
    let options = solver_options();
    let mut driver = solver.start(&[9.0], &options).unwrap();
    let mut flags = vec![driver.igo()];
    while driver.request().is_some() {
        {
            let (x, mut fj) = driver.evaluation();
            fj.set_residual(0, x[0] - 5.0);
            fj.set_partial(0, 0, 1.0);
        }
        driver.resume(EvalOutcome::Continue);
        flags.push(driver.igo());
    }
    assert_eq!(flags[0], 1);
    assert!(flags[..flags.len() - 1].iter().all(|&f| f == 0 || f == 1));
    let last = *flags.last().unwrap();
    assert_eq!(SolveStatus::from_code(last), driver.status());
    assert_eq!(driver.state(), DriverState::Converged);
    assert_ne!(driver.state(), DriverState::Failed(FailureKind::NoProgress));
}

#[test]
fn jacobian_matches_final_iterate() {
    let problem = Problem::unconstrained(2, 2).unwrap();
    let mut solver = Solver::new(problem, Parallelism::None);
    let mut x = vec![0.0, 0.0];
    let stats = solver
        .solve(&mut mild_system, &mut x, &solver_options(), None)
        .unwrap();
    assert_converged(stats.status);
    let fj = solver.jacobian();
    assert!((fj.read(0, 1) - 0.2 * x[1]).abs() <= 1e-14);
    assert!((fj.read(1, 0) - 0.2 * x[0]).abs() <= 1e-14);
    let r0 = x[0] + 0.1 * x[1] * x[1] - 1.0;
    assert!((fj.read(0, 2) - r0).abs() <= 1e-14);
}

#[test]
fn allocations() {
    let problem = Problem::new(1, vec![Bound::Both(0.0, 10.0)], Vec::new()).unwrap();
    let mut solver = Solver::new(problem, Parallelism::None);
    let mut eval = linear_shift(1.0);
    let mut x = vec![0.0];
    solver
        .solve(&mut eval, &mut x, &solver_options(), None)
        .unwrap();

    let mut x = vec![0.0];
    reset_alloc_counter();
    solver
        .solve(&mut eval, &mut x, &solver_options(), None)
        .unwrap();
    let alloc = allocated_bytes();
    assert!(alloc <= 50_000, "allocations too high: {alloc}");
}
