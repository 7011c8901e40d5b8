use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

/// Terminal outcome of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Residual norm fell below `residual_tol`.
    ConvergedResidual,
    /// Relative decrease stayed below `slow_progress_tol` for
    /// `slow_progress_iters` consecutive accepted steps.
    ConvergedSlowProgress,
    /// Step norm fell below `step_tol` relative to `||x||`.
    ConvergedStep,
    /// `max_iters` accepted steps without convergence; `x` is the best iterate.
    IterationLimitExceeded,
    /// The trust region collapsed without an acceptable step.
    NoProgress,
    /// The constraint rows cannot be satisfied together.
    Infeasible,
    /// The evaluator asked to stop.
    CallerRequestedHalt,
    /// Non-finite residuals or Jacobian at a linearization point.
    NumericalFailure,
    /// Converged, but the linear model of the final step was rank deficient
    /// and only its minimum-norm solution was used.
    ConvergedRankDeficient,
}

impl SolveStatus {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            Self::ConvergedResidual
                | Self::ConvergedSlowProgress
                | Self::ConvergedStep
                | Self::ConvergedRankDeficient
        )
    }

    /// Integer status flag; `0` and `1` are reserved for evaluation requests.
    pub fn code(self) -> i32 {
        match self {
            Self::ConvergedResidual => 2,
            Self::ConvergedSlowProgress => 3,
            Self::ConvergedStep => 4,
            Self::IterationLimitExceeded => 5,
            Self::NoProgress => 6,
            Self::Infeasible => 7,
            Self::CallerRequestedHalt => 8,
            Self::NumericalFailure => 9,
            Self::ConvergedRankDeficient => 10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            2 => Self::ConvergedResidual,
            3 => Self::ConvergedSlowProgress,
            4 => Self::ConvergedStep,
            5 => Self::IterationLimitExceeded,
            6 => Self::NoProgress,
            7 => Self::Infeasible,
            8 => Self::CallerRequestedHalt,
            9 => Self::NumericalFailure,
            10 => Self::ConvergedRankDeficient,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SolverStats {
    pub status: SolveStatus,
    /// Accepted steps.
    pub iterations: usize,
    /// Residual-only evaluations.
    pub residual_evaluations: usize,
    /// Residual and Jacobian evaluations.
    pub jacobian_evaluations: usize,
    pub fnorm: f64,
    pub step_norm: f64,
    pub radius: f64,
    pub constraint_violation: f64,
    /// Subproblem solves that fell back to a minimum-norm solution.
    pub rank_deficient_solves: usize,
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    pub fnorm: f64,
    pub trial_fnorm: f64,
    pub predicted_fnorm: f64,
    pub ratio: f64,
    pub radius: f64,
    pub step_norm: f64,
    pub active: usize,
    pub accepted: bool,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self, _stats: &SolverStats) {}
}

pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self, stats: &SolverStats) {
        if self.rows.is_empty() {
            emit_line(&format!("status: {:?}", stats.status));
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("fnorm").set_alignment(CellAlignment::Right),
            Cell::new("trial").set_alignment(CellAlignment::Right),
            Cell::new("model").set_alignment(CellAlignment::Right),
            Cell::new("ratio").set_alignment(CellAlignment::Right),
            Cell::new("radius").set_alignment(CellAlignment::Right),
            Cell::new("step").set_alignment(CellAlignment::Right),
            Cell::new("active").set_alignment(CellAlignment::Right),
            Cell::new("accepted"),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.fnorm)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.trial_fnorm)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.predicted_fnorm))
                    .set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", row.ratio)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.radius)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.step_norm)).set_alignment(CellAlignment::Right),
                Cell::new(row.active).set_alignment(CellAlignment::Right),
                Cell::new(if row.accepted { "yes" } else { "no" }),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        emit_line(&format!(
            "status: {:?} (fnorm {:.4e}, {} iterations)",
            stats.status, stats.fnorm, stats.iterations
        ));
        self.rows.clear();
    }
}
