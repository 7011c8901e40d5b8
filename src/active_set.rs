//! Bounded linear least-squares subproblem with linearized constraint rows.
//!
//! The unknowns are `z = [p; s]`: the step `p` and one slack `s_j` per
//! constraint row standing for the linearized value `c_j + C_j p`. Each
//! constraint row becomes the weighted equation `w_j (C_j p - s_j) = -w_j c_j`
//! placed ahead of the objective rows, and every bound (variable, trust box,
//! constraint value) becomes a simple bound on `z`. The bounded problem is then
//! solved with a two-sided active-set iteration in the style of Stark and
//! Parker's BVLS.

use faer_core::{Mat, Parallelism};

use crate::linalg::{self, LstsqWorkspace};

/// Side of a binding bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundSide {
    Lower,
    Upper,
}

/// A bound treated as an equality by the final active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveIndex {
    /// Simple (or trust-box) bound on variable `i`.
    Variable(usize, BoundSide),
    /// Bound on the value of constraint row `j`.
    Constraint(usize, BoundSide),
}

/// What the linear model minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Objective {
    /// `||f + J p||` from the equation rows of `fj`.
    Residuals,
    /// `||p||`, used to project onto the feasible set.
    MinimumNorm,
}

/// Linearization of the problem at the current iterate.
pub(crate) struct LinearModel<'a> {
    /// `(mcon + mequa) x (nvars + 1)`, constraint rows first, values last.
    pub fj: &'a Mat<f64>,
    pub mcon: usize,
    pub mequa: usize,
    pub nvars: usize,
    pub objective: Objective,
    /// Bounds on the step, already intersected with the trust box.
    pub step_lower: &'a [f64],
    pub step_upper: &'a [f64],
    /// Bounds on the constraint values `c + C p`.
    pub constraint_lower: &'a [f64],
    pub constraint_upper: &'a [f64],
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveSetParams {
    pub max_iters: usize,
    pub rank_tol: f64,
    pub constraint_weight: f64,
}

/// Candidate step produced by one subproblem solve.
#[derive(Debug)]
pub(crate) struct SubproblemSolution<'a> {
    pub step: &'a [f64],
    pub active: &'a [ActiveIndex],
    /// `||f + J p||` (or `||p||` for a projection).
    pub predicted_norm: f64,
    /// Largest distance of a linearized constraint value from its bounds.
    pub constraint_violation: f64,
    /// The last free-variable solve fell back to a minimum-norm solution.
    pub rank_deficient: bool,
    pub iterations: usize,
    /// The iteration cap stopped the active-set loop.
    pub capped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarState {
    Free,
    AtLower,
    AtUpper,
}

/// Reusable active-set solver sized for one problem.
#[derive(Debug)]
pub(crate) struct ActiveSetSolver {
    a: Mat<f64>,
    b: Vec<f64>,
    free: Mat<f64>,
    rhs: Vec<f64>,
    z: Vec<f64>,
    y: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    state: Vec<VarState>,
    blocked: Vec<bool>,
    free_idx: Vec<usize>,
    resid: Vec<f64>,
    grad: Vec<f64>,
    step: Vec<f64>,
    values: Vec<f64>,
    active: Vec<ActiveIndex>,
    lstsq: LstsqWorkspace,
}

impl ActiveSetSolver {
    pub(crate) fn new(mequa: usize, nvars: usize, mcon: usize) -> Self {
        let rows = mcon + mequa.max(nvars);
        let nz = nvars + mcon;
        Self {
            a: Mat::zeros(rows, nz),
            b: vec![0.0; rows],
            free: Mat::zeros(rows, nz),
            rhs: vec![0.0; rows],
            z: vec![0.0; nz],
            y: vec![0.0; nz],
            lower: vec![0.0; nz],
            upper: vec![0.0; nz],
            state: vec![VarState::Free; nz],
            blocked: vec![false; nz],
            free_idx: Vec::with_capacity(nz),
            resid: vec![0.0; rows.max(mequa).max(mcon)],
            grad: vec![0.0; nz],
            step: vec![0.0; nvars],
            values: vec![0.0; mcon],
            active: Vec::with_capacity(nz),
            lstsq: LstsqWorkspace::new(rows, nz),
        }
    }

    /// Solves the bounded linear subproblem described by `model`.
    pub(crate) fn solve(
        &mut self,
        model: &LinearModel<'_>,
        params: &ActiveSetParams,
        parallelism: Parallelism,
    ) -> SubproblemSolution<'_> {
        let n = model.nvars;
        let mc = model.mcon;
        let nz = n + mc;
        let rows = self.assemble(model, params.constraint_weight);

        let mut iterations = 0;
        let mut rank_deficient = false;
        let mut capped = false;
        let mut released: Option<(usize, VarState)> = None;
        self.blocked[..nz].fill(false);

        'outer: loop {
            // Move toward the free-variable solution until it is feasible.
            loop {
                if iterations >= params.max_iters {
                    capped = true;
                    break 'outer;
                }
                iterations += 1;
                rank_deficient = self.solve_free(rows, nz, params.rank_tol);

                let alpha = self.max_feasible_fraction();
                if alpha >= 1.0 {
                    for (f, &i) in self.free_idx.iter().enumerate() {
                        self.z[i] = self.y[f];
                    }
                    if released.take().is_some() {
                        self.blocked[..nz].fill(false);
                    }
                    break;
                }
                if alpha <= 0.0 {
                    if let Some((j, prev)) = released.take() {
                        if self.blocks_at_zero(j) {
                            // The released bound is immediately hit again.
                            self.state[j] = prev;
                            self.z[j] = if prev == VarState::AtLower {
                                self.lower[j]
                            } else {
                                self.upper[j]
                            };
                            self.blocked[j] = true;
                            break;
                        }
                    }
                }
                self.interpolate(alpha.max(0.0));
                released = None;
            }

            match self.pick_release(rows, nz, parallelism) {
                Some(j) => {
                    released = Some((j, self.state[j]));
                    self.state[j] = VarState::Free;
                }
                None => break,
            }
        }

        if capped {
            log::warn!("active-set iteration cap ({}) reached", params.max_iters);
        }
        self.finish(model, iterations, rank_deficient, capped, parallelism)
    }

    /// Builds `A z ~ b`, the bounds on `z`, and the starting active set.
    /// Returns the number of rows.
    fn assemble(&mut self, model: &LinearModel<'_>, weight: f64) -> usize {
        let n = model.nvars;
        let mc = model.mcon;
        let nz = n + mc;
        let fj = model.fj;
        let nobj = match model.objective {
            Objective::Residuals => model.mequa,
            Objective::MinimumNorm => n,
        };
        let rows = mc + nobj;

        let scale = match model.objective {
            Objective::Residuals => {
                let mut max = 0.0_f64;
                for i in mc..mc + model.mequa {
                    for k in 0..n {
                        max = max.max(fj.read(i, k).abs());
                    }
                }
                if max > 0.0 {
                    max
                } else {
                    1.0
                }
            }
            Objective::MinimumNorm => 1.0,
        };

        for j in 0..mc {
            let lo = model.constraint_lower[j];
            let hi = model.constraint_upper[j];
            let unbounded = lo == f64::NEG_INFINITY && hi == f64::INFINITY;
            let mut row_norm = 1.0;
            for k in 0..n {
                let v = fj.read(j, k);
                row_norm += v * v;
            }
            let w = if unbounded {
                0.0
            } else {
                weight * scale / row_norm.sqrt()
            };
            for k in 0..n {
                self.a.write(j, k, w * fj.read(j, k));
            }
            for k in 0..mc {
                self.a.write(j, n + k, if k == j { -w } else { 0.0 });
            }
            self.b[j] = -w * fj.read(j, n);

            let c = fj.read(j, n);
            if unbounded {
                // Slack pinned at zero; the row carries no weight.
                self.lower[n + j] = 0.0;
                self.upper[n + j] = 0.0;
                self.z[n + j] = 0.0;
            } else {
                self.lower[n + j] = lo;
                self.upper[n + j] = hi;
                self.z[n + j] = c.max(lo).min(hi);
            }
        }

        for i in 0..nobj {
            let r = mc + i;
            match model.objective {
                Objective::Residuals => {
                    for k in 0..n {
                        self.a.write(r, k, fj.read(r, k));
                    }
                    self.b[r] = -fj.read(r, n);
                }
                Objective::MinimumNorm => {
                    for k in 0..n {
                        self.a.write(r, k, if k == i { 1.0 } else { 0.0 });
                    }
                    self.b[r] = 0.0;
                }
            }
            for k in 0..mc {
                self.a.write(r, n + k, 0.0);
            }
        }

        for k in 0..n {
            self.lower[k] = model.step_lower[k];
            self.upper[k] = model.step_upper[k];
            self.z[k] = 0.0_f64.max(self.lower[k]).min(self.upper[k]);
        }

        for i in 0..nz {
            self.state[i] = if self.z[i] == self.lower[i] {
                VarState::AtLower
            } else if self.z[i] == self.upper[i] {
                VarState::AtUpper
            } else {
                VarState::Free
            };
        }
        rows
    }

    /// Least-squares solve over the free variables into `y`.
    fn solve_free(&mut self, rows: usize, nz: usize, rank_tol: f64) -> bool {
        self.free_idx.clear();
        for i in 0..nz {
            if self.state[i] == VarState::Free {
                self.free_idx.push(i);
            }
        }
        for r in 0..rows {
            let mut v = self.b[r];
            for i in 0..nz {
                if self.state[i] != VarState::Free {
                    v -= self.a.read(r, i) * self.z[i];
                }
            }
            self.rhs[r] = v;
        }
        for (f, &i) in self.free_idx.iter().enumerate() {
            for r in 0..rows {
                self.free.write(r, f, self.a.read(r, i));
            }
        }
        let nf = self.free_idx.len();
        let info = linalg::min_norm_lstsq(
            self.free.as_ref().submatrix(0, 0, rows, nf),
            &self.rhs,
            &mut self.y[..nf],
            rank_tol,
            &mut self.lstsq,
        );
        info.rank_deficient
    }

    fn fraction_to_bound(&self, f: usize, i: usize) -> Option<f64> {
        let target = self.y[f];
        let current = self.z[i];
        if target < self.lower[i] {
            Some((self.lower[i] - current) / (target - current))
        } else if target > self.upper[i] {
            Some((self.upper[i] - current) / (target - current))
        } else {
            None
        }
    }

    /// Largest `alpha <= 1` keeping `z + alpha (y - z)` within bounds.
    fn max_feasible_fraction(&self) -> f64 {
        let mut alpha = 1.0_f64;
        for (f, &i) in self.free_idx.iter().enumerate() {
            if let Some(a) = self.fraction_to_bound(f, i) {
                alpha = alpha.min(a);
            }
        }
        alpha
    }

    fn blocks_at_zero(&self, j: usize) -> bool {
        self.free_idx
            .iter()
            .position(|&i| i == j)
            .and_then(|f| self.fraction_to_bound(f, j))
            .is_some_and(|a| a <= 0.0)
    }

    /// Steps a fraction `alpha` toward `y` and activates every bound reached,
    /// in increasing variable order.
    fn interpolate(&mut self, alpha: f64) {
        let tie = alpha + 1e-12 * alpha.max(1e-300);
        for (f, &i) in self.free_idx.iter().enumerate() {
            let hit = self.fraction_to_bound(f, i).filter(|&a| a <= tie);
            let target = self.y[f];
            match hit {
                Some(_) if target < self.lower[i] => {
                    self.z[i] = self.lower[i];
                    self.state[i] = VarState::AtLower;
                }
                Some(_) => {
                    self.z[i] = self.upper[i];
                    self.state[i] = VarState::AtUpper;
                }
                None => {
                    let z = self.z[i] + alpha * (target - self.z[i]);
                    self.z[i] = z.max(self.lower[i]).min(self.upper[i]);
                }
            }
        }
    }

    /// Bound variable whose multiplier most strongly asks for release.
    fn pick_release(&mut self, rows: usize, nz: usize, parallelism: Parallelism) -> Option<usize> {
        let a = self.a.as_ref().submatrix(0, 0, rows, nz);
        linalg::gemv(&mut self.resid[..rows], a, &self.z[..nz], parallelism);
        for r in 0..rows {
            self.resid[r] = self.b[r] - self.resid[r];
        }
        linalg::gemv(&mut self.grad[..nz], a.transpose(), &self.resid[..rows], parallelism);

        let scale = linalg::l2_norm(&self.b[..rows]).max(linalg::l2_norm(&self.resid[..rows]));
        let mut col_max = 0.0_f64;
        for i in 0..nz {
            let mut s = 0.0;
            for r in 0..rows {
                let v = self.a.read(r, i);
                s += v * v;
            }
            col_max = col_max.max(s.sqrt());
        }
        let tol = 1e3 * f64::EPSILON * col_max * scale;

        let mut best: Option<(usize, f64)> = None;
        for i in 0..nz {
            if self.blocked[i] || self.lower[i] == self.upper[i] {
                continue;
            }
            let w = self.grad[i];
            let gain = match self.state[i] {
                VarState::AtLower if w > tol => w,
                VarState::AtUpper if w < -tol => -w,
                _ => continue,
            };
            if best.map_or(true, |(_, g)| gain > g) {
                best = Some((i, gain));
            }
        }
        best.map(|(i, _)| i)
    }

    fn finish(
        &mut self,
        model: &LinearModel<'_>,
        iterations: usize,
        rank_deficient: bool,
        capped: bool,
        parallelism: Parallelism,
    ) -> SubproblemSolution<'_> {
        let n = model.nvars;
        let mc = model.mcon;
        let fj = model.fj.as_ref();
        self.step[..n].copy_from_slice(&self.z[..n]);

        let predicted_norm = match model.objective {
            Objective::Residuals => {
                let m = model.mequa;
                linalg::gemv(
                    &mut self.resid[..m],
                    fj.submatrix(mc, 0, m, n),
                    &self.step[..n],
                    parallelism,
                );
                for i in 0..m {
                    self.resid[i] += fj.read(mc + i, n);
                }
                linalg::l2_norm(&self.resid[..m])
            }
            Objective::MinimumNorm => linalg::l2_norm(&self.step[..n]),
        };

        let mut constraint_violation = 0.0_f64;
        if mc > 0 {
            linalg::gemv(
                &mut self.values[..mc],
                fj.submatrix(0, 0, mc, n),
                &self.step[..n],
                parallelism,
            );
            for j in 0..mc {
                let v = self.values[j] + fj.read(j, n);
                let below = model.constraint_lower[j] - v;
                let above = v - model.constraint_upper[j];
                constraint_violation = constraint_violation.max(below.max(above));
            }
        }

        self.active.clear();
        for i in 0..n + mc {
            let side = match self.state[i] {
                VarState::AtLower => BoundSide::Lower,
                VarState::AtUpper => BoundSide::Upper,
                VarState::Free => continue,
            };
            if i < n {
                self.active.push(ActiveIndex::Variable(i, side));
            } else if model.constraint_lower[i - n] != f64::NEG_INFINITY
                || model.constraint_upper[i - n] != f64::INFINITY
            {
                self.active.push(ActiveIndex::Constraint(i - n, side));
            }
        }

        SubproblemSolution {
            step: &self.step[..n],
            active: &self.active,
            predicted_norm,
            constraint_violation,
            rank_deficient,
            iterations,
            capped,
        }
    }
}
