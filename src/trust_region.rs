/// Outcome of comparing a trial point against the linear model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    /// Poor agreement or no predicted decrease: retry from the same point.
    Reject,
    /// Acceptable agreement, radius unchanged.
    Accept,
    /// Good agreement, radius enlarged.
    AcceptAndGrow,
}

impl StepDecision {
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Box-shaped trust region: every step component satisfies `|p_i| <= radius`.
#[derive(Debug, Clone)]
pub struct TrustRegion {
    radius: f64,
    max_radius: f64,
    shrink_factor: f64,
    grow_factor: f64,
    accept_ratio: f64,
    expand_ratio: f64,
}

impl TrustRegion {
    pub fn new(
        radius: f64,
        max_radius: f64,
        shrink_factor: f64,
        grow_factor: f64,
        accept_ratio: f64,
        expand_ratio: f64,
    ) -> Self {
        Self {
            radius: radius.min(max_radius),
            max_radius,
            shrink_factor,
            grow_factor,
            accept_ratio,
            expand_ratio,
        }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Intersects the step bounds implied by the variable bounds with the box.
    pub fn clamp_step_bounds(&self, lower: &mut [f64], upper: &mut [f64]) {
        for (lo, hi) in lower.iter_mut().zip(upper.iter_mut()) {
            *lo = lo.max(-self.radius);
            *hi = hi.min(self.radius);
        }
    }

    /// Whether some component of `step` sits on the box boundary.
    pub fn is_binding(&self, step: &[f64]) -> bool {
        let edge = self.radius * (1.0 - 1e-10);
        step.iter().any(|p| p.abs() >= edge)
    }

    /// Ratio of actual to predicted reduction, or `None` when the model
    /// predicts no decrease.
    pub fn ratio(actual: f64, predicted: f64) -> Option<f64> {
        if predicted > 0.0 && actual.is_finite() {
            Some(actual / predicted)
        } else {
            None
        }
    }

    /// Applies the acceptance policy and adapts the radius.
    pub fn update(&mut self, ratio: Option<f64>) -> StepDecision {
        match ratio {
            Some(r) if r >= self.expand_ratio => {
                self.radius = (self.radius * self.grow_factor).min(self.max_radius);
                StepDecision::AcceptAndGrow
            }
            Some(r) if r >= self.accept_ratio => StepDecision::Accept,
            _ => {
                self.shrink();
                StepDecision::Reject
            }
        }
    }

    pub fn shrink(&mut self) {
        self.radius *= self.shrink_factor;
    }
}
