use core::fmt;

/// Kind tag of a [`Bound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundKind {
    Unbounded,
    LowerOnly,
    UpperOnly,
    Both,
    Fixed,
}

/// Simple bound on a variable or on the value of a constraint row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    /// No restriction.
    Unbounded,
    /// `value >= l`.
    Lower(f64),
    /// `value <= u`.
    Upper(f64),
    /// `l <= value <= u`.
    Both(f64, f64),
    /// `value == v`.
    Fixed(f64),
}

impl Bound {
    pub fn kind(&self) -> BoundKind {
        match self {
            Self::Unbounded => BoundKind::Unbounded,
            Self::Lower(_) => BoundKind::LowerOnly,
            Self::Upper(_) => BoundKind::UpperOnly,
            Self::Both(..) => BoundKind::Both,
            Self::Fixed(_) => BoundKind::Fixed,
        }
    }

    /// Lower limit, `-inf` when absent.
    pub fn lower(&self) -> f64 {
        match *self {
            Self::Lower(l) | Self::Both(l, _) | Self::Fixed(l) => l,
            Self::Unbounded | Self::Upper(_) => f64::NEG_INFINITY,
        }
    }

    /// Upper limit, `+inf` when absent.
    pub fn upper(&self) -> f64 {
        match *self {
            Self::Upper(u) | Self::Both(_, u) | Self::Fixed(u) => u,
            Self::Unbounded | Self::Lower(_) => f64::INFINITY,
        }
    }

    /// Distance from `value` to the admissible interval.
    pub fn violation(&self, value: f64) -> f64 {
        let below = self.lower() - value;
        let above = value - self.upper();
        below.max(above).max(0.0)
    }

    /// Project `value` into the admissible interval.
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower()).min(self.upper())
    }

    fn finite_values(&self) -> bool {
        match *self {
            Self::Unbounded => true,
            Self::Lower(v) | Self::Upper(v) | Self::Fixed(v) => v.is_finite(),
            Self::Both(l, u) => l.is_finite() && u.is_finite(),
        }
    }
}

/// Which family of rows or columns a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundTarget {
    Variable,
    Constraint,
}

impl fmt::Display for BoundTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Variable => write!(f, "variable"),
            Self::Constraint => write!(f, "constraint"),
        }
    }
}

/// Validation errors for a [`Problem`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProblemError {
    /// No equations or no unknowns.
    InvalidDimensions { mequa: usize, nvars: usize },
    /// A bound value is NaN or infinite.
    NonFiniteBound { target: BoundTarget, index: usize },
    /// Lower bound exceeds upper bound.
    InvertedBounds {
        target: BoundTarget,
        index: usize,
        lower: f64,
        upper: f64,
    },
}

impl fmt::Display for ProblemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDimensions { mequa, nvars } => {
                write!(f, "invalid dimensions: mequa={mequa}, nvars={nvars}")
            }
            Self::NonFiniteBound { target, index } => {
                write!(f, "{target} {index} has a non-finite bound value")
            }
            Self::InvertedBounds {
                target,
                index,
                lower,
                upper,
            } => {
                write!(
                    f,
                    "{target} {index} has lower bound {lower} above upper bound {upper}"
                )
            }
        }
    }
}

impl std::error::Error for ProblemError {}

/// Dimensions and simple bounds of a constrained least-squares problem.
///
/// The evaluator fills `mcon` constraint rows followed by `mequa` equation
/// rows; every constraint row carries a bound on its value.
#[derive(Debug, Clone)]
pub struct Problem {
    mequa: usize,
    variable_bounds: Vec<Bound>,
    constraint_bounds: Vec<Bound>,
}

impl Problem {
    /// Creates a validated problem.
    ///
    /// `nvars` is `variable_bounds.len()` and `mcon` is
    /// `constraint_bounds.len()`.
    pub fn new(
        mequa: usize,
        variable_bounds: Vec<Bound>,
        constraint_bounds: Vec<Bound>,
    ) -> Result<Self, ProblemError> {
        let nvars = variable_bounds.len();
        if mequa == 0 || nvars == 0 {
            return Err(ProblemError::InvalidDimensions { mequa, nvars });
        }
        validate_bounds(&variable_bounds, BoundTarget::Variable)?;
        validate_bounds(&constraint_bounds, BoundTarget::Constraint)?;
        Ok(Self {
            mequa,
            variable_bounds,
            constraint_bounds,
        })
    }

    /// Problem with `nvars` free unknowns and no constraint rows.
    pub fn unconstrained(mequa: usize, nvars: usize) -> Result<Self, ProblemError> {
        Self::new(mequa, vec![Bound::Unbounded; nvars], Vec::new())
    }

    /// Number of residual equations.
    pub fn mequa(&self) -> usize {
        self.mequa
    }

    /// Number of unknowns.
    pub fn nvars(&self) -> usize {
        self.variable_bounds.len()
    }

    /// Number of general constraint rows.
    pub fn mcon(&self) -> usize {
        self.constraint_bounds.len()
    }

    /// Rows of the `fj` matrix.
    pub fn nrows(&self) -> usize {
        self.mcon() + self.mequa
    }

    pub fn variable_bounds(&self) -> &[Bound] {
        &self.variable_bounds
    }

    pub fn constraint_bounds(&self) -> &[Bound] {
        &self.constraint_bounds
    }
}

fn validate_bounds(bounds: &[Bound], target: BoundTarget) -> Result<(), ProblemError> {
    for (index, bound) in bounds.iter().enumerate() {
        if !bound.finite_values() {
            return Err(ProblemError::NonFiniteBound { target, index });
        }
        let (lower, upper) = (bound.lower(), bound.upper());
        if lower > upper {
            return Err(ProblemError::InvertedBounds {
                target,
                index,
                lower,
                upper,
            });
        }
    }
    Ok(())
}
