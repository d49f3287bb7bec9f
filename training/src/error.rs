use std::{error::Error, fmt};

use collectives::CommErr;

/// The training module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
#[derive(Debug)]
pub enum TrainErr {
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
    },
    UnsupportedGradientLayout {
        param: String,
    },
    GradientSizeMismatch {
        param: String,
        got: usize,
        expected: usize,
    },
    NumericDivergence {
        what: &'static str,
        param: Option<String>,
    },
    Comm(CommErr),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::InvalidHyperparameter { name, value } => {
                write!(f, "invalid hyperparameter {name}: {value}")
            }
            TrainErr::UnsupportedGradientLayout { param } => write!(
                f,
                "sparse gradient for parameter {param}, this optimizer requires dense gradients"
            ),
            TrainErr::GradientSizeMismatch {
                param,
                got,
                expected,
            } => write!(
                f,
                "gradient length mismatch for parameter {param}: got {got}, expected {expected}"
            ),
            TrainErr::NumericDivergence { what, param } => match param {
                Some(param) => write!(f, "non-finite {what} in parameter {param}"),
                None => write!(f, "non-finite {what}"),
            },
            TrainErr::Comm(e) => write!(f, "communication error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Comm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommErr> for TrainErr {
    fn from(value: CommErr) -> Self {
        Self::Comm(value)
    }
}
