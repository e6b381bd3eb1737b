use thiserror::Error;

/// Search-level failure. Individual probe outcomes never escape the search loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    /// Too many inconclusive probes in a row, or no size ever succeeded
    #[error("no usable measurement for {target} after {probes} probes (last tested size: {last_tested:?})")]
    NoMeasurement {
        target: String,
        last_tested: Option<usize>,
        probes: u32,
    },
    /// The probe facility could not run; not retried
    #[error("probe failed for {target} at size {size} after {probes} probes: {message}")]
    Execution {
        target: String,
        size: usize,
        probes: u32,
        message: String,
    },
    /// The configured floor itself needs fragmentation
    #[error("floor {floor} does not pass unfragmented to {target} ({probes} probes)")]
    FloorRejected {
        target: String,
        floor: usize,
        probes: u32,
    },
    #[error("search for {target} cancelled after {probes} probes (last tested size: {last_tested:?})")]
    Cancelled {
        target: String,
        last_tested: Option<usize>,
        probes: u32,
    },
    #[error("invalid search bounds for {target}: floor {floor} is above ceiling {ceiling}")]
    InvalidBounds {
        target: String,
        floor: usize,
        ceiling: usize,
    },
}

impl SearchError {
    pub fn target(&self) -> &str {
        match self {
            SearchError::NoMeasurement { target, .. }
            | SearchError::Execution { target, .. }
            | SearchError::FloorRejected { target, .. }
            | SearchError::Cancelled { target, .. }
            | SearchError::InvalidBounds { target, .. } => target,
        }
    }
}
