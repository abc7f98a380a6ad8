//! Status codes for navigation queries

/// Outcome of a navigation query step
///
/// Sliced path searches report `InProgress` until they resolve; a resolved
/// search that could not reach its goal reports `PartialResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation was successful
    Success,
    /// Operation succeeded but the result does not reach the requested goal
    PartialResult,
    /// Operation has started and needs more iterations
    InProgress,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// Search ran out of nodes before completing
    OutOfNodes,
    /// Result did not fit in the requested buffer size
    BufferTooSmall,
}

impl Status {
    /// Checks if the status is a success (complete or partial)
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::PartialResult)
    }

    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Status::Failure | Status::InvalidParam | Status::OutOfNodes | Status::BufferTooSmall
        )
    }

    /// Checks if the operation still needs more work
    pub fn is_in_progress(&self) -> bool {
        *self == Status::InProgress
    }

    /// Checks if the result only partially reaches the goal
    pub fn is_partial(&self) -> bool {
        *self == Status::PartialResult
    }

    /// Converts status to a result
    pub fn to_result<T>(self, value: T) -> crate::Result<T> {
        if self.is_success() {
            Ok(value)
        } else {
            Err(crate::Error::Query(self))
        }
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::PartialResult => write!(f, "Partial result"),
            Status::InProgress => write!(f, "Operation in progress"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::OutOfNodes => write!(f, "Out of search nodes"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
        }
    }
}
