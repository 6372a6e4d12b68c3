//! Write-once storage for the outcome of one asynchronous computation.

use crate::error::{SlotError, TaskError};

/// Outcome of a single computation.
///
/// Transitions `Empty -> Value | Failure` exactly once. Taking the outcome
/// moves it out and leaves `Consumed`; the slot never returns to `Empty`.
#[derive(Debug)]
pub enum ResultSlot<T> {
    Empty,
    Value(T),
    Failure(TaskError),
    Consumed,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self::Empty
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// True once an outcome has been stored, even if it was taken since.
    pub fn is_filled(&self) -> bool {
        !self.is_empty()
    }

    pub fn failure(&self) -> Option<&TaskError> {
        match self {
            Self::Failure(err) => Some(err),
            _ => None,
        }
    }

    pub fn fill(&mut self, outcome: Result<T, TaskError>) -> Result<(), SlotError> {
        match self {
            Self::Empty => {
                *self = match outcome {
                    Ok(value) => Self::Value(value),
                    Err(err) => Self::Failure(err),
                };
                Ok(())
            }
            Self::Value(_) | Self::Failure(_) | Self::Consumed => Err(SlotError::AlreadyFilled),
        }
    }

    /// Move the outcome out, leaving the slot `Consumed`.
    pub fn take(&mut self) -> Result<Result<T, TaskError>, SlotError> {
        match self {
            Self::Empty => Err(SlotError::Empty),
            Self::Consumed => Err(SlotError::Consumed),
            Self::Value(_) | Self::Failure(_) => match std::mem::replace(self, Self::Consumed) {
                Self::Value(value) => Ok(Ok(value)),
                Self::Failure(err) => Ok(Err(err)),
                Self::Empty | Self::Consumed => Err(SlotError::Empty),
            },
        }
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
