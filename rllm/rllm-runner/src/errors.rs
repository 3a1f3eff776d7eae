use crate::schema::FieldKind;
use std::fmt::Display;

/// Protocol-level failures of the runner.
///
/// These travel inside `anyhow::Error` like every other error in the crate;
/// use [`RunnerError::from_anyhow`] to tell them apart from executor errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    /// A required field was absent after extraction; the driver and this
    /// worker disagree about the record layout.
    MissingField {
        record: &'static str,
        field: &'static str,
    },
    /// The field was present but carried the wrong kind of value.
    FieldType {
        record: &'static str,
        field: &'static str,
        expected: FieldKind,
        found: FieldKind,
    },
    /// An integer field that doesn't fit the record's type (a negative
    /// count or length).
    FieldRange {
        record: &'static str,
        field: &'static str,
        value: i64,
    },
    /// A nested record slot held a value of another type.
    RecordType { key: &'static str },
    /// The runner or backend doesn't provide this capability.
    Unimplemented {
        owner: String,
        capability: &'static str,
    },
}

impl RunnerError {
    pub fn from_anyhow(e: &anyhow::Error) -> Option<&Self> {
        e.downcast_ref::<Self>()
    }

    pub fn unimplemented(owner: impl Into<String>, capability: &'static str) -> Self {
        RunnerError::Unimplemented {
            owner: owner.into(),
            capability,
        }
    }
}

impl Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::MissingField { record, field } => {
                write!(f, "{}: missing required field '{}'", record, field)
            }
            RunnerError::FieldType {
                record,
                field,
                expected,
                found,
            } => write!(
                f,
                "{}: field '{}' should be {:?}, got {:?}",
                record, field, expected, found
            ),
            RunnerError::FieldRange {
                record,
                field,
                value,
            } => write!(f, "{}: field '{}' is out of range: {}", record, field, value),
            RunnerError::RecordType { key } => {
                write!(f, "nested record '{}' has unexpected type", key)
            }
            RunnerError::Unimplemented { owner, capability } => {
                write!(f, "{} doesn't implement {}", owner, capability)
            }
        }
    }
}

impl std::error::Error for RunnerError {}
