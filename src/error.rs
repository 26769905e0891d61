//! Error handling for acceleration-structure and pipeline setup.
//!
//! Every fallible operation returns [`Result`]. Whether a failure terminates
//! the process or is handed back to the caller is decided at the call site
//! through [`Policy`] / [`OrFatal`], never by the build profile.

use std::fmt;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to create the device: {0}")]
    DeviceCreation(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    #[error("Failed to serialize the global root signature.{}", blob_suffix(.0))]
    RootSignatureSerialization(Option<String>),

    #[error("Failed to create a root signature: {0}")]
    RootSignatureCreation(String),

    #[error("Failed to create a ray tracing state object. HResult: 0x{0:08X}")]
    StateObjectCreation(u32),

    #[error("Failed to allocate `{label}` ({size} bytes): {reason}")]
    Allocation {
        label: String,
        size: u64,
        reason: String,
    },

    #[error("Failed to get prebuild data for `{0}`")]
    EmptyPrebuild(&'static str),

    #[error("Descriptor heap is too small (capacity: {capacity})")]
    DescriptorHeapExhausted { capacity: u32 },

    #[error("No shader identifier exported for `{0}`")]
    MissingShaderIdentifier(String),

    #[error("Failed to submit command lists: {0}")]
    Submission(String),

    #[error("Failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Usage(String),

    #[error("Contract violation: {0}")]
    Contract(ContractViolation),
}

fn blob_suffix(blob: &Option<String>) -> String {
    match blob {
        Some(text) => format!("\nError returned: {text}"),
        None => String::new(),
    }
}

impl Error {
    /// Programmer errors (as opposed to driver / platform failures).
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::Contract(_))
    }

    pub fn allocation(label: impl Into<String>, size: u64, reason: impl ToString) -> Self {
        Error::Allocation {
            label: label.into(),
            size,
            reason: reason.to_string(),
        }
    }
}

impl From<ContractViolation> for Error {
    fn from(violation: ContractViolation) -> Self {
        Error::Contract(violation)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractViolation {
    VertexCountMismatch {
        attribute: &'static str,
        expected: usize,
        actual: usize,
    },
    IndexFormatChanged,
    MissingPositions,
    MissingIndices,
    TooFewVertices(usize),
    EmptyProceduralEntries,
    IntersectionOnTriangleHitGroup(String),
    MissingIntersection(String),
    DuplicateHitGroupExport(String),
    EmptyExportName,
    EmptyShaderTable(&'static str),
    RootParameterMismatch(u32),
    AccelerationStructureNotBuilt,
    UnknownAsset,
    NoInstances,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VertexCountMismatch {
                attribute,
                expected,
                actual,
            } => write!(
                f,
                "there are too few/too many {attribute} compared to the current set vertex count \
                 (expected {expected}, got {actual})"
            ),
            Self::IndexFormatChanged => {
                write!(f, "the index format cannot change once it has been set")
            }
            Self::MissingPositions => write!(f, "position buffer was not present"),
            Self::MissingIndices => write!(f, "index buffer was not present"),
            Self::TooFewVertices(count) => {
                write!(f, "a triangle BLAS needs at least 3 vertices, got {count}")
            }
            Self::EmptyProceduralEntries => {
                write!(f, "no procedural primitive entries in the BLAS")
            }
            Self::IntersectionOnTriangleHitGroup(export) => write!(
                f,
                "hit group `{export}` supplies an intersection shader but is not procedural"
            ),
            Self::MissingIntersection(export) => write!(
                f,
                "procedural hit group `{export}` has no intersection shader"
            ),
            Self::DuplicateHitGroupExport(export) => {
                write!(f, "hit group export `{export}` is declared twice")
            }
            Self::EmptyExportName => write!(f, "shader export names must not be empty"),
            Self::EmptyShaderTable(table) => {
                write!(f, "the {table} shader table needs at least one entry")
            }
            Self::RootParameterMismatch(parameter) => write!(
                f,
                "binding for root parameter {parameter} does not match the root signature"
            ),
            Self::AccelerationStructureNotBuilt => {
                write!(f, "acceleration structure referenced before it was built")
            }
            Self::UnknownAsset => write!(f, "asset id does not belong to this scene"),
            Self::NoInstances => write!(f, "top-level structure has no live instances"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What the caller wants to happen when an operation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Report and terminate the process (the samples' behavior).
    #[default]
    Fatal,
    /// Hand the error back to the caller.
    Recoverable,
}

impl Policy {
    pub fn apply<T>(self, result: Result<T>) -> Result<T> {
        match self {
            Policy::Fatal => Ok(result.or_fatal()),
            Policy::Recoverable => result,
        }
    }
}

pub trait OrFatal<T> {
    /// Unwraps the value or reports the error and terminates the process.
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T> {
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(&err.to_string()),
        }
    }
}

/// Surfaces `message` to the user and terminates the process.
pub fn fatal(message: &str) -> ! {
    log::error!("{message}");

    #[cfg(windows)]
    crate::device::d3d12::message_box("Intro to DirectX Raytracing", message);

    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_error_includes_blob_text() {
        let err = Error::RootSignatureSerialization(Some("bad register".into()));

        assert_eq!(
            "Failed to serialize the global root signature.\nError returned: bad register",
            err.to_string()
        );

        let err = Error::RootSignatureSerialization(None);

        assert_eq!("Failed to serialize the global root signature.", err.to_string());
    }

    #[test]
    fn state_object_error_formats_hresult() {
        let err = Error::StateObjectCreation(0x8007_0057);

        assert!(err.to_string().ends_with("0x80070057"));
    }

    #[test]
    fn recoverable_policy_passes_errors_through() {
        let result: Result<()> = Err(ContractViolation::MissingIndices.into());
        let err = Policy::Recoverable.apply(result).unwrap_err();

        assert!(err.is_contract_violation());
    }
}
