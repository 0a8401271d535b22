use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Broad failure class of an [`InvoicifyError`].
///
/// Attached to log records so operators can tell a broken dataset layout
/// apart from a bad annotation file or a failing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Directory layout or sample pairing problems.
    Structural,
    /// A box or entity file that does not parse.
    Format,
    /// Tensor, device or optimizer failures.
    Compute,
    /// Filesystem access.
    Io,
    /// Invalid configuration values.
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Structural => "Structural",
            ErrorCategory::Format => "Format",
            ErrorCategory::Compute => "Compute",
            ErrorCategory::Io => "Io",
            ErrorCategory::Config => "Config",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while loading, encoding or modelling documents.
#[derive(Debug, Error)]
pub enum InvoicifyError {
    /// One of the `img`, `box` or `entities` directories is missing.
    #[error("dataset directory not found: {}", path.display())]
    DirectoryNotFound {
        /// The directory that was expected.
        path: PathBuf,
    },

    /// A file stem exists in one artifact directory but not in another.
    #[error("sample {stem:?} has no {missing} file")]
    UnmatchedSample {
        /// The shared filename stem.
        stem: String,
        /// Which artifact directory lacks the stem.
        missing: &'static str,
    },

    /// Two files in the same artifact directory share a stem.
    #[error("duplicate {kind} files for sample {stem:?}")]
    DuplicateSample {
        /// The shared filename stem.
        stem: String,
        /// Artifact directory holding the duplicates.
        kind: &'static str,
    },

    /// The dataset root holds no paired documents.
    #[error("no samples found under {}", path.display())]
    EmptyDataset { path: PathBuf },

    /// Sample index outside `0..len`.
    #[error("sample index {index} out of range for dataset of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// A line of a box file that does not hold 8 integer coordinates.
    #[error("malformed box record at {}:{line}: {reason}", path.display())]
    MalformedBoxRecord {
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        reason: String,
    },

    /// An entity file that is not a JSON object.
    #[error("malformed label record in {}: {reason}", path.display())]
    MalformedLabelRecord { path: PathBuf, reason: String },

    /// A derived label id that the classifier cannot represent.
    #[error("label id {label} out of range for {num_labels} labels")]
    LabelOutOfRange { label: u32, num_labels: usize },

    /// The page image could not be opened or decoded.
    #[error("failed to load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Inputs that cannot be turned into model tensors.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The model weights file could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Training produced a NaN or infinite loss.
    #[error("non-finite loss {loss} at step {step}")]
    NonFiniteLoss { loss: f32, step: usize },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle ML framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl InvoicifyError {
    /// The failure class used when the error is logged.
    pub fn category(&self) -> ErrorCategory {
        match self {
            InvoicifyError::DirectoryNotFound { .. }
            | InvoicifyError::UnmatchedSample { .. }
            | InvoicifyError::DuplicateSample { .. }
            | InvoicifyError::EmptyDataset { .. }
            | InvoicifyError::IndexOutOfRange { .. } => ErrorCategory::Structural,
            InvoicifyError::MalformedBoxRecord { .. }
            | InvoicifyError::MalformedLabelRecord { .. }
            | InvoicifyError::LabelOutOfRange { .. }
            | InvoicifyError::Image { .. } => ErrorCategory::Format,
            InvoicifyError::Encoding(_)
            | InvoicifyError::ModelLoad(_)
            | InvoicifyError::NonFiniteLoss { .. }
            | InvoicifyError::Candle(_) => ErrorCategory::Compute,
            InvoicifyError::InvalidConfig(_) => ErrorCategory::Config,
            InvoicifyError::Io(_) => ErrorCategory::Io,
        }
    }

    /// Severity the error is logged at.
    pub fn level(&self) -> tracing::Level {
        match self.category() {
            ErrorCategory::Config => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }
}

/// Result type alias for Invoicify operations.
pub type Result<T> = std::result::Result<T, InvoicifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = InvoicifyError::MalformedBoxRecord {
            path: PathBuf::from("box/x001.txt"),
            line: 3,
            reason: "expected 8 coordinates, found 5".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("box/x001.txt:3"));
        assert!(msg.contains("found 5"));

        let err = InvoicifyError::UnmatchedSample {
            stem: "x002".into(),
            missing: "entities",
        };
        assert_eq!(err.to_string(), "sample \"x002\" has no entities file");
    }

    #[test]
    fn categories() {
        let err = InvoicifyError::DirectoryNotFound {
            path: PathBuf::from("data/img"),
        };
        assert_eq!(err.category(), ErrorCategory::Structural);

        let err = InvoicifyError::MalformedLabelRecord {
            path: PathBuf::from("e.txt"),
            reason: "eof".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Format);
        assert_eq!(err.level(), tracing::Level::ERROR);

        let err = InvoicifyError::InvalidConfig("batch size".into());
        assert_eq!(err.category().to_string(), "Config");
        assert_eq!(err.level(), tracing::Level::WARN);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InvoicifyError>();
    }
}
