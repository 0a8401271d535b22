//! # Invoicify Core
//!
//! Building blocks for training a layout-aware entity extractor on scanned
//! invoices: pairing and parsing the per-document artifacts, encoding them
//! into tensors, deriving per-box labels, and the classifier itself.
//!
//! ## Quick Start
//!
//! ```rust
//! use invoicify_core::types::BoundingBox;
//!
//! let bbox = BoundingBox::parse_record("72,25,326,25,326,64,72,64,TAN WOON YANN")
//!     .unwrap()
//!     .unwrap();
//!
//! assert_eq!(bbox.coords[2], 326);
//! assert_eq!(bbox.text.as_deref(), Some("TAN WOON YANN"));
//! ```
pub mod align;
pub mod encoder;
pub mod error;
pub mod model;
pub mod store;
pub mod types;

// Re-export primary API
pub use align::{AlignLabels, ConstantLabels, EntityTextLabels};
pub use encoder::{EncoderConfig, FeatureEncoder, COORD_SCALE};
pub use error::{ErrorCategory, InvoicifyError, Result};
pub use model::{
    token_accuracy, token_cross_entropy, InvoiceModel, LayoutClassifier, LayoutConfig, ModelOutput,
    IGNORE_INDEX, MAX_IMAGE_SIZE,
};
pub use store::{SampleFiles, SampleStore};
pub use types::{BoundingBox, DocumentSample, EncodedExample, EntityMap, BOX_COORDS};
