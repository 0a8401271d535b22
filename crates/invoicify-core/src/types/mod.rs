pub mod bbox;
pub mod document;

pub use bbox::{BoundingBox, BOX_COORDS};
pub use document::{parse_entities, DocumentSample, EncodedExample, EntityMap};
