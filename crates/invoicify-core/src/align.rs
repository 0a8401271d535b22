//! # Label Alignment
//!
//! Derives one class id per box from the entity annotations of a document.
//! Class `0` is the "outside" class for boxes that belong to no entity.

use crate::types::{BoundingBox, EntityMap};

/// Box → label assignment.
///
/// Implementations must be pure and return exactly one id per box, in box
/// order. Closures with the same signature implement the trait.
pub trait AlignLabels: Send + Sync {
    /// Assign a class id to every box.
    fn align(&self, boxes: &[BoundingBox], entities: &EntityMap) -> Vec<u32>;
}

impl<F> AlignLabels for F
where
    F: Fn(&[BoundingBox], &EntityMap) -> Vec<u32> + Send + Sync,
{
    fn align(&self, boxes: &[BoundingBox], entities: &EntityMap) -> Vec<u32> {
        self(boxes, entities)
    }
}

/// Assigns the same class to every box, ignoring the annotations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstantLabels(pub u32);

impl AlignLabels for ConstantLabels {
    fn align(&self, boxes: &[BoundingBox], _entities: &EntityMap) -> Vec<u32> {
        vec![self.0; boxes.len()]
    }
}

/// Labels a box with the first entity whose annotated value contains the
/// box text.
///
/// Entity `names[i]` maps to class `i + 1`. Matching ignores case and
/// collapses whitespace. Boxes without text, or whose text matches no
/// entity, get class `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTextLabels {
    names: Vec<String>,
}

impl EntityTextLabels {
    /// Create an aligner for the given entity names, in class order.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of classes produced, including the outside class.
    pub fn num_classes(&self) -> usize {
        self.names.len() + 1
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl AlignLabels for EntityTextLabels {
    fn align(&self, boxes: &[BoundingBox], entities: &EntityMap) -> Vec<u32> {
        let values: Vec<Option<String>> = self
            .names
            .iter()
            .map(|name| entities.get(name).map(|v| normalize(v)).filter(|v| !v.is_empty()))
            .collect();

        boxes
            .iter()
            .map(|bbox| {
                let Some(text) = bbox.text.as_deref().map(normalize).filter(|t| !t.is_empty())
                else {
                    return 0;
                };
                values
                    .iter()
                    .position(|value| value.as_ref().is_some_and(|v| v.contains(&text)))
                    .map_or(0, |i| i as u32 + 1)
            })
            .collect()
    }
}
