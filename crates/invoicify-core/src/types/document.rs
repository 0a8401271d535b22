use std::collections::BTreeMap;

use candle_core::Tensor;
use image::RgbImage;

use super::bbox::BoundingBox;

/// Entity name → value mapping of one document (e.g. `"total" → "9.00"`).
pub type EntityMap = BTreeMap<String, String>;

/// Parses the content of an entity file.
///
/// The file holds one JSON object. String values are kept as is, other
/// scalars are stored in their JSON spelling, `null` entries are dropped.
pub fn parse_entities(content: &str) -> Result<EntityMap, String> {
    let value: serde_json::Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let object = match value {
        serde_json::Value::Object(object) => object,
        other => {
            return Err(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ));
        }
    };

    let mut entities = EntityMap::new();
    for (key, value) in object {
        match value {
            serde_json::Value::Null => {}
            serde_json::Value::String(s) => {
                entities.insert(key, s);
            }
            serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {
                entities.insert(key, value.to_string());
            }
            nested => {
                return Err(format!(
                    "entity {key:?} holds a {}, expected a scalar",
                    json_kind(&nested)
                ));
            }
        }
    }
    Ok(entities)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// One scanned document with its annotations, as stored on disk.
#[derive(Debug, Clone)]
pub struct DocumentSample {
    /// Filename stem shared by the three artifacts.
    pub stem: String,
    /// Page raster converted to RGB.
    pub image: RgbImage,
    /// Boxes in file order.
    pub boxes: Vec<BoundingBox>,
    /// Entity values annotated for the document.
    pub entities: EntityMap,
}

/// Tensors derived from one [`DocumentSample`], ready for the model.
///
/// Rebuilt on every dataset access and dropped after the training step.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    /// `[3, H, W]` f32, normalised pixels.
    pub pixel_values: Tensor,
    /// `[num_boxes, 8]` i64, coordinates scaled to `0..=1000`.
    pub bbox: Tensor,
    /// `[num_boxes]` i64, class id per box.
    pub labels: Tensor,
}

impl EncodedExample {
    /// Number of boxes carried by the example.
    pub fn num_boxes(&self) -> usize {
        self.bbox.dims().first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_string_entities() {
        let entities = parse_entities(
            r#"{"company": "BOOK TA .K (TAMAN DAYA) SDN BHD", "total": "9.00"}"#,
        )
        .unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities["total"], "9.00");
    }

    #[test]
    fn parse_scalar_entities() {
        let entities = parse_entities(r#"{"total": 9.5, "paid": true, "date": null}"#).unwrap();
        assert_eq!(entities["total"], "9.5");
        assert_eq!(entities["paid"], "true");
        assert!(!entities.contains_key("date"));
    }

    #[test]
    fn parse_invalid_json() {
        assert!(parse_entities("{\"company\": ").is_err());
        assert!(parse_entities("not json").is_err());
    }

    #[test]
    fn parse_rejects_non_objects() {
        let err = parse_entities("[1, 2]").unwrap_err();
        assert!(err.contains("array"));

        let err = parse_entities(r#"{"lines": ["a", "b"]}"#).unwrap_err();
        assert!(err.contains("lines"));
    }
}
