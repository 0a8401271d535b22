use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of integer coordinates describing one box (4 corners, x/y each).
pub const BOX_COORDS: usize = 8;

/// A quadrilateral text region on a page.
///
/// Coordinates are stored corner by corner as `x1, y1, x2, y2, x3, y3, x4, y4`,
/// in the order they appear in the annotation file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Raw corner coordinates in page pixels.
    pub coords: [i64; BOX_COORDS],

    /// Text recognised inside the box, when the record carries any.
    pub text: Option<String>,
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ','
}

impl BoundingBox {
    /// Creates a box without text.
    #[must_use]
    pub fn new(coords: [i64; BOX_COORDS]) -> Self {
        Self { coords, text: None }
    }

    /// Attaches recognised text to the box.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Parses one box record.
    ///
    /// The first 8 whitespace or comma separated tokens are the coordinates.
    /// Whatever follows is kept verbatim as the box text. Returns `Ok(None)`
    /// for blank lines and `Err` with a human readable reason when fewer than
    /// 8 tokens are present or one of them is not an integer.
    pub fn parse_record(line: &str) -> Result<Option<Self>, String> {
        let mut rest = line.trim();
        if rest.is_empty() {
            return Ok(None);
        }

        let mut coords = [0i64; BOX_COORDS];
        for (i, slot) in coords.iter_mut().enumerate() {
            rest = rest.trim_start_matches(is_separator);
            let end = rest.find(is_separator).unwrap_or(rest.len());
            let token = &rest[..end];
            if token.is_empty() {
                return Err(format!(
                    "expected {BOX_COORDS} coordinates, found {i}"
                ));
            }
            *slot = token
                .parse()
                .map_err(|_| format!("coordinate {} is not an integer: {token:?}", i + 1))?;
            rest = &rest[end..];
        }

        let text = rest.trim_start_matches(is_separator).trim();
        let text = (!text.is_empty()).then(|| text.to_string());

        Ok(Some(Self { coords, text }))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coords: Vec<String> = self.coords.iter().map(|c| c.to_string()).collect();
        write!(f, "[{}]", coords.join(" "))?;
        if let Some(ref text) = self.text {
            write!(f, " {text:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_whitespace_record() {
        let parsed = BoundingBox::parse_record("10 20 110 20 110 40 10 40")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.coords, [10, 20, 110, 20, 110, 40, 10, 40]);
        assert_eq!(parsed.text, None);
    }

    #[test]
    fn parse_keeps_trailing_text() {
        let parsed = BoundingBox::parse_record("72,25,326,25,326,64,72,64,TAN WOON YANN")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.coords[2], 326);
        assert_eq!(parsed.text.as_deref(), Some("TAN WOON YANN"));

        let parsed = BoundingBox::parse_record("1 2 3 4 5 6 7 8   TOTAL  9.00 ")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.text.as_deref(), Some("TOTAL  9.00"));
    }

    #[test]
    fn parse_blank_line() {
        assert_eq!(BoundingBox::parse_record("   ").unwrap(), None);
        assert_eq!(BoundingBox::parse_record("").unwrap(), None);
    }

    #[test]
    fn parse_too_few_tokens() {
        let err = BoundingBox::parse_record("1 2 3 4 5").unwrap_err();
        assert!(err.contains("found 5"));
    }

    #[test]
    fn parse_non_integer_coordinate() {
        let err = BoundingBox::parse_record("1 2 3 x 5 6 7 8").unwrap_err();
        assert!(err.contains("coordinate 4"));
    }

    #[test]
    fn display() {
        let bbox = BoundingBox::new([1, 2, 3, 4, 5, 6, 7, 8]).with_text("TOTAL");
        assert_eq!(bbox.to_string(), "[1 2 3 4 5 6 7 8] \"TOTAL\"");
    }
}
