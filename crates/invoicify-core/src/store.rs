//! # Sample Store
//!
//! Resolves the three artifacts of every document (page image, box file,
//! entity file) stored in parallel directories and loads them on demand.
//!
//! ```text
//! root/
//!   img/       x001.jpg  x002.png
//!   box/       x001.txt  x002.txt
//!   entities/  x001.txt  x002.txt
//! ```
//!
//! Files are paired by filename stem. A stem missing from any of the three
//! directories is rejected when the store is opened.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{InvoicifyError, Result};
use crate::types::{parse_entities, BoundingBox, DocumentSample, EntityMap};

/// Directory holding page images.
pub const IMAGE_DIR: &str = "img";
/// Directory holding box files.
pub const BOX_DIR: &str = "box";
/// Directory holding entity files.
pub const ENTITY_DIR: &str = "entities";

/// Paths of the three artifacts of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFiles {
    pub stem: String,
    pub image: PathBuf,
    pub boxes: PathBuf,
    pub entities: PathBuf,
}

/// Index of the documents found under a dataset root.
#[derive(Debug, Clone)]
pub struct SampleStore {
    root: PathBuf,
    samples: Vec<SampleFiles>,
}

impl SampleStore {
    /// Scans `root` and pairs the artifacts of every document by stem.
    ///
    /// Samples are kept in lexicographic stem order.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let images = list_stems(&root.join(IMAGE_DIR), IMAGE_DIR)?;
        let mut boxes = list_stems(&root.join(BOX_DIR), BOX_DIR)?;
        let mut entities = list_stems(&root.join(ENTITY_DIR), ENTITY_DIR)?;

        let mut samples = Vec::with_capacity(images.len());
        for (stem, image) in images {
            let boxes = boxes.remove(&stem).ok_or_else(|| InvoicifyError::UnmatchedSample {
                stem: stem.clone(),
                missing: BOX_DIR,
            })?;
            let entities =
                entities
                    .remove(&stem)
                    .ok_or_else(|| InvoicifyError::UnmatchedSample {
                        stem: stem.clone(),
                        missing: ENTITY_DIR,
                    })?;
            samples.push(SampleFiles {
                stem,
                image,
                boxes,
                entities,
            });
        }

        // Anything left over has no image.
        if let Some(stem) = boxes.into_keys().chain(entities.into_keys()).next() {
            return Err(InvoicifyError::UnmatchedSample {
                stem,
                missing: IMAGE_DIR,
            });
        }

        debug!(root = %root.display(), samples = samples.len(), "opened sample store");
        Ok(Self { root, samples })
    }

    /// Dataset root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of paired documents.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no document was found.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Artifact paths of the document at `index`.
    pub fn files(&self, index: usize) -> Result<&SampleFiles> {
        self.samples
            .get(index)
            .ok_or(InvoicifyError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })
    }

    /// All paired documents in stem order.
    pub fn samples(&self) -> &[SampleFiles] {
        &self.samples
    }

    /// Reads and parses the three artifacts of the document at `index`.
    pub fn load(&self, index: usize) -> Result<DocumentSample> {
        let files = self.files(index)?;

        let image = image::open(&files.image)
            .map_err(|source| InvoicifyError::Image {
                path: files.image.clone(),
                source,
            })?
            .to_rgb8();
        let boxes = read_boxes(&files.boxes)?;
        let entities = read_entities(&files.entities)?;

        Ok(DocumentSample {
            stem: files.stem.clone(),
            image,
            boxes,
            entities,
        })
    }
}

/// Lists regular, non-hidden files of `dir` keyed by stem.
fn list_stems(dir: &Path, kind: &'static str) -> Result<BTreeMap<String, PathBuf>> {
    if !dir.is_dir() {
        return Err(InvoicifyError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut stems = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.is_empty() || stem.starts_with('.') {
            continue;
        }
        let stem = stem.to_string();
        if stems.contains_key(&stem) {
            return Err(InvoicifyError::DuplicateSample { stem, kind });
        }
        stems.insert(stem, path);
    }
    Ok(stems)
}

/// Parses a box file, one [`BoundingBox`] per non-blank line.
pub fn read_boxes(path: &Path) -> Result<Vec<BoundingBox>> {
    let content = fs::read_to_string(path)?;
    let mut boxes = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let record = BoundingBox::parse_record(line).map_err(|reason| {
            InvoicifyError::MalformedBoxRecord {
                path: path.to_path_buf(),
                line: i + 1,
                reason,
            }
        })?;
        if let Some(bbox) = record {
            boxes.push(bbox);
        }
    }
    Ok(boxes)
}

/// Parses an entity file.
pub fn read_entities(path: &Path) -> Result<EntityMap> {
    let content = fs::read_to_string(path)?;
    parse_entities(&content).map_err(|reason| InvoicifyError::MalformedLabelRecord {
        path: path.to_path_buf(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_sample(root: &Path, stem: &str, boxes: &str, entities: &str) {
        for dir in [IMAGE_DIR, BOX_DIR, ENTITY_DIR] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        RgbImage::from_pixel(20, 10, Rgb([255, 255, 255]))
            .save(root.join(IMAGE_DIR).join(format!("{stem}.png")))
            .unwrap();
        fs::write(root.join(BOX_DIR).join(format!("{stem}.txt")), boxes).unwrap();
        fs::write(root.join(ENTITY_DIR).join(format!("{stem}.txt")), entities).unwrap();
    }

    #[test]
    fn open_pairs_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "b", "1 2 3 4 5 6 7 8\n", "{}");
        write_sample(dir.path(), "a", "1 2 3 4 5 6 7 8\n", "{}");

        let store = SampleStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        let stems: Vec<&str> = store.samples().iter().map(|s| s.stem.as_str()).collect();
        assert_eq!(stems, ["a", "b"]);
        assert!(store.files(0).unwrap().image.ends_with("img/a.png"));
    }

    #[test]
    fn open_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(IMAGE_DIR)).unwrap();
        fs::create_dir_all(dir.path().join(BOX_DIR)).unwrap();

        let err = SampleStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, InvoicifyError::DirectoryNotFound { ref path } if path.ends_with(ENTITY_DIR)));
    }

    #[test]
    fn open_unmatched_stem() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "", "{}");
        fs::write(dir.path().join(ENTITY_DIR).join("orphan.txt"), "{}").unwrap();

        let err = SampleStore::open(dir.path()).unwrap_err();
        match err {
            InvoicifyError::UnmatchedSample { stem, missing } => {
                assert_eq!(stem, "orphan");
                assert_eq!(missing, IMAGE_DIR);
            }
            other => panic!("unexpected error: {other}"),
        }

        fs::remove_file(dir.path().join(BOX_DIR).join("a.txt")).unwrap();
        let err = SampleStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, InvoicifyError::UnmatchedSample { missing: BOX_DIR, .. }));
    }

    #[test]
    fn open_duplicate_stem() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "", "{}");
        RgbImage::new(4, 4)
            .save(dir.path().join(IMAGE_DIR).join("a.jpg"))
            .unwrap();

        let err = SampleStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, InvoicifyError::DuplicateSample { kind: IMAGE_DIR, .. }));
    }

    #[test]
    fn load_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(
            dir.path(),
            "x001",
            "1 2 3 4 5 6 7 8 TOTAL\n\n10 20 30 40 50 60 70 80 9.00\n",
            r#"{"total": "9.00"}"#,
        );

        let store = SampleStore::open(dir.path()).unwrap();
        let sample = store.load(0).unwrap();
        assert_eq!(sample.stem, "x001");
        assert_eq!(sample.image.dimensions(), (20, 10));
        assert_eq!(sample.boxes.len(), 2);
        assert_eq!(sample.boxes[1].text.as_deref(), Some("9.00"));
        assert_eq!(sample.entities["total"], "9.00");
    }

    #[test]
    fn load_malformed_box_line() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "1 2 3 4 5 6 7 8\n1 2 3\n", "{}");

        let store = SampleStore::open(dir.path()).unwrap();
        match store.load(0).unwrap_err() {
            err @ InvoicifyError::MalformedBoxRecord { line, .. } => {
                assert_eq!(line, 2);
                assert_eq!(err.category(), crate::ErrorCategory::Format);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_malformed_entities() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "1 2 3 4 5 6 7 8\n", "{'total': 9.00");

        let store = SampleStore::open(dir.path()).unwrap();
        let err = store.load(0).unwrap_err();
        assert!(matches!(err, InvoicifyError::MalformedLabelRecord { .. }));
    }

    #[test]
    fn load_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a", "", "{}");

        let store = SampleStore::open(dir.path()).unwrap();
        let err = store.load(3).unwrap_err();
        assert!(matches!(err, InvoicifyError::IndexOutOfRange { index: 3, len: 1 }));
    }
}
