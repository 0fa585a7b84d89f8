//! Asset Document Pipeline
//!
//! Describes externally written frame files as resource and datum
//! documents. Identifiers are pure functions of the file location and data
//! key, so downstream consumers can compute them ahead of time.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AssetConfig;
use crate::error::{NyxError, Result};

/// A set of externally written frame files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uid: String,
    pub spec: String,
    pub root: String,
    pub resource_path: String,
    pub resource_kwargs: Map<String, Value>,
}

/// One addressable data key within a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub datum_id: String,
    pub resource: String,
    pub datum_kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Resource,
    Datum,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Resource => "resource",
            DocumentKind::Datum => "datum",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetDocument {
    Resource(Resource),
    Datum(Datum),
}

impl AssetDocument {
    pub fn kind(&self) -> DocumentKind {
        match self {
            AssetDocument::Resource(_) => DocumentKind::Resource,
            AssetDocument::Datum(_) => DocumentKind::Datum,
        }
    }
}

/// `{resource_uid}/{data_key}`
pub fn datum_id(resource_uid: &str, data_key: &str) -> String {
    format!("{}/{}", resource_uid, data_key)
}

/// Name-based UUID of a frame file location
pub fn resource_uid(root: &str, resource_path: &str) -> String {
    let location = format!("{}/{}", root.trim_end_matches('/'), resource_path);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, location.as_bytes()).to_string()
}

pub fn frame_file_name(prefix: &str, sequence: u32, extension: &str) -> String {
    format!("{}_{:05}.{}", prefix, sequence, extension)
}

/// Frames expected from one detector arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSet {
    pub root: PathBuf,
    pub prefix: String,
    pub first_sequence: u32,
    pub count: u32,
}

impl FrameSet {
    pub fn sequences(&self) -> std::ops::Range<u32> {
        self.first_sequence..self.first_sequence.saturating_add(self.count)
    }
}

/// Documents of one collection cycle, consumed at most once
#[derive(Debug, Default)]
pub struct AssetBuffer {
    docs: VecDeque<AssetDocument>,
}

impl AssetBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, doc: AssetDocument) {
        self.docs.push_back(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Hand over everything buffered; the buffer is left empty
    pub fn drain(&mut self) -> std::collections::vec_deque::IntoIter<AssetDocument> {
        std::mem::take(&mut self.docs).into_iter()
    }
}

/// Datum ids of one frame, in data-key order
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDatums {
    pub sequence: u32,
    pub resource_uid: String,
    pub datum_ids: Vec<(String, String)>,
}

impl FrameDatums {
    pub fn datum_for(&self, key: &str) -> Option<&str> {
        self.datum_ids
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, id)| id.as_str())
    }
}

pub struct AssetPipeline {
    spec: String,
    extension: String,
    data_keys: Vec<String>,
}

impl AssetPipeline {
    pub fn new(spec: impl Into<String>, extension: impl Into<String>, data_keys: Vec<String>) -> Self {
        Self {
            spec: spec.into(),
            extension: extension.into(),
            data_keys,
        }
    }

    pub fn from_config(config: &AssetConfig) -> Self {
        Self::new(config.spec(), config.extension(), config.data_keys())
    }

    pub fn data_keys(&self) -> &[String] {
        &self.data_keys
    }

    pub fn frame_path(&self, frames: &FrameSet, sequence: u32) -> PathBuf {
        frames.root.join(frame_file_name(&frames.prefix, sequence, &self.extension))
    }

    /// The writer must have produced the first frame before any metadata is emitted
    pub fn ensure_first_frame(&self, frames: &FrameSet) -> Result<PathBuf> {
        let path = self.frame_path(frames, frames.first_sequence);
        if !Path::new(&path).is_file() {
            return Err(NyxError::MissingFile(path));
        }
        debug!("First frame present: {}", path.display());
        Ok(path)
    }

    /// Append one resource and its datums per expected frame to `buffer`.
    ///
    /// Every data key gets its own datum, so a cycle yields
    /// `num_images × (1 + data_keys.len())` documents: 3 per frame with the
    /// default `data`/`omega` keys, not one resource and one datum per image.
    /// Configure a single data key for the one-datum layout.
    pub fn compose(&self, frames: &FrameSet, buffer: &mut AssetBuffer) -> Result<Vec<FrameDatums>> {
        self.ensure_first_frame(frames)?;

        let root = frames.root.to_string_lossy().into_owned();
        let mut composed = Vec::with_capacity(frames.count as usize);

        for sequence in frames.sequences() {
            let resource_path = frame_file_name(&frames.prefix, sequence, &self.extension);
            let uid = resource_uid(&root, &resource_path);

            buffer.push(AssetDocument::Resource(Resource {
                uid: uid.clone(),
                spec: self.spec.clone(),
                root: root.clone(),
                resource_path,
                resource_kwargs: Map::new(),
            }));

            let mut datum_ids = Vec::with_capacity(self.data_keys.len());
            for key in &self.data_keys {
                let id = datum_id(&uid, key);
                let mut datum_kwargs = Map::new();
                datum_kwargs.insert("data_key".to_string(), json!(key));
                buffer.push(AssetDocument::Datum(Datum {
                    datum_id: id.clone(),
                    resource: uid.clone(),
                    datum_kwargs,
                }));
                datum_ids.push((key.clone(), id));
            }

            composed.push(FrameDatums {
                sequence,
                resource_uid: uid,
                datum_ids,
            });
        }

        info!(
            "Composed asset documents for {} frames ({} documents)",
            composed.len(),
            buffer.len()
        );
        Ok(composed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frames(root: &Path, count: u32) -> FrameSet {
        FrameSet {
            root: root.to_path_buf(),
            prefix: "lyso_1".to_string(),
            first_sequence: 1,
            count,
        }
    }

    fn pipeline() -> AssetPipeline {
        AssetPipeline::from_config(&AssetConfig::default())
    }

    #[test]
    fn test_identifiers_are_deterministic() {
        let uid = resource_uid("/nyx-data/test", "lyso_1_00001.cbf");
        assert_eq!(uid, resource_uid("/nyx-data/test/", "lyso_1_00001.cbf"));
        assert_ne!(uid, resource_uid("/nyx-data/test", "lyso_1_00002.cbf"));
        assert_eq!(datum_id(&uid, "omega"), datum_id(&uid, "omega"));
        assert_eq!(datum_id("abc", "data"), "abc/data");
        assert_eq!(frame_file_name("lyso_1", 7, "cbf"), "lyso_1_00007.cbf");
    }

    #[test]
    fn test_missing_first_frame() {
        let dir = TempDir::new().unwrap();
        let mut buffer = AssetBuffer::new();

        let err = pipeline().compose(&frames(dir.path(), 3), &mut buffer).unwrap_err();
        match err {
            NyxError::MissingFile(path) => assert!(path.ends_with("lyso_1_00001.cbf")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_compose_and_drain_once() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lyso_1_00001.cbf"), b"").unwrap();
        let mut buffer = AssetBuffer::new();

        let composed = pipeline().compose(&frames(dir.path(), 3), &mut buffer).unwrap();
        assert_eq!(composed.len(), 3);
        assert_eq!(composed[2].sequence, 3);

        let docs: Vec<AssetDocument> = buffer.drain().collect();
        assert_eq!(docs.len(), 9);
        let resources = docs.iter().filter(|d| d.kind() == DocumentKind::Resource).count();
        let datums = docs.iter().filter(|d| d.kind() == DocumentKind::Datum).count();
        assert_eq!(resources, 3);
        assert_eq!(datums, 6);

        match (&docs[0], &docs[2]) {
            (AssetDocument::Resource(resource), AssetDocument::Datum(datum)) => {
                assert_eq!(resource.spec, "AD_PILATUS_MX");
                assert_eq!(resource.resource_path, "lyso_1_00001.cbf");
                assert_eq!(datum.resource, resource.uid);
                assert_eq!(datum.datum_id, format!("{}/omega", resource.uid));
                assert_eq!(datum.datum_kwargs["data_key"], "omega");
                assert_eq!(composed[0].datum_for("omega"), Some(datum.datum_id.as_str()));
            }
            other => panic!("unexpected documents: {other:?}"),
        }

        assert_eq!(buffer.drain().count(), 0);
    }

    #[test]
    fn test_single_data_key_gives_one_datum_per_frame() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("lyso_1_00001.cbf"), b"").unwrap();
        let pipeline = AssetPipeline::new("AD_PILATUS_MX", "cbf", vec!["data".to_string()]);
        let mut buffer = AssetBuffer::new();

        pipeline.compose(&frames(dir.path(), 4), &mut buffer).unwrap();
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_document_wire_shape() {
        let datum = AssetDocument::Datum(Datum {
            datum_id: "res/data".to_string(),
            resource: "res".to_string(),
            datum_kwargs: Map::new(),
        });
        let value = serde_json::to_value(&datum).unwrap();
        assert_eq!(value, json!({"datum_id": "res/data", "resource": "res", "datum_kwargs": {}}));
    }
}
