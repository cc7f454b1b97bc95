//! On-disk layout of a partitioned tree.
//!
//! A shard base directory holds one metadata file describing the root
//! bounding box plus one sub-directory per leaf, named by the lowercase hex
//! rendering of the leaf's path. Inside each leaf directory the logical
//! files (points, lines, ...) are named through a configurable table shared
//! by the whole run. The layout itself is stateless; everything is derived
//! from the tree and the naming convention.

use crate::error::{Result, ShardError};
use crate::tree::{Envelope, NodePath, path};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-tree metadata file.
pub const METADATA_FILE: &str = "tree.meta";

/// Logical role of a file within a leaf directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRole {
    Points,
    Lines,
    RelationsSimple,
    RelationsComplex,
    /// Points recovered by the closure extractor, merged and then removed.
    Recovered,
    /// Sorted missing-identifier list, consumed by the extractor.
    Missing,
}

/// Maps logical file roles to concrete filenames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTable {
    pub points: String,
    pub lines: String,
    pub unmatched_lines: String,
    pub unmatched_relations: String,
    pub relations_simple: String,
    pub relations_complex: String,
    pub recovered: String,
    pub missing: String,
}

impl Default for FileTable {
    fn default() -> Self {
        Self {
            points: "points".to_string(),
            lines: "lines".to_string(),
            unmatched_lines: "lines-unmatched".to_string(),
            unmatched_relations: "relations-unmatched".to_string(),
            relations_simple: "relations-simple".to_string(),
            relations_complex: "relations-complex".to_string(),
            recovered: "points-recovered".to_string(),
            missing: "ids-missing".to_string(),
        }
    }
}

impl FileTable {
    pub fn file_name(&self, role: FileRole) -> &str {
        match role {
            FileRole::Points => &self.points,
            FileRole::Lines => &self.lines,
            FileRole::RelationsSimple => &self.relations_simple,
            FileRole::RelationsComplex => &self.relations_complex,
            FileRole::Recovered => &self.recovered,
            FileRole::Missing => &self.missing,
        }
    }
}

/// Handle to a shard base directory.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    base: PathBuf,
    files: FileTable,
}

impl ShardLayout {
    /// Create a fresh layout. The base directory must not exist or must be
    /// empty; anything else is fatal before any write happens.
    pub fn create(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        if base.exists() {
            if !base.is_dir() {
                return Err(ShardError::Precondition(format!(
                    "output path {base:?} exists and is not a directory"
                )));
            }
            if fs::read_dir(&base)?.next().is_some() {
                return Err(ShardError::Precondition(format!(
                    "output directory {base:?} is not empty"
                )));
            }
        } else {
            fs::create_dir_all(&base)?;
        }
        Ok(Self {
            base,
            files: FileTable::default(),
        })
    }

    /// Open an existing layout for reconstruction or repair.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        if !base.is_dir() {
            return Err(ShardError::Precondition(format!(
                "shard directory {base:?} does not exist"
            )));
        }
        Ok(Self {
            base,
            files: FileTable::default(),
        })
    }

    pub fn with_file_table(mut self, files: FileTable) -> Self {
        self.files = files;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn file_table(&self) -> &FileTable {
        &self.files
    }

    /// Directory for one leaf: `<base>/<hex-path>`.
    pub fn leaf_dir(&self, leaf: NodePath) -> PathBuf {
        self.base.join(path::to_hex(leaf))
    }

    /// Create the leaf directory if needed and return it.
    pub fn ensure_leaf_dir(&self, leaf: NodePath) -> Result<PathBuf> {
        let dir = self.leaf_dir(leaf);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Concrete path of a logical file within a leaf directory.
    pub fn leaf_file(&self, leaf: NodePath, role: FileRole) -> PathBuf {
        self.leaf_dir(leaf).join(self.files.file_name(role))
    }

    /// The run-global overflow file for polylines with no resolvable points.
    pub fn unmatched_file(&self) -> PathBuf {
        self.base.join(&self.files.unmatched_lines)
    }

    /// Overflow file for unresolvable entities of the given role. Lines and
    /// simple relations keep separate overflow streams.
    pub fn overflow_file(&self, role: FileRole) -> PathBuf {
        match role {
            FileRole::RelationsSimple | FileRole::RelationsComplex => {
                self.base.join(&self.files.unmatched_relations)
            }
            _ => self.base.join(&self.files.unmatched_lines),
        }
    }

    /// Enumerate leaf paths from the hex-named sub-directories. Unexpected
    /// names are logged as warnings and skipped.
    pub fn leaf_dirs(&self) -> Result<Vec<NodePath>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match path::from_hex(&name) {
                Some(p) => paths.push(p),
                None => warn!("skipping unexpected directory name '{name}' in {:?}", self.base),
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Write the tree metadata file with the root bounding box.
    pub fn write_bbox(&self, bbox: &Envelope) -> Result<()> {
        let text = format!(
            "bbox: {},{},{},{}\n",
            bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat
        );
        fs::write(self.base.join(METADATA_FILE), text)?;
        Ok(())
    }

    /// Read the root bounding box back from the metadata file.
    pub fn read_bbox(&self) -> Result<Envelope> {
        let meta_path = self.base.join(METADATA_FILE);
        let text = fs::read_to_string(&meta_path).map_err(|e| ShardError::Metadata {
            path: meta_path.clone(),
            reason: e.to_string(),
        })?;

        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("bbox:") {
                let parts: Vec<&str> = rest.trim().split(',').collect();
                if parts.len() != 4 {
                    return Err(ShardError::Metadata {
                        path: meta_path,
                        reason: format!("bbox line has {} fields, expected 4", parts.len()),
                    });
                }
                let mut values = [0.0f64; 4];
                for (slot, part) in values.iter_mut().zip(&parts) {
                    *slot = part.trim().parse().map_err(|_| ShardError::Metadata {
                        path: meta_path.clone(),
                        reason: format!("unparseable bbox value '{part}'"),
                    })?;
                }
                return Ok(Envelope::new(values[0], values[1], values[2], values[3]));
            }
        }

        Err(ShardError::Metadata {
            path: meta_path,
            reason: "no bbox line".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_requires_empty_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale"), b"x").unwrap();
        let err = ShardLayout::create(dir.path()).unwrap_err();
        assert!(matches!(err, ShardError::Precondition(_)));
    }

    #[test]
    fn test_create_fresh_and_open() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("out");
        let layout = ShardLayout::create(&base).unwrap();
        assert!(base.is_dir());
        assert!(ShardLayout::open(layout.base()).is_ok());
        assert!(ShardLayout::open(dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_leaf_paths_and_files() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        assert!(layout.leaf_dir(10).ends_with("a"));
        assert!(layout.leaf_dir(255).ends_with("ff"));
        let file = layout.leaf_file(10, FileRole::Points);
        assert!(file.ends_with("a/points"));
    }

    #[test]
    fn test_bbox_round_trip_exact() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        let bbox = Envelope::new(-180.0, -90.0, 179.999999993, 85.0511287798066);
        layout.write_bbox(&bbox).unwrap();
        let back = layout.read_bbox().unwrap();
        assert_eq!(back, bbox);
    }

    #[test]
    fn test_missing_metadata_is_error() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        assert!(matches!(
            layout.read_bbox().unwrap_err(),
            ShardError::Metadata { .. }
        ));
    }

    #[test]
    fn test_leaf_dirs_skips_unexpected_names() {
        let dir = TempDir::new().unwrap();
        let layout = ShardLayout::create(dir.path().join("out")).unwrap();
        layout.ensure_leaf_dir(2).unwrap();
        layout.ensure_leaf_dir(3).unwrap();
        std::fs::create_dir(layout.base().join("not-hex")).unwrap();
        std::fs::write(layout.base().join("afile"), b"x").unwrap();

        let dirs = layout.leaf_dirs().unwrap();
        assert_eq!(dirs, vec![2, 3]);
    }
}
