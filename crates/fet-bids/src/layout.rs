//! Minimal filesystem index of a BIDS dataset.
//!
//! Only what the pipeline needs: which subjects, sessions and
//! acquisitions exist, and which NIfTI volumes belong to an entity tuple.

use crate::entities::{EntityCatalogue, EntityTuple};
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidsFile {
    pub path: PathBuf,
    pub entities: BTreeMap<String, String>,
    pub suffix: String,
    pub datatype: String,
}

impl BidsFile {
    pub fn subject(&self) -> Option<&str> {
        self.entities.get("sub").map(String::as_str)
    }

    pub fn session(&self) -> Option<&str> {
        self.entities.get("ses").map(String::as_str)
    }

    pub fn acquisition(&self) -> Option<&str> {
        self.entities.get("acq").map(String::as_str)
    }

    fn matches(&self, tuple: &EntityTuple) -> bool {
        self.subject() == Some(tuple.subject.as_str())
            && self.session() == tuple.session.as_deref()
            && self.acquisition() == tuple.acquisition.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BidsLayout {
    root: PathBuf,
    files: Vec<BidsFile>,
}

const NIFTI_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// Splits `sub-01_ses-02_acq-haste_T2w.nii.gz` into its key-value
/// entities and trailing suffix. Names that are not BIDS-shaped yield
/// `None`.
pub fn parse_filename(name: &str) -> Option<(BTreeMap<String, String>, String)> {
    let stem = NIFTI_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))?;
    let mut parts: Vec<&str> = stem.split('_').collect();
    let suffix = parts.pop()?;
    if suffix.is_empty() || suffix.contains('-') {
        return None;
    }
    let mut entities = BTreeMap::new();
    for part in parts {
        let (key, value) = part.split_once('-')?;
        if key.is_empty() || value.is_empty() {
            return None;
        }
        entities.insert(key.to_string(), value.to_string());
    }
    if !entities.contains_key("sub") {
        return None;
    }
    Some((entities, suffix.to_string()))
}

impl BidsLayout {
    pub fn scan(root: &Path) -> Result<Self> {
        let walker = walkdir::WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !(e.depth() == 1 && name == "derivatives")
            });

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some((entities, suffix)) = parse_filename(&name) else {
                continue;
            };
            let datatype = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            files.push(BidsFile {
                path: entry.path().to_path_buf(),
                entities,
                suffix,
                datatype,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(root = %root.display(), files = files.len(), "indexed BIDS layout");
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[BidsFile] {
        &self.files
    }

    /// Volumes of one entity tuple with the given datatype and suffix.
    pub fn query(&self, tuple: &EntityTuple, datatype: &str, suffix: &str) -> Vec<&BidsFile> {
        self.files
            .iter()
            .filter(|f| f.datatype == datatype && f.suffix == suffix && f.matches(tuple))
            .collect()
    }

    fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for v in values {
            if !out.iter().any(|o| o == v) {
                out.push(v.to_string());
            }
        }
        out.sort();
        out
    }
}

impl EntityCatalogue for BidsLayout {
    fn subjects(&self) -> Vec<String> {
        Self::distinct(self.files.iter().filter_map(BidsFile::subject))
    }

    fn sessions(&self, subject: &str) -> Vec<String> {
        Self::distinct(
            self.files
                .iter()
                .filter(|f| f.subject() == Some(subject))
                .filter_map(BidsFile::session),
        )
    }

    fn acquisitions(&self, subject: &str, session: Option<&str>) -> Vec<String> {
        Self::distinct(
            self.files
                .iter()
                .filter(|f| f.subject() == Some(subject) && f.session() == session)
                .filter_map(BidsFile::acquisition),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::enumerate;
    use chrono::Utc;
    use std::fs;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fet_layout_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"").expect("write");
    }

    #[test]
    fn parse_filename_extracts_entities_and_suffix() {
        let (entities, suffix) =
            parse_filename("sub-01_ses-02_acq-haste_run-1_T2w.nii.gz").expect("parsed");
        assert_eq!(suffix, "T2w");
        assert_eq!(entities.get("acq").map(String::as_str), Some("haste"));
        assert_eq!(entities.get("run").map(String::as_str), Some("1"));
        assert!(parse_filename("notes.txt").is_none());
        assert!(parse_filename("ses-01_T2w.nii").is_none());
        assert!(parse_filename("sub-01_ses-02.nii.gz").is_none());
    }

    #[test]
    fn scan_indexes_raw_data_only() {
        let root = scratch("scan");
        touch(&root, "sub-01/ses-01/anat/sub-01_ses-01_acq-haste_run-1_T2w.nii.gz");
        touch(&root, "sub-01/ses-01/anat/sub-01_ses-01_acq-tru_run-1_T2w.nii.gz");
        touch(&root, "sub-01/ses-02/anat/sub-01_ses-02_run-1_T2w.nii.gz");
        touch(&root, "sub-02/anat/sub-02_run-1_T2w.nii");
        touch(&root, "derivatives/x/sub-09/anat/sub-09_T2w.nii.gz");
        touch(&root, ".cache/sub-08_T2w.nii.gz");

        let layout = BidsLayout::scan(&root).expect("scan");
        assert_eq!(layout.subjects(), vec!["01".to_string(), "02".to_string()]);
        assert_eq!(layout.sessions("01"), vec!["01".to_string(), "02".to_string()]);
        assert!(layout.sessions("02").is_empty());
        assert_eq!(
            layout.acquisitions("01", Some("01")),
            vec!["haste".to_string(), "tru".to_string()]
        );

        let tuples = enumerate(&layout, None, None, None);
        assert_eq!(
            tuples,
            vec![
                EntityTuple::new("01", Some("01"), Some("haste")),
                EntityTuple::new("01", Some("01"), Some("tru")),
                EntityTuple::new("01", Some("02"), None),
                EntityTuple::new("02", None, None),
            ]
        );

        let hits = layout.query(&tuples[3], "anat", "T2w");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].path.ends_with("sub-02/anat/sub-02_run-1_T2w.nii"));
        let _ = fs::remove_dir_all(root);
    }
}
