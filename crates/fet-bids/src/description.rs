use crate::error::{BidsError, Result};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

pub const DESCRIPTION_FILE: &str = "dataset_description.json";
pub const BIDS_VERSION: &str = "1.7.0";
pub const VALID_RECONSTRUCTION: [&str; 3] = ["nesvor", "niftymic", "svrtk"];

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_description(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Writes `dataset_description.json` into `out_dir` unless one is already
/// there. Returns whether a file was written.
///
/// `prev_desc` names the description of the dataset this one derives
/// from; its `Name` is appended to `GeneratedBy`. `config` is embedded
/// verbatim under `Config`.
pub fn write_dataset_description(
    out_dir: &Path,
    name: &str,
    prev_desc: Option<&Path>,
    config: Option<&Value>,
) -> Result<bool> {
    let path = out_dir.join(DESCRIPTION_FILE);
    if path.exists() {
        debug!(path = %path.display(), "dataset description already present");
        return Ok(false);
    }

    let mut generated_by = vec![json!({ "Name": name })];
    if let Some(prev) = prev_desc {
        let prev_value = read_description(prev)?;
        let prev_name = prev_value
            .get("Name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BidsError::InvalidDescription {
                path: prev.display().to_string(),
                message: "missing Name".to_string(),
            })?;
        generated_by.push(json!({ "Name": prev_name }));
    }

    let mut description = json!({
        "Name": name,
        "Version": "1.0",
        "BIDSVersion": BIDS_VERSION,
        "PipelineDescription": { "Name": name },
        "GeneratedBy": generated_by,
    });
    if let Some(cfg) = config {
        description["Config"] = cfg.clone();
    }

    atomic_write_bytes(&path, &serde_json::to_vec_pretty(&description)?)?;
    info!(path = %path.display(), "wrote dataset description");
    Ok(true)
}

/// Requires `data_dir` to be the output of a known reconstruction method,
/// judged by the `Name` of its dataset description. Returns that name.
pub fn check_reconstructed_dataset(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(DESCRIPTION_FILE);
    if !path.exists() {
        return Err(BidsError::InvalidDescription {
            path: path.display().to_string(),
            message: "file not found; provide a reconstructed BIDS directory".to_string(),
        });
    }
    let value = read_description(&path)?;
    let name = value.get("Name").and_then(|v| v.as_str()).unwrap_or("");
    if !VALID_RECONSTRUCTION.contains(&name) {
        return Err(BidsError::InvalidDescription {
            path: path.display().to_string(),
            message: format!(
                "method name <{}> is not a valid reconstruction method (expected one of {})",
                name,
                VALID_RECONSTRUCTION.join(", ")
            ),
        });
    }
    Ok(name.to_string())
}
