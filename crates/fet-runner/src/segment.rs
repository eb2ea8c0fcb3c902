use anyhow::{anyhow, Result};
use fet_bids::{
    build_static_rules_with, check_reconstructed_dataset, enumerate, write_dataset_description,
    BidsLayout, DefaultTables, EntityTuple,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::command::CommandResolver;
use crate::config::PipelineConfig;

#[derive(Debug, Clone, Default)]
pub struct SegmentationRequest {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub sessions: Option<Vec<String>>,
    pub acquisitions: Option<Vec<String>>,
    pub ignore_checks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Written,
    MissingOutput,
    NoInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationOutcome {
    pub tuple: EntityTuple,
    pub input: Option<PathBuf>,
    pub artifact: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub status: OutcomeStatus,
}

impl SegmentationOutcome {
    fn no_input(tuple: &EntityTuple) -> Self {
        Self {
            tuple: tuple.clone(),
            input: None,
            artifact: None,
            destination: None,
            status: OutcomeStatus::NoInput,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationRun {
    pub derivatives_dir: PathBuf,
    pub tuples: Vec<EntityTuple>,
    pub outcomes: Vec<SegmentationOutcome>,
}

impl SegmentationRun {
    pub fn written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Written)
            .count()
    }
}

/// Runs the segmentation command on every reconstructed volume of the
/// selected tuples and files the results under `out_dir/<seg pipeline>`.
pub fn run_segmentation(cfg: &PipelineConfig, req: &SegmentationRequest) -> Result<SegmentationRun> {
    let template = cfg.segmentation.command("segmentation")?;
    if !req.ignore_checks {
        let method = check_reconstructed_dataset(&req.data_dir)?;
        info!(method = %method, "input dataset is a reconstruction");
    }

    let layout = BidsLayout::scan(&req.data_dir)?;
    let tuples = enumerate(
        &layout,
        req.subjects.as_deref(),
        req.sessions.as_deref(),
        req.acquisitions.as_deref(),
    );
    if tuples.is_empty() {
        return Err(anyhow!(
            "no subjects to process in {}",
            req.data_dir.display()
        ));
    }

    let seg_pipeline = &cfg.segmentation.pipeline;
    let derivatives_dir = req.out_dir.join(seg_pipeline);
    fs::create_dir_all(&derivatives_dir)?;
    let prev_desc = req.data_dir.join(fet_bids::description::DESCRIPTION_FILE);
    let stage_cfg = serde_json::to_value(&cfg.segmentation)?;
    write_dataset_description(
        &derivatives_dir,
        seg_pipeline,
        prev_desc.exists().then_some(prev_desc.as_path()),
        Some(&stage_cfg),
    )?;

    let tables = DefaultTables::builtin()?.with_method_tags(
        &cfg.reconstruction.pipeline,
        Some(cfg.segmentation.pipeline.as_str()),
    );
    let rules = build_static_rules_with(&tuples, &tables, Some(&cfg.subs), Some(&cfg.regex_subs))?;
    let resolver = CommandResolver::new(&req.work_dir, "segmentation");
    let resolve_cfg = cfg.segmentation.resolve_config();

    let mut outcomes = Vec::new();
    for tuple in &tuples {
        let inputs = layout.query(tuple, "anat", "T2w");
        if inputs.is_empty() {
            warn!(folder = %tuple.engine_folder(), "no T2w volume found");
            outcomes.push(SegmentationOutcome::no_input(tuple));
            continue;
        }
        if inputs.len() > 1 {
            warn!(
                folder = %tuple.engine_folder(),
                count = inputs.len(),
                "several T2w volumes match; later outputs overwrite earlier ones"
            );
        }
        for file in inputs {
            let artifact = resolver.run(&file.path, template, &resolve_cfg)?;
            if !artifact.exists() {
                warn!(
                    input = %file.path.display(),
                    expected = %artifact.display(),
                    "segmentation produced no output"
                );
                outcomes.push(SegmentationOutcome {
                    tuple: tuple.clone(),
                    input: Some(file.path.clone()),
                    artifact: Some(artifact),
                    destination: None,
                    status: OutcomeStatus::MissingOutput,
                });
                continue;
            }
            let destination = derivatives_dir.join(remapped_name(&rules, tuple, &artifact));
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&artifact, &destination)?;
            info!(destination = %destination.display(), "wrote segmentation");
            outcomes.push(SegmentationOutcome {
                tuple: tuple.clone(),
                input: Some(file.path.clone()),
                artifact: Some(artifact),
                destination: Some(destination),
                status: OutcomeStatus::Written,
            });
        }
    }

    Ok(SegmentationRun {
        derivatives_dir,
        tuples,
        outcomes,
    })
}

fn remapped_name(rules: &fet_bids::RuleSet, tuple: &EntityTuple, artifact: &Path) -> String {
    let file_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let internal = format!("{}/{}", tuple.engine_folder(), file_name);
    rules.apply(&internal).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fet_segment_{}_{}_{}",
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
        fs::write(path, b"srr").expect("write");
    }

    fn config(cmd: &str) -> PipelineConfig {
        PipelineConfig::from_yaml_str(&format!(
            "reconstruction: {{pipeline: nesvor}}\nsegmentation: {{pipeline: bounti, cmd: '{}'}}\n",
            cmd
        ))
        .expect("config")
    }

    #[test]
    fn segments_every_tuple_into_bids_tree() {
        let root = scratch("ok");
        let data = root.join("data");
        touch(&data, "sub-01/ses-01/anat/sub-01_ses-01_rec-nesvor_T2w.nii.gz");
        touch(&data, "sub-02/anat/sub-02_rec-nesvor_T2w.nii.gz");
        write_dataset_description(&data, "nesvor", None, None).expect("desc");

        let req = SegmentationRequest {
            data_dir: data.clone(),
            out_dir: root.join("out"),
            work_dir: root.join("work"),
            ..Default::default()
        };
        let run = run_segmentation(&config("cp <input_vol> <output_seg>"), &req).expect("run");
        assert_eq!(run.tuples.len(), 2);
        assert_eq!(run.written(), 2);
        assert!(run
            .derivatives_dir
            .join("sub-01/ses-01/anat/sub-01_ses-01_rec-nesvor_seg-bounti_dseg.nii.gz")
            .exists());
        assert!(run
            .derivatives_dir
            .join("sub-02/anat/sub-02_rec-nesvor_seg-bounti_dseg.nii.gz")
            .exists());
        let desc = fs::read_to_string(run.derivatives_dir.join("dataset_description.json"))
            .expect("description");
        assert!(desc.contains("\"nesvor\""));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_output_and_missing_input_are_reported() {
        let root = scratch("miss");
        let data = root.join("data");
        touch(&data, "sub-01/anat/sub-01_T2w.nii.gz");
        let req = SegmentationRequest {
            data_dir: data.clone(),
            out_dir: root.join("out"),
            work_dir: root.join("work"),
            subjects: Some(vec!["01".to_string(), "99".to_string()]),
            ignore_checks: true,
            ..Default::default()
        };
        let run = run_segmentation(&config("true <input_vol>"), &req).expect("run");
        let statuses: Vec<OutcomeStatus> = run.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![OutcomeStatus::MissingOutput, OutcomeStatus::NoInput]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unreconstructed_input_is_refused() {
        let root = scratch("raw");
        let data = root.join("data");
        touch(&data, "sub-01/anat/sub-01_T2w.nii.gz");
        let req = SegmentationRequest {
            data_dir: data,
            out_dir: root.join("out"),
            work_dir: root.join("work"),
            ..Default::default()
        };
        assert!(run_segmentation(&config("true"), &req).is_err());
        assert!(!root.join("out").exists());
        let _ = fs::remove_dir_all(root);
    }
}
