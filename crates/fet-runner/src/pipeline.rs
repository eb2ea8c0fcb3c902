//! Reconstruction followed by segmentation over a raw BIDS dataset. Every
//! product is filed under `derivatives/<recon>_<seg>/<step>/`.

use anyhow::{anyhow, Result};
use fet_bids::{
    build_bids_rules, derivatives_container, enumerate, write_dataset_description, BidsLayout,
    BidsRuleParams, EntityTuple, RuleSet, Step,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::command::CommandResolver;
use crate::config::PipelineConfig;
use crate::segment::OutcomeStatus;

/// Default `<output_seg>` file name of the reconstruction stage.
pub const RECON_OUTPUT_NAME: &str = "srr.nii.gz";

#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub subjects: Option<Vec<String>>,
    pub sessions: Option<Vec<String>>,
    pub acquisitions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub artifact: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub status: OutcomeStatus,
}

impl StageOutcome {
    fn skipped() -> Self {
        Self {
            artifact: None,
            destination: None,
            status: OutcomeStatus::NoInput,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub tuple: EntityTuple,
    pub stacks: Vec<PathBuf>,
    pub reconstruction: StageOutcome,
    /// `None` when the config defines no segmentation command.
    pub segmentation: Option<StageOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub pipeline_name: String,
    pub derivatives_dir: PathBuf,
    pub tuples: Vec<EntityTuple>,
    pub outcomes: Vec<PipelineOutcome>,
}

impl PipelineRun {
    /// Products of `step` filed by this run.
    pub fn written(&self, step: Step) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| match step {
                Step::Reconstruction => Some(&o.reconstruction),
                Step::Segmentation => o.segmentation.as_ref(),
                Step::Preprocessing => None,
            })
            .filter(|s| s.status == OutcomeStatus::Written)
            .count()
    }
}

/// Where one step files its products and how engine paths map there.
struct StepSink<'a> {
    step: Step,
    container: PathBuf,
    pipeline_name: &'a str,
    /// Generic engine file name the step's rules rename.
    engine_name: &'static str,
}

impl StepSink<'_> {
    fn rules_for(&self, tuple: &EntityTuple) -> Result<RuleSet> {
        let subjects = vec![tuple.subject.clone()];
        let sessions: Vec<String> = tuple.session.iter().cloned().collect();
        let params = BidsRuleParams {
            sessions: Some(sessions.as_slice()),
            ..BidsRuleParams::new(&subjects, self.step)
        }
        .with_pipeline_name(self.pipeline_name);
        Ok(build_bids_rules(&params)?)
    }

    /// Relative destination of `tuple`'s product, e.g.
    /// `derivatives/nesvor_bounti/segmentation/sub-01/ses-02/anat/sub-01_ses-02_rec-nesvor_seg-bounti_dseg.nii.gz`.
    fn destination(&self, tuple: &EntityTuple) -> Result<String> {
        let engine_path = format!(
            "{}/{}/{}/{}",
            self.container.display(),
            self.step,
            tuple.engine_folder(),
            self.engine_name
        );
        Ok(self.rules_for(tuple)?.apply(&engine_path).into_owned())
    }

    fn file(
        &self,
        out_dir: &Path,
        tuple: &EntityTuple,
        artifact: PathBuf,
        filed: &mut HashSet<PathBuf>,
    ) -> Result<StageOutcome> {
        if !artifact.exists() {
            warn!(
                step = %self.step,
                folder = %tuple.engine_folder(),
                expected = %artifact.display(),
                "stage produced no output"
            );
            return Ok(StageOutcome {
                artifact: Some(artifact),
                destination: None,
                status: OutcomeStatus::MissingOutput,
            });
        }
        let destination = out_dir.join(self.destination(tuple)?);
        if !filed.insert(destination.clone()) {
            warn!(
                destination = %destination.display(),
                "several tuples map to the same derivative; keeping the last"
            );
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&artifact, &destination)?;
        info!(step = %self.step, destination = %destination.display(), "filed derivative");
        Ok(StageOutcome {
            artifact: Some(artifact),
            destination: Some(destination),
            status: OutcomeStatus::Written,
        })
    }
}

/// Reconstructs every selected tuple from its T2w stacks, then segments
/// each reconstruction when a segmentation command is configured.
pub fn run_pipeline(cfg: &PipelineConfig, req: &PipelineRequest) -> Result<PipelineRun> {
    let recon_cmd = cfg.reconstruction.command("reconstruction")?;
    let seg_cmd = cfg
        .segmentation
        .cmd
        .as_deref()
        .filter(|c| !c.trim().is_empty());
    if seg_cmd.is_none() {
        info!("segmentation.cmd is not defined; running reconstruction only");
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

    let pipeline_name = cfg.pipeline_name();
    let derivatives_dir = req.out_dir.join("derivatives").join(&pipeline_name);
    let prev_desc = req.data_dir.join(fet_bids::description::DESCRIPTION_FILE);
    let stage_cfg = json!({
        "reconstruction": &cfg.reconstruction,
        "segmentation": &cfg.segmentation,
    });
    write_dataset_description(
        &derivatives_dir,
        &pipeline_name,
        prev_desc.exists().then_some(prev_desc.as_path()),
        Some(&stage_cfg),
    )?;

    let recon_sink = StepSink {
        step: Step::Reconstruction,
        container: derivatives_container(&pipeline_name, Step::Reconstruction),
        pipeline_name: &pipeline_name,
        engine_name: "_recon.nii.gz",
    };
    let seg_sink = StepSink {
        step: Step::Segmentation,
        container: derivatives_container(&pipeline_name, Step::Segmentation),
        pipeline_name: &pipeline_name,
        engine_name: "_seg.nii.gz",
    };
    let recon_resolver =
        CommandResolver::new(&req.work_dir, "reconstruction").with_default_output(RECON_OUTPUT_NAME);
    let seg_resolver = CommandResolver::new(&req.work_dir, "segmentation");
    let recon_cfg = cfg.reconstruction.resolve_config();
    let seg_cfg = cfg.segmentation.resolve_config();

    let mut filed = HashSet::new();
    let mut outcomes = Vec::with_capacity(tuples.len());
    for tuple in &tuples {
        let stacks: Vec<PathBuf> = layout
            .query(tuple, "anat", "T2w")
            .into_iter()
            .map(|f| f.path.clone())
            .collect();
        if stacks.is_empty() {
            warn!(folder = %tuple.engine_folder(), "no T2w stacks found");
            outcomes.push(PipelineOutcome {
                tuple: tuple.clone(),
                stacks,
                reconstruction: StageOutcome::skipped(),
                segmentation: seg_cmd.map(|_| StageOutcome::skipped()),
            });
            continue;
        }

        let inputs: Vec<&Path> = stacks.iter().map(PathBuf::as_path).collect();
        let srr = recon_resolver.run_stacks(&inputs, recon_cmd, &recon_cfg)?;
        let reconstruction = recon_sink.file(&req.out_dir, tuple, srr.clone(), &mut filed)?;

        let segmentation = match seg_cmd {
            Some(cmd) if reconstruction.status == OutcomeStatus::Written => {
                let seg = seg_resolver.run(&srr, cmd, &seg_cfg)?;
                Some(seg_sink.file(&req.out_dir, tuple, seg, &mut filed)?)
            }
            Some(_) => Some(StageOutcome::skipped()),
            None => None,
        };

        outcomes.push(PipelineOutcome {
            tuple: tuple.clone(),
            stacks,
            reconstruction,
            segmentation,
        });
    }

    Ok(PipelineRun {
        pipeline_name,
        derivatives_dir,
        tuples,
        outcomes,
    })
}
