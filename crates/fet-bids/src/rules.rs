//! Builders for the rule sets that turn engine output paths into a BIDS
//! derivatives tree.

use crate::entities::EntityTuple;
use crate::error::Result;
use crate::remap::{RuleSet, RuleTable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const DEFAULT_SUBS: &str = include_str!("../defaults/subs.json");
const DEFAULT_REGEX_SUBS: &str = include_str!("../defaults/regex_subs.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Preprocessing,
    Reconstruction,
    Segmentation,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Preprocessing => "preprocessing",
            Step::Reconstruction => "reconstruction",
            Step::Segmentation => "segmentation",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "preprocessing" => Ok(Step::Preprocessing),
            "reconstruction" => Ok(Step::Reconstruction),
            "segmentation" => Ok(Step::Segmentation),
            other => Err(format!("unknown step: {}", other)),
        }
    }
}

fn split_methods(pipeline_name: &str) -> (&str, Option<&str>) {
    match pipeline_name.split_once('_') {
        Some((recon, rest)) => (recon, rest.split('_').next().filter(|s| !s.is_empty())),
        None => (pipeline_name, None),
    }
}

/// Splits `<recon>_<seg>` into its methods; a name without `_` is a
/// reconstruction-only pipeline.
pub fn split_pipeline_name(pipeline_name: &str) -> (String, Option<String>) {
    let (recon, seg) = split_methods(pipeline_name);
    (recon.to_string(), seg.map(str::to_string))
}

/// `derivatives/<pipeline>/<step>`
pub fn derivatives_container(pipeline_name: &str, step: Step) -> PathBuf {
    Path::new("derivatives").join(pipeline_name).join(step.as_str())
}

#[derive(Debug, Clone)]
pub struct BidsRuleParams<'a> {
    pub subjects: &'a [String],
    pub sessions: Option<&'a [String]>,
    pub step: Step,
    pub datatype: &'a str,
    pub recon_method: Option<&'a str>,
    pub seg_method: Option<&'a str>,
    pub extra_literal: Option<&'a RuleTable>,
    pub extra_pattern: Option<&'a RuleTable>,
}

impl<'a> BidsRuleParams<'a> {
    pub fn new(subjects: &'a [String], step: Step) -> Self {
        Self {
            subjects,
            sessions: None,
            step,
            datatype: "anat",
            recon_method: None,
            seg_method: None,
            extra_literal: None,
            extra_pattern: None,
        }
    }

    /// Fills unset methods from a `<recon>_<seg>` pipeline name.
    pub fn with_pipeline_name(mut self, pipeline_name: &'a str) -> Self {
        let (recon, seg) = split_methods(pipeline_name);
        if self.recon_method.is_none() {
            self.recon_method = Some(recon);
        }
        if self.seg_method.is_none() {
            self.seg_method = seg;
        }
        self
    }
}

fn step_dirs(step: Step) -> Vec<&'static str> {
    let mut dirs = vec!["stacks", "masks"];
    match step {
        Step::Reconstruction => dirs.push("reconstruction"),
        Step::Segmentation => dirs.push("segmentation"),
        Step::Preprocessing => {}
    }
    dirs
}

fn method_tag(recon: &str, seg: Option<&str>) -> String {
    match seg {
        Some(seg) => format!("_rec-{recon}_seg-{seg}"),
        None => format!("_rec-{recon}"),
    }
}

/// `/sub-<s>/ses-<e>/<dt>/sub-<s>_ses-<e>/`, or the session-less form.
fn bids_prefix(dt: &str, sub: &str, ses: Option<&str>) -> String {
    match ses {
        Some(ses) => format!("/sub-{sub}/ses-{ses}/{dt}/sub-{sub}_ses-{ses}/"),
        None => format!("/sub-{sub}/{dt}/sub-{sub}/"),
    }
}

/// Any run of engine annotation tokens such as `_acquisition_haste`.
const ANY_TOKENS: &str = r"(?:_[a-z]+_[^/_]+)*";

/// Matches an engine iteration folder naming this subject (and session),
/// whatever the token order.
fn annotation_pattern(sub: &str, ses: Option<&str>) -> String {
    let sub_tok = format!("_subject_{}", regex::escape(sub));
    match ses {
        Some(ses) => {
            let ses_tok = format!("_session_{}", regex::escape(ses));
            format!("{a}(?:{sub_tok}{a}{ses_tok}|{ses_tok}{a}{sub_tok}){a}", a = ANY_TOKENS)
        }
        None => format!("{a}{sub_tok}{a}", a = ANY_TOKENS),
    }
}

/// Rules mapping the engine's step directories, iteration annotations
/// and generic file names onto `sub-<s>/ses-<e>/<datatype>/...`.
///
/// A step directory is only rewritten when an engine segment (`_...`)
/// follows it, so paths already under `derivatives/<pipeline>/<step>/sub-*`
/// are left alone. Annotated folders (`_session_<e>_subject_<s>`) are
/// attributed to their own subject and session. Bare folders such as
/// `stacks/_denoising3` carry no entities and are only mapped when a
/// single subject/session combination is requested.
pub fn build_bids_rules(params: &BidsRuleParams<'_>) -> Result<RuleSet> {
    let mut rules = RuleSet::new();
    let dt = params.datatype;
    let sessions = params.sessions.filter(|s| !s.is_empty());
    let dirs = step_dirs(params.step);

    let mut combos: Vec<(&str, Option<&str>)> = Vec::new();
    for sub in params.subjects {
        match sessions {
            Some(sessions) => {
                combos.extend(sessions.iter().map(|ses| (sub.as_str(), Some(ses.as_str()))))
            }
            None => combos.push((sub.as_str(), None)),
        }
    }

    if let [(sub, ses)] = combos.as_slice() {
        let prefix = bids_prefix(dt, sub, *ses);
        for dir in &dirs {
            rules.push_literal(&format!("/{dir}/_"), &format!("{prefix}_"))?;
        }
    }

    let recon = params.recon_method.unwrap_or("unknown");
    let tag = method_tag(recon, params.seg_method);
    match params.step {
        Step::Reconstruction => {
            rules.push_literal("_recon.nii.gz", &format!("_rec-{recon}_T2w.nii.gz"))?;
            rules.push_literal("_recon_mask.nii.gz", &format!("_rec-{recon}_mask.nii.gz"))?;
        }
        Step::Segmentation => {
            rules.push_literal("_seg.nii.gz", &format!("{tag}_dseg.nii.gz"))?;
            rules.push_literal("_all_labels.nii.gz", &format!("{tag}_labels.nii.gz"))?;
        }
        Step::Preprocessing => {}
    }

    if let Some(extra) = params.extra_literal {
        rules.extend_literals(extra)?;
    }

    let dir_alt = dirs.join("|");
    for (sub, ses) in &combos {
        rules.push_pattern(
            &format!("/(?:{dir_alt})/{}/", annotation_pattern(sub, *ses)),
            &bids_prefix(dt, sub, *ses),
        )?;
    }

    rules.push_pattern(r"_subject_[^/]+", "")?;
    rules.push_pattern(r"_session_[^/]+", "")?;
    rules.push_pattern(r"_acquisition_[^/]+", "")?;
    rules.push_pattern(r"//+", "/")?;
    rules.push_pattern(r"/_(?:denoising|cropping)\d+/", "/")?;
    // An engine file name starting with `_` completes the entity prefix.
    rules.push_pattern(r"/(sub-[^/]+)/_", r"/\1_")?;
    rules.push_pattern(
        r"(sub-[^/_]+)_(ses-[^/_]+)_(recon\.nii\.gz)",
        &format!(r"\1_\2_rec-{recon}_T2w.nii.gz"),
    )?;
    rules.push_pattern(
        r"(sub-[^/_]+)_(ses-[^/_]+)_(recon_mask\.nii\.gz)",
        &format!(r"\1_\2_rec-{recon}_mask.nii.gz"),
    )?;
    let dt_re = regex::escape(dt);
    rules.push_pattern(
        &format!(r"/(sub-[^/]+)/(ses-[^/]+)/{dt_re}/{dt_re}/"),
        &format!(r"/\1/\2/{dt}/"),
    )?;
    rules.push_pattern(
        &format!(r"/(sub-[^/]+)/{dt_re}/{dt_re}/"),
        &format!(r"/\1/{dt}/"),
    )?;
    rules.push_pattern(r"__+", "_")?;
    rules.push_pattern(r"(\.nii\.gz)\.nii\.gz", r"\1")?;

    if let Some(extra) = params.extra_pattern {
        rules.extend_patterns(extra)?;
    }

    debug!(
        step = %params.step,
        literals = rules.literals().len(),
        patterns = rules.patterns().len(),
        "built BIDS derivative rules"
    );
    Ok(rules)
}

/// Default literal and pattern tables of the static rule builder.
#[derive(Debug, Clone)]
pub struct DefaultTables {
    pub literal: RuleTable,
    pub pattern: RuleTable,
}

impl DefaultTables {
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            literal: RuleTable::from_json_str(DEFAULT_SUBS)?,
            pattern: RuleTable::from_json_str(DEFAULT_REGEX_SUBS)?,
        })
    }

    pub fn load(literal_path: &Path, pattern_path: &Path) -> Result<Self> {
        Ok(Self {
            literal: RuleTable::load(literal_path)?,
            pattern: RuleTable::load(pattern_path)?,
        })
    }

    /// Copy whose `_dseg` / `_labels` targets carry the method tag, as in
    /// `_rec-nesvor_seg-bounti_dseg.nii.gz`.
    pub fn with_method_tags(&self, recon: &str, seg: Option<&str>) -> Self {
        let tag = method_tag(recon, seg);
        let pattern = RuleTable::from_pairs(self.pattern.iter().map(|(from, to)| {
            let to = to
                .replace("_dseg.nii.gz", &format!("{tag}_dseg.nii.gz"))
                .replace("_labels.nii.gz", &format!("{tag}_labels.nii.gz"));
            (from.to_string(), to)
        }));
        Self {
            literal: self.literal.clone(),
            pattern,
        }
    }
}

/// One folder rule per tuple, then the default tables with `overrides_*`
/// merged on top.
pub fn build_static_rules_with(
    tuples: &[EntityTuple],
    defaults: &DefaultTables,
    overrides_literal: Option<&RuleTable>,
    overrides_pattern: Option<&RuleTable>,
) -> Result<RuleSet> {
    let mut rules = RuleSet::new();
    for tuple in tuples {
        rules.push_literal(
            &format!("{}/", tuple.engine_folder()),
            &format!("{}/", tuple.bids_dir("anat")),
        )?;
    }

    let empty = RuleTable::new();
    rules.extend_literals(&defaults.literal.merged(overrides_literal.unwrap_or(&empty)))?;
    rules.extend_patterns(&defaults.pattern.merged(overrides_pattern.unwrap_or(&empty)))?;

    debug!(
        tuples = tuples.len(),
        literals = rules.literals().len(),
        patterns = rules.patterns().len(),
        "built static rules"
    );
    Ok(rules)
}

pub fn build_static_rules(
    tuples: &[EntityTuple],
    overrides_literal: Option<&RuleTable>,
    overrides_pattern: Option<&RuleTable>,
) -> Result<RuleSet> {
    build_static_rules_with(
        tuples,
        &DefaultTables::builtin()?,
        overrides_literal,
        overrides_pattern,
    )
}
