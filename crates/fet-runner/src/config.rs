use anyhow::{anyhow, Context, Result};
use fet_bids::RuleTable;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::command::ResolveConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub pipeline: String,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub path_to_output: Option<String>,
}

impl StageConfig {
    pub fn resolve_config(&self) -> ResolveConfig {
        ResolveConfig {
            path_to_output: self.path_to_output.clone(),
        }
    }

    pub fn command(&self, stage: &str) -> Result<&str> {
        self.cmd
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("{}.cmd is not defined for pipeline {}", stage, self.pipeline))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub reconstruction: StageConfig,
    pub segmentation: StageConfig,
    /// Literal overrides for the static rule tables.
    #[serde(default)]
    pub subs: RuleTable,
    /// Pattern overrides for the static rule tables.
    #[serde(default)]
    pub regex_subs: RuleTable,
}

fn check_method_name(stage: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("{}.pipeline must not be empty", stage));
    }
    if name.contains('_') || name.contains('/') {
        return Err(anyhow!(
            "{}.pipeline '{}' must not contain '_' or '/'",
            stage,
            name
        ));
    }
    Ok(())
}

impl PipelineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let cfg: PipelineConfig = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        check_method_name("reconstruction", &self.reconstruction.pipeline)?;
        check_method_name("segmentation", &self.segmentation.pipeline)?;
        fet_bids::RuleSet::new().extend_patterns(&self.regex_subs)?;
        Ok(())
    }

    /// `<recon>_<seg>`
    pub fn pipeline_name(&self) -> String {
        format!(
            "{}_{}",
            self.reconstruction.pipeline, self.segmentation.pipeline
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = r#"
reconstruction:
  pipeline: nesvor
segmentation:
  pipeline: bounti
  cmd: "docker run --rm <mount> fetalsynthseg <input_dir> <output_dir>"
  path_to_output: "input_srr-mask-brain_bounti-19.nii.gz"
subs:
  seg.nii.gz: dseg.nii.gz
regex_subs:
  "_run-(\\d+)": "_run-\\1"
"#;

    #[test]
    fn parses_and_names_pipeline() {
        let cfg = PipelineConfig::from_yaml_str(CFG).expect("config");
        assert_eq!(cfg.pipeline_name(), "nesvor_bounti");
        assert!(cfg.reconstruction.cmd.is_none());
        assert!(cfg.reconstruction.command("reconstruction").is_err());
        assert!(cfg.segmentation.command("segmentation").unwrap().contains("<mount>"));
        assert_eq!(cfg.subs.get("seg.nii.gz"), Some("dseg.nii.gz"));
        assert_eq!(cfg.regex_subs.len(), 1);
        assert_eq!(
            cfg.segmentation.resolve_config().path_to_output.as_deref(),
            Some("input_srr-mask-brain_bounti-19.nii.gz")
        );
    }

    #[test]
    fn rejects_ambiguous_method_names() {
        let raw = "reconstruction: {pipeline: nes_vor}\nsegmentation: {pipeline: bounti}\n";
        let err = PipelineConfig::from_yaml_str(raw).expect_err("underscore must be refused");
        assert!(err.to_string().contains("nes_vor"));
    }

    #[test]
    fn rejects_malformed_regex_overrides() {
        let raw = "reconstruction: {pipeline: nesvor}\nsegmentation: {pipeline: bounti}\nregex_subs: {\"(\": x}\n";
        assert!(PipelineConfig::from_yaml_str(raw).is_err());
    }
}
