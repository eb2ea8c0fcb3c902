use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use fet_bids::{BidsLayout, BidsRuleParams, DefaultTables, EntityTuple, RuleTable, Step};
use fet_runner::{
    CommandResolver, PipelineConfig, PipelineRequest, ResolveConfig, SegmentationRequest,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fet", version = "0.3.0", about = "Fetal MRI pipeline I/O tooling")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StepArg {
    #[value(name = "preprocessing")]
    Preprocessing,
    #[value(name = "reconstruction")]
    Reconstruction,
    #[value(name = "segmentation")]
    Segmentation,
}

impl From<StepArg> for Step {
    fn from(value: StepArg) -> Self {
        match value {
            StepArg::Preprocessing => Step::Preprocessing,
            StepArg::Reconstruction => Step::Reconstruction,
            StepArg::Segmentation => Step::Segmentation,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the (subject, session, acquisition) tuples of a BIDS dataset.
    Enumerate {
        data: PathBuf,
        #[arg(long, num_args = 1..)]
        sub: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        ses: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        acq: Option<Vec<String>>,
        #[arg(long)]
        json: bool,
    },
    /// Stage an input volume and resolve (optionally run) a command template.
    Resolve {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        cmd: String,
        #[arg(long)]
        path_to_output: Option<String>,
        #[arg(long, default_value = "segmentation")]
        stage: String,
        #[arg(long, default_value = ".fet/work")]
        work_dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Map engine output paths onto BIDS derivative paths.
    Remap {
        paths: Vec<String>,
        #[arg(long, value_enum)]
        step: StepArg,
        #[arg(long, num_args = 1..)]
        sub: Vec<String>,
        #[arg(long, num_args = 1..)]
        ses: Vec<String>,
        #[arg(long, default_value = "anat")]
        datatype: String,
        #[arg(long)]
        pipeline_name: Option<String>,
        #[arg(long)]
        recon: Option<String>,
        #[arg(long)]
        seg: Option<String>,
        /// Extra literal rule, MATCH=REPLACEMENT.
        #[arg(long = "literal")]
        literal: Vec<String>,
        /// Extra pattern rule, PATTERN=REPLACEMENT.
        #[arg(long = "pattern")]
        pattern: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Map engine output paths using per-tuple folder rules and the
    /// default tables.
    RemapStatic {
        paths: Vec<String>,
        #[arg(long)]
        data: PathBuf,
        #[arg(long, num_args = 1..)]
        sub: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        ses: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        acq: Option<Vec<String>>,
        /// Pipeline config whose `subs` / `regex_subs` override the defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        subs_table: Option<PathBuf>,
        #[arg(long)]
        regex_subs_table: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Summarize a pipeline config.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Reconstruct, then segment, a raw BIDS dataset.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = ".fet/work")]
        work_dir: PathBuf,
        #[arg(long, num_args = 1..)]
        sub: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        ses: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        acq: Option<Vec<String>>,
        #[arg(long)]
        json: bool,
    },
    /// Run the segmentation stage over a reconstructed dataset.
    Segment {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = ".fet/work")]
        work_dir: PathBuf,
        #[arg(long, num_args = 1..)]
        sub: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        ses: Option<Vec<String>>,
        #[arg(long, num_args = 1..)]
        acq: Option<Vec<String>>,
        #[arg(long)]
        ignore_checks: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write dataset_description.json unless one exists.
    WriteDescription {
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        prev: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level. Logs go to stderr so --json stdout
    // stays parseable.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Enumerate {
            data,
            sub,
            ses,
            acq,
            json,
        } => {
            let layout = BidsLayout::scan(&data)?;
            let tuples =
                fet_bids::enumerate(&layout, sub.as_deref(), ses.as_deref(), acq.as_deref());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "enumerate",
                    "data": data.display().to_string(),
                    "tuples": tuples,
                })));
            }
            for t in &tuples {
                println!("{}", tuple_line(t));
            }
        }
        Commands::Resolve {
            input,
            cmd,
            path_to_output,
            stage,
            work_dir,
            dry_run,
            json,
        } => {
            let resolver = CommandResolver::new(&work_dir, &stage);
            let config = ResolveConfig { path_to_output };
            let invocation = resolver.resolve(&input, &cmd, &config)?;
            let exit_code = if dry_run {
                None
            } else {
                fet_runner::execute(&invocation)?
            };
            let output_exists = invocation.output.exists();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "resolve",
                    "argv": invocation.argv,
                    "staged_input": invocation.staged_input.display().to_string(),
                    "output": invocation.output.display().to_string(),
                    "output_exists": output_exists,
                    "dry_run": dry_run,
                    "exit_code": exit_code,
                })));
            }
            println!("command: {}", invocation.command_line());
            println!("staged_input: {}", invocation.staged_input.display());
            println!("output: {}", invocation.output.display());
            if !dry_run {
                println!("output_exists: {}", output_exists);
            }
        }
        Commands::Remap {
            paths,
            step,
            sub,
            ses,
            datatype,
            pipeline_name,
            recon,
            seg,
            literal,
            pattern,
            json,
        } => {
            let extra_literal = parse_rule_pairs("--literal", &literal)?;
            let extra_pattern = parse_rule_pairs("--pattern", &pattern)?;
            let mut params = BidsRuleParams {
                sessions: Some(ses.as_slice()),
                datatype: &datatype,
                recon_method: recon.as_deref(),
                seg_method: seg.as_deref(),
                extra_literal: Some(&extra_literal),
                extra_pattern: Some(&extra_pattern),
                ..BidsRuleParams::new(&sub, step.into())
            };
            if let Some(name) = pipeline_name.as_deref() {
                params = params.with_pipeline_name(name);
            }
            let rules = fet_bids::build_bids_rules(&params)?;
            return Ok(remap_report("remap", &rules, &paths, json));
        }
        Commands::RemapStatic {
            paths,
            data,
            sub,
            ses,
            acq,
            config,
            subs_table,
            regex_subs_table,
            json,
        } => {
            let layout = BidsLayout::scan(&data)?;
            let tuples =
                fet_bids::enumerate(&layout, sub.as_deref(), ses.as_deref(), acq.as_deref());
            let mut defaults = DefaultTables::builtin()?;
            if let Some(p) = subs_table {
                defaults.literal = RuleTable::load(&p)?;
            }
            if let Some(p) = regex_subs_table {
                defaults.pattern = RuleTable::load(&p)?;
            }
            let cfg = config.as_deref().map(PipelineConfig::load).transpose()?;
            let rules = fet_bids::build_static_rules_with(
                &tuples,
                &defaults,
                cfg.as_ref().map(|c| &c.subs),
                cfg.as_ref().map(|c| &c.regex_subs),
            )?;
            return Ok(remap_report("remap-static", &rules, &paths, json));
        }
        Commands::Describe { config, json } => {
            let cfg = PipelineConfig::load(&config)?;
            let pipeline_name = cfg.pipeline_name();
            let containers: Vec<String> = [Step::Preprocessing, Step::Reconstruction, Step::Segmentation]
                .iter()
                .map(|s| {
                    fet_bids::derivatives_container(&pipeline_name, *s)
                        .display()
                        .to_string()
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "pipeline_name": pipeline_name,
                    "reconstruction": cfg.reconstruction,
                    "segmentation": cfg.segmentation,
                    "containers": containers,
                    "subs": cfg.subs.len(),
                    "regex_subs": cfg.regex_subs.len(),
                })));
            }
            println!("pipeline_name: {}", pipeline_name);
            println!("reconstruction: {}", cfg.reconstruction.pipeline);
            println!("segmentation: {}", cfg.segmentation.pipeline);
            if let Some(cmd) = &cfg.segmentation.cmd {
                println!("segmentation_cmd: {}", cmd);
            }
            for c in &containers {
                println!("container: {}", c);
            }
            println!("subs_overrides: {}", cfg.subs.len());
            println!("regex_subs_overrides: {}", cfg.regex_subs.len());
        }
        Commands::Run {
            config,
            data,
            out,
            work_dir,
            sub,
            ses,
            acq,
            json,
        } => {
            let cfg = PipelineConfig::load(&config)?;
            let request = PipelineRequest {
                data_dir: data,
                out_dir: out,
                work_dir,
                subjects: sub,
                sessions: ses,
                acquisitions: acq,
            };
            let run = fet_runner::run_pipeline(&cfg, &request)?;
            let reconstructed = run.written(Step::Reconstruction);
            let segmented = run.written(Step::Segmentation);
            info!(
                tuples = run.tuples.len(),
                reconstructed,
                segmented,
                "pipeline finished"
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "reconstructed": reconstructed,
                    "segmented": segmented,
                    "run": run,
                })));
            }
            println!("derivatives_dir: {}", run.derivatives_dir.display());
            for o in &run.outcomes {
                let recon = o
                    .reconstruction
                    .destination
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| format!("{:?}", o.reconstruction.status));
                let seg = o
                    .segmentation
                    .as_ref()
                    .map(|s| {
                        s.destination
                            .as_ref()
                            .map(|d| d.display().to_string())
                            .unwrap_or_else(|| format!("{:?}", s.status))
                    })
                    .unwrap_or_else(|| "-".to_string());
                println!("{} recon={} seg={}", tuple_line(&o.tuple), recon, seg);
            }
            println!("reconstructed: {}", reconstructed);
            println!("segmented: {}", segmented);
        }
        Commands::Segment {
            config,
            data,
            out,
            work_dir,
            sub,
            ses,
            acq,
            ignore_checks,
            json,
        } => {
            let cfg = PipelineConfig::load(&config)?;
            let request = SegmentationRequest {
                data_dir: data,
                out_dir: out,
                work_dir,
                subjects: sub,
                sessions: ses,
                acquisitions: acq,
                ignore_checks,
            };
            let run = fet_runner::run_segmentation(&cfg, &request)?;
            info!(
                tuples = run.tuples.len(),
                written = run.written(),
                "segmentation finished"
            );
            let written = run.written();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "segment",
                    "written": written,
                    "run": run,
                })));
            }
            println!("derivatives_dir: {}", run.derivatives_dir.display());
            println!("tuples: {}", run.tuples.len());
            for o in &run.outcomes {
                let dest = o
                    .destination
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{} {:?} {}", tuple_line(&o.tuple), o.status, dest);
            }
            println!("written: {}", written);
        }
        Commands::WriteDescription {
            out_dir,
            name,
            prev,
            config,
            json,
        } => {
            let cfg_value = match config {
                Some(p) => Some(load_json(&p)?),
                None => None,
            };
            let wrote = fet_bids::write_dataset_description(
                &out_dir,
                &name,
                prev.as_deref(),
                cfg_value.as_ref(),
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "write-description",
                    "written": wrote,
                    "out_dir": out_dir.display().to_string(),
                })));
            }
            if wrote {
                println!("wrote: {}", out_dir.join("dataset_description.json").display());
            } else {
                println!("exists: {}", out_dir.join("dataset_description.json").display());
            }
        }
    }
    Ok(None)
}

fn remap_report(command: &str, rules: &fet_bids::RuleSet, paths: &[String], json: bool) -> Option<Value> {
    let mapped: Vec<(String, bool)> = paths
        .iter()
        .map(|p| {
            let out = rules.apply(p);
            let changed = matches!(out, std::borrow::Cow::Owned(_));
            (out.into_owned(), changed)
        })
        .collect();
    if json {
        let items: Vec<Value> = paths
            .iter()
            .zip(&mapped)
            .map(|(src, (dst, changed))| json!({ "from": src, "to": dst, "remapped": changed }))
            .collect();
        return Some(json!({
            "ok": true,
            "command": command,
            "literal_rules": rules.literals().len(),
            "pattern_rules": rules.patterns().len(),
            "paths": items,
        }));
    }
    for (src, (dst, changed)) in paths.iter().zip(&mapped) {
        if *changed {
            println!("{} -> {}", src, dst);
        } else {
            println!("{} (unchanged)", src);
        }
    }
    None
}

fn tuple_line(t: &EntityTuple) -> String {
    format!(
        "sub={} ses={} acq={}",
        t.subject,
        t.session.as_deref().unwrap_or("None"),
        t.acquisition.as_deref().unwrap_or("None")
    )
}

fn load_json(path: &Path) -> Result<Value> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Enumerate { json, .. }
        | Commands::Resolve { json, .. }
        | Commands::Remap { json, .. }
        | Commands::RemapStatic { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Run { json, .. }
        | Commands::Segment { json, .. }
        | Commands::WriteDescription { json, .. } => *json,
    }
}

fn parse_rule_pairs(flag: &str, values: &[String]) -> Result<RuleTable> {
    let mut out = RuleTable::new();
    for raw in values {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid {} '{}': expected MATCH=REPLACEMENT", flag, raw))?;
        if key.is_empty() {
            return Err(anyhow::anyhow!(
                "invalid {} '{}': match text cannot be empty",
                flag,
                raw
            ));
        }
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_pairs_split_at_first_equals() {
        let table = parse_rule_pairs("--pattern", &["a=b=c".to_string()]).unwrap();
        assert_eq!(table.get("a"), Some("b=c"));
        assert!(parse_rule_pairs("--literal", &["novalue".to_string()]).is_err());
        assert!(parse_rule_pairs("--literal", &["=x".to_string()]).is_err());
    }

    #[test]
    fn remap_report_flags_unchanged_paths() {
        let subs = vec!["01".to_string()];
        let ses = vec!["02".to_string()];
        let params = BidsRuleParams {
            sessions: Some(ses.as_slice()),
            ..BidsRuleParams::new(&subs, Step::Preprocessing)
        };
        let rules = fet_bids::build_bids_rules(&params).unwrap();
        let report = remap_report(
            "remap",
            &rules,
            &["o/stacks/_denoising3/img.nii.gz".to_string(), "o/plain.txt".to_string()],
            true,
        )
        .expect("json payload");
        assert_eq!(report["paths"][0]["remapped"], true);
        assert_eq!(
            report["paths"][0]["to"],
            "o/sub-01/ses-02/anat/sub-01_ses-02/img.nii.gz"
        );
        assert_eq!(report["paths"][1]["remapped"], false);
    }

    #[test]
    fn cli_parses_remap_arguments() {
        let cli = Cli::try_parse_from([
            "fet", "remap", "a/stacks/x", "--step", "segmentation", "--sub", "01", "02",
            "--ses", "1", "--pipeline-name", "nesvor_bounti", "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Remap { sub, ses, json, .. } => {
                assert_eq!(sub, vec!["01", "02"]);
                assert_eq!(ses, vec!["1"]);
                assert!(json);
            }
            _ => panic!("expected remap"),
        }
    }

    #[test]
    fn cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "fet", "run", "--config", "cfg.yaml", "--data", "bids", "--out", "out", "--sub", "01",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                sub, ses, work_dir, json, ..
            } => {
                assert_eq!(sub, Some(vec!["01".to_string()]));
                assert!(ses.is_none());
                assert_eq!(work_dir, PathBuf::from(".fet/work"));
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }
}
