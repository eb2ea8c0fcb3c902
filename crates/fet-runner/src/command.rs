//! Turns a user command template into a concrete invocation of an
//! external (usually containerized) tool.
//!
//! Templates carry `<tag>` placeholders from a closed vocabulary. The
//! input volume is copied into a staging directory owned by this
//! invocation, every tag is substituted at the argument level and the
//! tool runs without a shell.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const VALID_TAGS: [&str; 7] = [
    "mount",
    "input_vol",
    "input_srr",
    "input_dir",
    "output_dir",
    "output_seg",
    "basename",
];

pub const STAGED_INPUT_NAME: &str = "input_srr.nii.gz";
pub const DEFAULT_OUTPUT_NAME: &str = "seg.nii.gz";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown tag <{tag}> in command (valid tags: {})", VALID_TAGS.join(", "))]
    UnknownTag { tag: String },

    #[error("<output_dir> found in the command, but path_to_output is not defined")]
    MissingOutputTemplate,

    #[error("path_to_output must stay inside the output directory: {0}")]
    OutputTemplateOutsideOutputDir(String),

    #[error("no input volume to stage")]
    NoInput,

    #[error("input file name is missing or staged twice: {0}")]
    DuplicateInput(String),

    #[error("<mount> must be a standalone word in the command: {0}")]
    MountNotStandalone(String),

    #[error("unbalanced quote in command: {0}")]
    UnbalancedQuote(String),

    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to stage {path}: {source}")]
    Staging {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-stage settings that influence resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveConfig {
    /// Output artifact path relative to the output directory; may contain
    /// `<basename>`. Required when the command uses `<output_dir>`.
    pub path_to_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDirs {
    pub root: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedInvocation {
    pub argv: Vec<String>,
    pub staged_input: PathBuf,
    pub output: PathBuf,
    pub dirs: StageDirs,
}

impl ResolvedInvocation {
    pub fn command_line(&self) -> String {
        shell_join(&self.argv)
    }
}

fn tag_regex() -> &'static Regex {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    TAG_RE.get_or_init(|| Regex::new(r"<([^<>]*)>").expect("static tag pattern"))
}

/// Tags present in `template`, in order of appearance.
pub fn template_tags(template: &str) -> Vec<String> {
    tag_regex()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

pub fn validate_template(template: &str) -> Result<(), ResolveError> {
    for tag in template_tags(template) {
        if !VALID_TAGS.contains(&tag.as_str()) {
            return Err(ResolveError::UnknownTag { tag });
        }
    }
    Ok(())
}

/// Splits on whitespace; single or double quotes group a word.
pub fn split_words(template: &str) -> Result<Vec<String>, ResolveError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in template.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(ResolveError::UnbalancedQuote(template.to_string()));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Docker arguments binding both staging directories at identical paths
/// inside the container, so substituted host paths stay valid.
pub fn mount_args(input_dir: &Path, output_dir: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        format!("{}:{}", input_dir.display(), input_dir.display()),
        "-v".to_string(),
        format!("{}:{}", output_dir.display(), output_dir.display()),
    ]
}

fn staging_key(stage: &str, inputs: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    for input in inputs {
        hasher.update([0u8]);
        hasher.update(input.to_string_lossy().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone)]
pub struct CommandResolver {
    work_root: PathBuf,
    stage: String,
    default_output: String,
}

impl CommandResolver {
    pub fn new(work_root: &Path, stage: &str) -> Self {
        Self {
            work_root: absolute(work_root),
            stage: stage.to_string(),
            default_output: DEFAULT_OUTPUT_NAME.to_string(),
        }
    }

    /// File name `<output_seg>` points at inside the output directory.
    pub fn with_default_output(mut self, name: &str) -> Self {
        self.default_output = name.to_string();
        self
    }

    /// Staging directories for `input`; distinct inputs never share them.
    pub fn stage_dirs(&self, input: &Path) -> StageDirs {
        self.stage_dirs_for(&[input])
    }

    fn stage_dirs_for(&self, inputs: &[&Path]) -> StageDirs {
        let absolute_inputs: Vec<PathBuf> = inputs.iter().map(|p| absolute(p)).collect();
        let root = self
            .work_root
            .join(&self.stage)
            .join(staging_key(&self.stage, &absolute_inputs));
        StageDirs {
            input: root.join("input"),
            output: root.join("out"),
            root,
        }
    }

    /// Validates `template`, stages `input` and substitutes every tag.
    /// Configuration errors are reported before anything touches disk.
    pub fn resolve(
        &self,
        input: &Path,
        template: &str,
        config: &ResolveConfig,
    ) -> Result<ResolvedInvocation, ResolveError> {
        self.resolve_stacks(&[input], template, config)
    }

    /// Like [`resolve`](Self::resolve) for tools that read a whole input
    /// directory. A single input is staged as `input_srr.nii.gz`; several
    /// inputs keep their own file names, and `<input_vol>`, `<input_srr>`
    /// and `<basename>` refer to the first one.
    pub fn resolve_stacks(
        &self,
        inputs: &[&Path],
        template: &str,
        config: &ResolveConfig,
    ) -> Result<ResolvedInvocation, ResolveError> {
        validate_template(template)?;
        let tags = template_tags(template);
        let uses_output_dir = tags.iter().any(|t| t == "output_dir");
        let output_template = match (&config.path_to_output, uses_output_dir) {
            (None, true) => return Err(ResolveError::MissingOutputTemplate),
            (Some(p), true) if !stays_inside(p) => {
                return Err(ResolveError::OutputTemplateOutsideOutputDir(p.clone()))
            }
            (Some(p), true) => Some(p.as_str()),
            (_, false) => None,
        };
        let words = split_words(template)?;
        if words.is_empty() {
            return Err(ResolveError::EmptyCommand);
        }
        if let Some(word) = words.iter().find(|w| w.contains("<mount>") && *w != "<mount>") {
            return Err(ResolveError::MountNotStandalone(word.clone()));
        }
        let staged_names = staged_names(inputs)?;

        let dirs = self.stage_dirs_for(inputs);
        // A previous run's artifact must not pass for this run's output.
        if dirs.output.exists() {
            fs::remove_dir_all(&dirs.output).map_err(|source| ResolveError::Staging {
                path: dirs.output.display().to_string(),
                source,
            })?;
        }
        for dir in [&dirs.input, &dirs.output] {
            fs::create_dir_all(dir).map_err(|source| ResolveError::Staging {
                path: dir.display().to_string(),
                source,
            })?;
        }
        for (input, name) in inputs.iter().zip(&staged_names) {
            let staged = dirs.input.join(name);
            fs::copy(input, &staged).map_err(|source| ResolveError::Staging {
                path: input.display().to_string(),
                source,
            })?;
            debug!(
                input = %input.display(),
                staged = %staged.display(),
                "staged input volume"
            );
        }

        let basename = staged_names[0].as_str();
        let staged_input = dirs.input.join(basename);
        let staged_str = staged_input.display().to_string();
        let input_dir_str = dirs.input.display().to_string();
        let output_dir_str = dirs.output.display().to_string();
        let default_output = dirs.output.join(&self.default_output);
        let default_output_str = default_output.display().to_string();

        let output = match output_template {
            Some(rel) => dirs.output.join(rel.replace("<basename>", basename)),
            None => default_output,
        };

        let mut argv = Vec::with_capacity(words.len() + 3);
        for word in words {
            if word == "<mount>" {
                argv.extend(mount_args(&dirs.input, &dirs.output));
                continue;
            }
            let resolved = word
                .replace("<input_srr>", &staged_str)
                .replace("<input_vol>", &staged_str)
                .replace("<input_dir>", &input_dir_str)
                .replace("<output_seg>", &default_output_str)
                .replace("<output_dir>", &output_dir_str)
                .replace("<basename>", basename);
            argv.push(resolved);
        }

        Ok(ResolvedInvocation {
            argv,
            staged_input,
            output,
            dirs,
        })
    }

    /// Resolves, then runs the tool synchronously. The returned path is
    /// where the artifact is expected; whether it exists is for the caller
    /// to check.
    pub fn run(
        &self,
        input: &Path,
        template: &str,
        config: &ResolveConfig,
    ) -> Result<PathBuf, ResolveError> {
        self.run_stacks(&[input], template, config)
    }

    pub fn run_stacks(
        &self,
        inputs: &[&Path],
        template: &str,
        config: &ResolveConfig,
    ) -> Result<PathBuf, ResolveError> {
        let invocation = self.resolve_stacks(inputs, template, config)?;
        execute(&invocation)?;
        Ok(invocation.output)
    }
}

/// Relative, and never climbing out with `..`.
fn stays_inside(rel: &str) -> bool {
    let path = Path::new(rel);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn staged_names(inputs: &[&Path]) -> Result<Vec<String>, ResolveError> {
    match inputs {
        [] => Err(ResolveError::NoInput),
        [_] => Ok(vec![STAGED_INPUT_NAME.to_string()]),
        _ => {
            let mut names: Vec<String> = Vec::with_capacity(inputs.len());
            for input in inputs {
                let name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| ResolveError::DuplicateInput(input.display().to_string()))?;
                if names.contains(&name) {
                    return Err(ResolveError::DuplicateInput(name));
                }
                names.push(name);
            }
            Ok(names)
        }
    }
}

/// Runs the invocation and returns its exit code (`None` when killed by a
/// signal). A non-zero exit is logged, not raised.
pub fn execute(invocation: &ResolvedInvocation) -> Result<Option<i32>, ResolveError> {
    let Some((program, args)) = invocation.argv.split_first() else {
        return Err(ResolveError::EmptyCommand);
    };
    info!(command = %invocation.command_line(), "running external tool");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|source| ResolveError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !status.success() {
        warn!(
            program = %program,
            code = ?status.code(),
            "external tool exited unsuccessfully"
        );
    }
    Ok(status.code())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fet_cmd_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn volume(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, b"nifti").expect("write volume");
        path
    }

    #[test]
    fn unknown_tag_fails_before_staging() {
        let root = scratch("bogus");
        let input = volume(&root, "srr.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let err = resolver
            .resolve(
                &input,
                "<mount> tool -i <input_srr> -o <output_seg> <bogus>",
                &ResolveConfig::default(),
            )
            .expect_err("unknown tag must fail");
        assert!(matches!(err, ResolveError::UnknownTag { ref tag } if tag == "bogus"));
        assert!(!root.join("work").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn output_dir_requires_output_template() {
        let root = scratch("outdir");
        let input = volume(&root, "srr.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let err = resolver
            .resolve(&input, "tool <input_dir> <output_dir>", &ResolveConfig::default())
            .expect_err("missing path_to_output must fail");
        assert!(matches!(err, ResolveError::MissingOutputTemplate));
        assert!(!root.join("work").exists());

        for escaping in ["/abs/seg.nii.gz", "../../x.nii.gz", "sub/../../x.nii.gz"] {
            let cfg = ResolveConfig {
                path_to_output: Some(escaping.to_string()),
            };
            assert!(
                matches!(
                    resolver.resolve(&input, "tool <output_dir>", &cfg),
                    Err(ResolveError::OutputTemplateOutsideOutputDir(_))
                ),
                "{escaping} accepted"
            );
        }
        assert!(!root.join("work").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bracketed_text_with_spaces_is_still_a_tag() {
        assert!(matches!(
            validate_template("tool <input_vol> <bo gus>"),
            Err(ResolveError::UnknownTag { ref tag }) if tag == "bo gus"
        ));
        assert_eq!(template_tags("a <input_vol> b"), vec!["input_vol"]);
    }

    #[test]
    fn several_stacks_share_one_input_dir() {
        let root = scratch("stacks");
        let a = volume(&root, "sub-01_run-1_T2w.nii.gz");
        let b = volume(&root, "sub-01_run-2_T2w.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "reconstruction")
            .with_default_output("srr.nii.gz");
        let inv = resolver
            .resolve_stacks(
                &[a.as_path(), b.as_path()],
                "recon --dir <input_dir> --ref <input_vol> -o <output_seg>",
                &ResolveConfig::default(),
            )
            .expect("resolve");
        assert!(inv.dirs.input.join("sub-01_run-1_T2w.nii.gz").exists());
        assert!(inv.dirs.input.join("sub-01_run-2_T2w.nii.gz").exists());
        assert_eq!(inv.staged_input, inv.dirs.input.join("sub-01_run-1_T2w.nii.gz"));
        assert_eq!(inv.output, inv.dirs.output.join("srr.nii.gz"));
        assert_ne!(inv.dirs, resolver.stage_dirs(&a));

        assert!(matches!(
            resolver.resolve_stacks(&[a.as_path(), a.as_path()], "recon <input_dir>", &ResolveConfig::default()),
            Err(ResolveError::DuplicateInput(_))
        ));
        assert!(matches!(
            resolver.resolve_stacks(&[], "recon <input_dir>", &ResolveConfig::default()),
            Err(ResolveError::NoInput)
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resolve_substitutes_every_tag() {
        let root = scratch("subst");
        let input = volume(&root, "sub-01_ses-02_rec-nesvor_T2w.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let inv = resolver
            .resolve(
                &input,
                "docker run --rm <mount> img seg -i <input_srr> -d <input_dir> -o <output_seg>",
                &ResolveConfig::default(),
            )
            .expect("resolve");

        let dirs = &inv.dirs;
        assert!(inv.staged_input.exists());
        assert_eq!(fs::read(&inv.staged_input).unwrap(), b"nifti");
        assert!(input.exists(), "input must be copied, not moved");
        assert_eq!(inv.staged_input, dirs.input.join(STAGED_INPUT_NAME));
        assert_eq!(inv.output, dirs.output.join(DEFAULT_OUTPUT_NAME));

        let mut expected = vec!["docker".to_string(), "run".to_string(), "--rm".to_string()];
        expected.extend(mount_args(&dirs.input, &dirs.output));
        expected.extend([
            "img".to_string(),
            "seg".to_string(),
            "-i".to_string(),
            inv.staged_input.display().to_string(),
            "-d".to_string(),
            dirs.input.display().to_string(),
            "-o".to_string(),
            inv.output.display().to_string(),
        ]);
        assert_eq!(inv.argv, expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn output_template_reassigns_artifact() {
        let root = scratch("tmpl");
        let input = volume(&root, "srr.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let cfg = ResolveConfig {
            path_to_output: Some("<basename>_seg/labels.nii.gz".to_string()),
        };
        let inv = resolver
            .resolve(&input, "tool --in <input_vol> --out=<output_dir>", &cfg)
            .expect("resolve");
        assert_eq!(
            inv.output,
            inv.dirs
                .output
                .join(format!("{}_seg/labels.nii.gz", STAGED_INPUT_NAME))
        );
        assert_eq!(inv.argv[3], format!("--out={}", inv.dirs.output.display()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn staging_is_isolated_per_input_and_stage() {
        let root = scratch("iso");
        let a = volume(&root, "a.nii.gz");
        let b = volume(&root, "b.nii.gz");
        let seg = CommandResolver::new(&root.join("work"), "segmentation");
        let rec = CommandResolver::new(&root.join("work"), "reconstruction");
        assert_ne!(seg.stage_dirs(&a), seg.stage_dirs(&b));
        assert_ne!(seg.stage_dirs(&a).root, rec.stage_dirs(&a).root);
        assert_eq!(seg.stage_dirs(&a), seg.stage_dirs(&a));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn split_words_honours_quotes() {
        assert_eq!(
            split_words(r#"sh -c "echo <input_vol> > x"  'a b'"#).unwrap(),
            vec!["sh", "-c", "echo <input_vol> > x", "a b"]
        );
        assert_eq!(split_words(r#"tool """#).unwrap(), vec!["tool", ""]);
        assert!(matches!(
            split_words("tool 'open"),
            Err(ResolveError::UnbalancedQuote(_))
        ));
    }

    #[test]
    fn embedded_mount_is_rejected() {
        let root = scratch("mount");
        let input = volume(&root, "srr.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        assert!(matches!(
            resolver.resolve(&input, "docker run --flags=<mount> img", &ResolveConfig::default()),
            Err(ResolveError::MountNotStandalone(_))
        ));
        assert!(matches!(
            resolver.resolve(&input, "   ", &ResolveConfig::default()),
            Err(ResolveError::EmptyCommand)
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_input_is_a_staging_error() {
        let root = scratch("missing");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let err = resolver
            .resolve(&root.join("nope.nii.gz"), "tool <input_vol>", &ResolveConfig::default())
            .expect_err("missing input");
        assert!(matches!(err, ResolveError::Staging { .. }));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_executes_without_a_shell_and_returns_expected_output() {
        let root = scratch("run");
        let input = volume(&root, "srr.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let out = resolver
            .run(&input, "cp <input_vol> <output_seg>", &ResolveConfig::default())
            .expect("run");
        assert!(out.ends_with(DEFAULT_OUTPUT_NAME));
        assert_eq!(fs::read(&out).unwrap(), b"nifti");

        // A failing tool is not an error here; the artifact is just absent.
        let cfg = ResolveConfig {
            path_to_output: Some("never.nii.gz".to_string()),
        };
        let out = resolver
            .run(&input, "false <output_dir>", &cfg)
            .expect("non-zero exit is not an error");
        assert!(!out.exists());
        assert!(!out.with_file_name(DEFAULT_OUTPUT_NAME).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn spawn_failure_is_reported() {
        let root = scratch("spawn");
        let input = volume(&root, "srr.nii.gz");
        let resolver = CommandResolver::new(&root.join("work"), "segmentation");
        let err = resolver
            .run(&input, "fet-no-such-binary-xyz <input_vol>", &ResolveConfig::default())
            .expect_err("spawn must fail");
        assert!(matches!(err, ResolveError::Spawn { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
