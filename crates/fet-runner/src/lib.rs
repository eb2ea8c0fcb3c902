pub mod command;
pub mod config;
pub mod pipeline;
pub mod segment;

pub use command::{
    execute, mount_args, shell_join, template_tags, validate_template, CommandResolver,
    ResolveConfig, ResolveError, ResolvedInvocation, StageDirs, VALID_TAGS,
};
pub use config::{PipelineConfig, StageConfig};
pub use pipeline::{
    run_pipeline, PipelineOutcome, PipelineRequest, PipelineRun, StageOutcome, RECON_OUTPUT_NAME,
};
pub use segment::{
    run_segmentation, OutcomeStatus, SegmentationOutcome, SegmentationRequest, SegmentationRun,
};
