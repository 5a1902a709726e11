pub mod commands;
pub mod handlers;

pub use commands::{stage_job_spec, CrawlPageJob, CrawlSourceJob, JobOrigin, TrainPageJob};
pub use handlers::{
    register_pipeline_jobs, PipelineJobProcessor, CRAWLER_SERVICE, TRAINER_SERVICE,
};
