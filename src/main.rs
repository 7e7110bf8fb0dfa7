use std::path::PathBuf;

use clap::Parser;
use tokio::signal;

use batch_orchestrator::app_state::{AppState, OrchestratorConfig};
use batch_orchestrator::pipeline::DEFAULT_STAGE_COUNT;
use batch_orchestrator::server::startup;

#[derive(Parser, Debug)]
#[command(name = "batch-orchestrator")]
#[command(about = "Routes chat and multi-stage batch jobs across a pool of cloud projects")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Directory of project key files (*.json).
    #[arg(long, env = "KEY_DIR", default_value = "json")]
    key_dir: PathBuf,
    /// Shared bucket for batch inputs and outputs.
    #[arg(long, env = "BUCKET_NAME")]
    bucket: String,
    #[arg(long, env = "REGION", default_value = "us-central1")]
    region: String,
    #[arg(
        long,
        env = "MODEL_ID",
        default_value = "publishers/google/models/gemini-3-flash-preview"
    )]
    model_id: String,
    #[arg(long, default_value_t = 5)]
    max_concurrent_jobs: usize,
    #[arg(long, default_value_t = 7200)]
    job_timeout_secs: u64,
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,
    #[arg(long, default_value_t = 60)]
    cooldown_secs: u64,
    #[arg(long, default_value_t = 3)]
    max_stage_retries: u32,
    #[arg(long, default_value_t = DEFAULT_STAGE_COUNT)]
    stage_count: u32,
    #[arg(long, default_value_t = 600)]
    request_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = OrchestratorConfig {
        host: args.host,
        port: args.port,
        key_dir: args.key_dir,
        bucket_name: args.bucket,
        region: args.region,
        model_id: args.model_id,
        max_concurrent_jobs: args.max_concurrent_jobs,
        job_timeout_secs: args.job_timeout_secs,
        sweep_interval_secs: args.sweep_interval_secs,
        cooldown_secs: args.cooldown_secs,
        max_stage_retries: args.max_stage_retries,
        stage_count: args.stage_count,
        request_timeout_secs: args.request_timeout_secs,
    };

    let app_state = AppState::new(config)?;
    let scheduler = app_state.scheduler();

    actix_web::rt::System::new().block_on(async move {
        tokio::select! {
            _ = scheduler.run() => {
                unreachable!()
            }
            res = startup(app_state) => {
                res?;
                unreachable!()
            }
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down");
                Ok(())
            }
        }
    })
}
