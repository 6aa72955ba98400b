//! A batch runner for two-machine render submissions.

#![warn(clippy::all, clippy::pedantic)]

extern crate rendereval_common;
use rendereval_common::pipeline::run_batch;
use rendereval_common::remote::{SshSession, SshTarget};
use rendereval_common::{BatchConfig, DEFAULT_FPS, DEFAULT_TIMEOUT_SECS, RUNNER_VERSION};

use anyhow::{Result, bail};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Directory holding one zip archive per submission
    #[arg(env = "RENDEREVAL_SOURCE_DIR")]
    source_dir: PathBuf,

    /// Directory receiving one result directory per submission
    #[arg(env = "RENDEREVAL_RESULT_DIR")]
    result_dir: PathBuf,

    /// Address of this machine, passed to the render entry point
    #[arg(env = "RENDEREVAL_PRIMARY")]
    primary: String,

    /// Address of the remote machine; also the SSH host
    #[arg(env = "RENDEREVAL_SECONDARY")]
    secondary: String,

    /// Upload every archive to the remote machine once, before the batch starts
    #[arg(long, env = "RENDEREVAL_PRECOPY")]
    precopy: bool,

    /// User to log in as on the remote machine
    #[arg(long, env = "RENDEREVAL_REMOTE_USER")]
    remote_user: Option<String>,

    /// SSH port of the remote machine
    #[arg(long, env = "RENDEREVAL_REMOTE_PORT")]
    remote_port: Option<u16>,

    /// Private key for the remote machine
    #[arg(long, env = "RENDEREVAL_IDENTITY")]
    identity: Option<PathBuf>,

    /// Directory submissions are extracted into on this machine
    #[arg(long, env = "HOME")]
    local_root: PathBuf,

    /// Render entry point; the two addresses are appended to it
    #[arg(long, default_value = "sh ./run.sh", env = "RENDEREVAL_RENDER_COMMAND")]
    render_command: String,

    /// Hard bound on a render, also the width of the frame window
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "RENDEREVAL_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Frame rate used when a submission has no fps.txt
    #[arg(long, default_value_t = DEFAULT_FPS, env = "RENDEREVAL_DEFAULT_FPS")]
    default_fps: u32,

    /// Encoder program, invoked with ffmpeg arguments
    #[arg(long, default_value = "ffmpeg", env = "RENDEREVAL_ENCODER")]
    encoder: PathBuf,

    /// Keep the renumbered frames next to the results
    #[arg(long, env = "RENDEREVAL_KEEP_FRAMES")]
    keep_frames: bool,
}

impl Cli {
    fn batch_config(&self) -> Result<BatchConfig> {
        let render_command: Vec<String> = self
            .render_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if render_command.is_empty() {
            bail!("--render-command must not be empty");
        }
        if self.timeout_secs == 0 {
            bail!("--timeout-secs must be positive");
        }
        if self.default_fps == 0 {
            bail!("--default-fps must be positive");
        }
        Ok(BatchConfig {
            source_dir: self.source_dir.clone(),
            result_dir: self.result_dir.clone(),
            local_root: self.local_root.clone(),
            primary_address: self.primary.clone(),
            secondary_address: self.secondary.clone(),
            render_command,
            timeout: Duration::from_secs(self.timeout_secs),
            default_fps: self.default_fps,
            encoder: self.encoder.clone(),
            precopy: self.precopy,
            keep_frames: self.keep_frames,
        })
    }

    fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: self.secondary.clone(),
            port: self.remote_port,
            user: self.remote_user.clone(),
            identity: self.identity.clone(),
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.batch_config()?;
    let target = cli.ssh_target();
    info!(
        "rendereval {RUNNER_VERSION}: {} -> {}, remote {}",
        config.source_dir.display(),
        config.result_dir.display(),
        target.destination()
    );

    let batch = run_batch(&config, || SshSession::open(target.clone()))?;
    batch.log_summary();
    Ok(())
}

fn main() {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    // Parse command line arguments
    let cli = Cli::parse();

    // Set up logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(&cli) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
