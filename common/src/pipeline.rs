//! Per-submission control flow and the batch loop.

use crate::cleanup::{StagedWorkspace, remove_local};
use crate::execution::{ExecutionCoordinator, ExecutionOutcome};
use crate::harvest::{
    Harvest, HarvestTargets, Snapshot, StagedFrame, harvest_local, harvest_remote,
    snapshot_local, snapshot_remote,
};
use crate::normalize::normalize;
use crate::remote::{RemoteError, RemoteSession};
use crate::report::{BATCH_REPORT_FILE, BatchReport, Diagnostic, SubmissionReport};
use crate::staging::{DeploymentStager, StagingError, SubmissionPackage, discover_submissions};
use crate::video::{VIDEO_FILE_NAME, VideoAssembler};
use crate::{BatchConfig, DECK_EXTENSIONS, FPS_FILE_NAME, Machine};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Where one submission's results go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionLayout {
    /// `<results>/<stem>/`
    pub result_dir: PathBuf,
    /// `<results>/frames_<stem>/`, removed after assembly unless kept.
    pub frames_dir: PathBuf,
}

impl SubmissionLayout {
    #[must_use]
    pub fn new(results_root: &Path, name: &str) -> Self {
        SubmissionLayout {
            result_dir: results_root.join(name),
            frames_dir: results_root.join(format!("frames_{name}")),
        }
    }

    #[must_use]
    pub fn video_path(&self) -> PathBuf {
        self.result_dir.join(VIDEO_FILE_NAME)
    }

    fn harvest_targets(&self) -> HarvestTargets {
        HarvestTargets {
            result_dir: self.result_dir.clone(),
            frames_dir: self.frames_dir.clone(),
        }
    }
}

/// Read the declared frame rate from `fps.txt` in `dir`.
///
/// Falls back to `default_fps` with a diagnostic when the file is missing or
/// does not hold a single positive integer.
pub fn read_frame_rate(dir: &Path, default_fps: u32) -> (u32, Option<Diagnostic>) {
    let path = dir.join(FPS_FILE_NAME);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            debug!("Could not read {}: {e}", path.display());
            return (
                default_fps,
                Some(Diagnostic::MissingFrameRate { default_fps }),
            );
        }
    };
    match content.trim().parse::<u32>() {
        Ok(fps) if fps > 0 => (fps, None),
        _ => (
            default_fps,
            Some(Diagnostic::InvalidFrameRate {
                content: content.trim().to_string(),
                default_fps,
            }),
        ),
    }
}

/// Copy the slide decks at the top of `dir` into `result_dir`.
fn copy_decks(dir: &Path, result_dir: &Path, report: &mut SubmissionReport) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Could not look for slide decks in {}: {e}", dir.display());
            return;
        }
    };
    let mut decks: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension().is_some_and(|ext| {
                DECK_EXTENSIONS
                    .iter()
                    .any(|deck| ext.eq_ignore_ascii_case(deck))
            })
        })
        .collect();
    decks.sort();

    for deck in decks {
        let Some(file_name) = deck.file_name() else {
            continue;
        };
        let dest = result_dir.join(file_name);
        match fs::copy(&deck, &dest) {
            Ok(_) => report.artifacts.push(dest),
            Err(e) => report.push(Diagnostic::DeckCopyFailed {
                file: file_name.to_string_lossy().into_owned(),
                reason: e.to_string(),
            }),
        }
    }
}

fn record_harvest(report: &mut SubmissionReport, harvest: Harvest) -> Vec<StagedFrame> {
    report.artifacts.extend(harvest.others);
    for diagnostic in harvest.diagnostics {
        report.push(diagnostic);
    }
    harvest.frames
}

/// Everything a single submission needs besides its session.
pub struct SubmissionContext<'a> {
    pub config: &'a BatchConfig,
    pub coordinator: &'a ExecutionCoordinator,
    pub assembler: &'a VideoAssembler,
}

/// Run one submission end to end: stage, render, harvest, encode, clean up.
///
/// Only staging errors come back as `Err`; the submission is then skipped.
/// Everything after staging is recorded in the returned report.
pub fn process_submission<S: RemoteSession>(
    ctx: &SubmissionContext<'_>,
    session: &S,
    package: &SubmissionPackage,
) -> Result<SubmissionReport, StagingError> {
    let config = ctx.config;
    let stager = DeploymentStager::new(session, &config.local_root, config.precopy);
    let staged = stager.prepare(package)?;
    let workspace =
        StagedWorkspace::new(session, staged.local_dir.clone(), staged.remote_dir.clone());
    stager.deploy(package, &staged)?;

    let mut report = SubmissionReport::new(&package.name, &staged.root_dir);
    let layout = SubmissionLayout::new(&config.result_dir, &package.name);
    for dir in [&layout.result_dir, &layout.frames_dir] {
        if let Err(e) = remove_local(dir) {
            warn!("Could not clear previous results in {}: {e}", dir.display());
        }
    }
    if let Err(e) = fs::create_dir_all(&layout.result_dir) {
        warn!("Could not create {}: {e}", layout.result_dir.display());
    }

    let local_pre = match snapshot_local(workspace.local_dir()) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            report.push(Diagnostic::SnapshotFailed {
                machine: Machine::Local,
                reason: e.to_string(),
            });
            None
        }
    };
    let remote_pre = match snapshot_remote(session, workspace.remote_dir()) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            report.push(Diagnostic::SnapshotFailed {
                machine: Machine::Remote,
                reason: e.to_string(),
            });
            None
        }
    };

    let render_args = config.render_args();
    let outcome = match render_args.split_first() {
        Some((program, args)) => ctx.coordinator.run(program, args, workspace.local_dir()),
        None => ExecutionOutcome::Crashed {
            message: "render command is empty".to_string(),
        },
    };
    report.execution = outcome.summary(config.timeout);
    let (stdout, stderr) = outcome.output();
    report.stdout = stdout.to_string();
    report.stderr = stderr.to_string();
    if let Some(reason) = outcome.failure_reason(config.timeout) {
        report.push(Diagnostic::ExecutionFailed { reason });
    }

    let targets = layout.harvest_targets();
    let mut frames = Vec::new();
    if let Some(pre) = local_pre {
        match snapshot_local(workspace.local_dir()) {
            Ok(post) => {
                let harvest =
                    harvest_local(workspace.local_dir(), &pre, &post, config.timeout, &targets);
                frames.extend(record_harvest(&mut report, harvest));
            }
            Err(e) => report.push(Diagnostic::SnapshotFailed {
                machine: Machine::Local,
                reason: e.to_string(),
            }),
        }
    }
    if let Some(pre) = remote_pre {
        frames.extend(harvest_remote_outputs(
            session,
            workspace.remote_dir(),
            &pre,
            config,
            &targets,
            &mut report,
        ));
    }

    copy_decks(workspace.local_dir(), &layout.result_dir, &mut report);
    let (fps, fps_diagnostic) = read_frame_rate(workspace.local_dir(), config.default_fps);
    if let Some(diagnostic) = fps_diagnostic {
        report.push(diagnostic);
    }
    report.fps = Some(fps);

    assemble(ctx.assembler, frames, fps, &layout, &mut report);

    if !config.keep_frames
        && let Err(e) = remove_local(&layout.frames_dir)
    {
        warn!("Could not remove {}: {e}", layout.frames_dir.display());
    }
    if let Err(failures) = workspace.cleanup() {
        report.push(Diagnostic::CleanupFailed {
            reason: failures.join("; "),
        });
    }

    if let Err(e) = report.write_files(&layout.result_dir) {
        error!("[{}] {e:#}", package.name);
    }
    Ok(report)
}

fn harvest_remote_outputs<S: RemoteSession>(
    session: &S,
    dir: &str,
    pre: &Snapshot,
    config: &BatchConfig,
    targets: &HarvestTargets,
    report: &mut SubmissionReport,
) -> Vec<StagedFrame> {
    match snapshot_remote(session, dir) {
        Ok(post) => {
            let harvest = harvest_remote(session, dir, pre, &post, config.timeout, targets);
            record_harvest(report, harvest)
        }
        Err(e) => {
            report.push(Diagnostic::SnapshotFailed {
                machine: Machine::Remote,
                reason: e.to_string(),
            });
            Vec::new()
        }
    }
}

fn assemble(
    assembler: &VideoAssembler,
    frames: Vec<StagedFrame>,
    fps: u32,
    layout: &SubmissionLayout,
    report: &mut SubmissionReport,
) {
    let sequence = match normalize(frames, &layout.frames_dir) {
        Ok(sequence) => sequence,
        Err(e) => {
            report.push(Diagnostic::NormalizeFailed {
                reason: e.to_string(),
            });
            return;
        }
    };
    report.frames = sequence.len();
    if sequence.is_empty() {
        report.push(Diagnostic::NoImages);
        return;
    }
    let extensions = sequence.extensions();
    if extensions.len() > 1 {
        report.push(Diagnostic::MixedExtensions {
            extensions,
            encoded: sequence.encodable_len(),
            total: sequence.len(),
        });
    }

    match assembler.assemble(&sequence, fps, &layout.video_path()) {
        Ok(video) => report.video = Some(video),
        Err(e) => report.push(Diagnostic::EncodingFailed {
            reason: e.to_string(),
        }),
    }
}

/// Process every archive in the source directory, one after the other.
///
/// `open_session` is called once per submission; the session is dropped, and
/// so closed, before the next one starts. A submission whose session cannot
/// be opened is skipped. Relative directories in `config` are resolved
/// against the current directory once, up front.
pub fn run_batch<S, F>(config: &BatchConfig, mut open_session: F) -> Result<BatchReport>
where
    S: RemoteSession,
    F: FnMut() -> Result<S, RemoteError>,
{
    let config = &config
        .with_absolute_paths()
        .context("Failed to resolve the batch directories")?;
    let packages = discover_submissions(&config.source_dir)?;
    fs::create_dir_all(&config.result_dir).with_context(|| {
        format!(
            "Failed to create result directory {}",
            config.result_dir.display()
        )
    })?;
    info!(
        "Found {} submission(s) in {}",
        packages.len(),
        config.source_dir.display()
    );

    let coordinator = ExecutionCoordinator::new(config.timeout)
        .context("Failed to start the runtime for render commands")?;
    let assembler = VideoAssembler::new(&config.encoder);
    let ctx = SubmissionContext {
        config,
        coordinator: &coordinator,
        assembler: &assembler,
    };

    let mut batch = BatchReport::new();

    if config.precopy && !packages.is_empty() {
        let session = open_session().context("Failed to open a session to pre-copy archives")?;
        DeploymentStager::upload_archives(&session, &packages)
            .context("Failed to pre-copy archives to the remote machine")?;
        info!("Pre-copied {} archive(s) to the remote machine", packages.len());
    }

    for (i, package) in packages.iter().enumerate() {
        info!("[{}/{}] Processing {}", i + 1, packages.len(), package.name);
        let session = match open_session() {
            Ok(session) => session,
            Err(e) => {
                batch.record_skipped(
                    &package.archive,
                    format!("could not open remote session: {e}"),
                );
                continue;
            }
        };
        match process_submission(&ctx, &session, package) {
            Ok(report) => batch.record_processed(&package.archive, report),
            Err(e) => batch.record_skipped(&package.archive, e.to_string()),
        }
    }

    batch.finish();
    batch.write_json(&config.result_dir.join(BATCH_REPORT_FILE))?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionSummary;
    use crate::remote::loopback::{LoopbackSession, ShellSession};
    use crate::report::{DIAGNOSTICS_FILE, STDOUT_LOG};
    use crate::staging::tests::write_zip;
    use crate::video::tests::{fake_encoder, relative_to_cwd};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Source, local, remote, results and tool directories of one test batch.
    struct Bench {
        sources: TempDir,
        local: TempDir,
        remote: TempDir,
        results: TempDir,
        tools: TempDir,
    }

    impl Bench {
        fn new() -> Self {
            Bench {
                sources: tempdir().unwrap(),
                local: tempdir().unwrap(),
                remote: tempdir().unwrap(),
                results: tempdir().unwrap(),
                tools: tempdir().unwrap(),
            }
        }

        /// The remote working directory stands in for the secondary address,
        /// so `run.sh` can write "remote" frames with `$2`.
        fn config(&self, root_dir: &str) -> BatchConfig {
            BatchConfig {
                source_dir: self.sources.path().to_path_buf(),
                result_dir: self.results.path().to_path_buf(),
                local_root: self.local.path().to_path_buf(),
                primary_address: "127.0.0.1".to_string(),
                secondary_address: self.remote.path().join(root_dir).display().to_string(),
                render_command: vec!["sh".to_string(), "./run.sh".to_string()],
                timeout: Duration::from_secs(30),
                default_fps: 60,
                encoder: fake_encoder(self.tools.path(), 0),
                precopy: false,
                keep_frames: false,
            }
        }

        fn add(&self, archive: &str, entries: &[(&str, &str)]) {
            write_zip(&self.sources.path().join(archive), entries);
        }

        fn run(&self, config: &BatchConfig) -> BatchReport {
            run_batch(config, || Ok(LoopbackSession::new(self.remote.path()))).unwrap()
        }

        fn encoder_args(&self) -> String {
            fs::read_to_string(self.tools.path().join("encoder_args.txt")).unwrap()
        }
    }

    const ALPHA_RUN: &str = "for i in 000 001 002 003 004; do echo $i > $i.png; done\n\
                             for i in 000 001 002; do echo $i > \"$2/$i.png\"; done\n\
                             echo rendered\n";

    #[test_log::test]
    fn test_two_machine_render() {
        let bench = Bench::new();
        bench.add(
            "alpha.zip",
            &[
                ("alpha/run.sh", ALPHA_RUN),
                ("alpha/fps.txt", "24\n"),
                ("alpha/slides.pdf", "%PDF"),
            ],
        );
        let batch = bench.run(&bench.config("alpha"));

        let report = batch.processed().next().unwrap();
        assert_eq!(report.frames, 8);
        assert_eq!(report.fps, Some(24));
        assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
        assert_eq!(
            report.execution,
            ExecutionSummary::Completed { exit_code: Some(0) }
        );

        let result_dir = bench.results.path().join("alpha");
        assert!(result_dir.join(VIDEO_FILE_NAME).is_file());
        assert!(result_dir.join("slides.pdf").is_file());
        assert_eq!(
            fs::read_to_string(result_dir.join(STDOUT_LOG)).unwrap(),
            "rendered\n"
        );
        assert_eq!(
            fs::read_to_string(result_dir.join(DIAGNOSTICS_FILE)).unwrap(),
            ""
        );
        let pattern = bench.results.path().join("frames_alpha/input_%03d.png");
        assert!(
            bench
                .encoder_args()
                .contains(&format!("-framerate 24 -i {} ", pattern.display()))
        );

        assert!(!bench.results.path().join("frames_alpha").exists());
        assert!(!bench.local.path().join("alpha").exists());
        assert!(!bench.remote.path().join("alpha").exists());
        assert!(bench.results.path().join(BATCH_REPORT_FILE).is_file());
    }

    #[test_log::test]
    fn test_relative_result_dir() {
        let bench = Bench::new();
        bench.add(
            "alpha.zip",
            &[("alpha/run.sh", ALPHA_RUN), ("alpha/fps.txt", "24")],
        );
        let config = BatchConfig {
            source_dir: relative_to_cwd(bench.sources.path()),
            result_dir: relative_to_cwd(bench.results.path()),
            ..bench.config("alpha")
        };
        let batch = bench.run(&config);

        let report = batch.processed().next().unwrap();
        assert_eq!(report.frames, 8);
        assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
        let video = bench.results.path().join("alpha").join(VIDEO_FILE_NAME);
        assert!(video.is_file());
        let reported = report.video.as_ref().unwrap();
        assert!(reported.is_absolute());
        assert_eq!(
            fs::canonicalize(reported).unwrap(),
            fs::canonicalize(&video).unwrap()
        );
        assert!(bench.results.path().join(BATCH_REPORT_FILE).is_file());
    }

    #[test_log::test]
    fn test_two_machine_render_over_shell_commands() {
        let bench = Bench::new();
        bench.add(
            "alpha.zip",
            &[("alpha/run.sh", ALPHA_RUN), ("alpha/fps.txt", "24")],
        );
        let config = bench.config("alpha");

        let batch = run_batch(&config, || Ok(ShellSession::new(bench.remote.path()))).unwrap();

        let report = batch.processed().next().unwrap();
        assert_eq!(report.frames, 8);
        assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
        assert!(bench.results.path().join("alpha").join(VIDEO_FILE_NAME).is_file());
        assert!(bench.remote.path().join("submissions/alpha.zip").is_file());
        assert!(!bench.local.path().join("alpha").exists());
        assert!(!bench.remote.path().join("alpha").exists());
    }

    #[test_log::test]
    fn test_mixed_extensions_are_reported() {
        let bench = Bench::new();
        bench.add(
            "mixed.zip",
            &[(
                "mixed/run.sh",
                "echo a > 000.png; echo b > 002.png; echo c > \"$2/001.jpg\"\n",
            )],
        );
        let batch = bench.run(&bench.config("mixed"));

        let report = batch.processed().next().unwrap();
        assert_eq!(report.frames, 3);
        assert!(report.diagnostics.contains(&Diagnostic::MixedExtensions {
            extensions: vec!["jpg".to_string(), "png".to_string()],
            encoded: 1,
            total: 3,
        }));
        assert!(report.video.is_some());
    }

    #[test_log::test]
    fn test_keep_frames() {
        let bench = Bench::new();
        bench.add(
            "alpha.zip",
            &[("alpha/run.sh", ALPHA_RUN), ("alpha/fps.txt", "24")],
        );
        let config = BatchConfig {
            keep_frames: true,
            ..bench.config("alpha")
        };
        bench.run(&config);

        let frames_dir = bench.results.path().join("frames_alpha");
        for i in 0..8 {
            assert!(frames_dir.join(format!("input_{i:03}.png")).is_file());
        }
        assert!(!frames_dir.join("input_008.png").exists());
    }

    #[test_log::test]
    fn test_no_images() {
        let bench = Bench::new();
        bench.add(
            "beta.zip",
            &[("beta/run.sh", "echo 'no frames today' > render.log\n")],
        );
        let batch = bench.run(&bench.config("beta"));

        let report = batch.processed().next().unwrap();
        assert_eq!(report.frames, 0);
        assert_eq!(report.video, None);
        assert_eq!(
            report.diagnostics,
            vec![
                Diagnostic::MissingFrameRate { default_fps: 60 },
                Diagnostic::NoImages
            ]
        );

        let result_dir = bench.results.path().join("beta");
        assert!(!result_dir.join(VIDEO_FILE_NAME).exists());
        assert!(result_dir.join("other_local_outputs/render.log").is_file());
        let diagnostics = fs::read_to_string(result_dir.join(DIAGNOSTICS_FILE)).unwrap();
        assert!(diagnostics.lines().any(|line| line == "No images"));
    }

    #[test_log::test]
    fn test_missing_fps_uses_default() {
        let bench = Bench::new();
        bench.add("gamma.zip", &[("gamma/run.sh", "echo x > 000.png\n")]);
        let batch = bench.run(&bench.config("gamma"));

        let report = batch.processed().next().unwrap();
        assert_eq!(report.fps, Some(60));
        assert!(report.video.is_some());
        assert!(bench.encoder_args().contains("-framerate 60"));
        let diagnostics =
            fs::read_to_string(bench.results.path().join("gamma").join(DIAGNOSTICS_FILE)).unwrap();
        assert!(diagnostics.contains("fps.txt not found"));
    }

    #[test_log::test]
    fn test_timeout_still_cleans_up() {
        let bench = Bench::new();
        bench.add(
            "slow.zip",
            &[("slow/run.sh", "echo x > 000.png\nsleep 30\n")],
        );
        let config = BatchConfig {
            timeout: Duration::from_secs(1),
            ..bench.config("slow")
        };
        let batch = bench.run(&config);

        let report = batch.processed().next().unwrap();
        assert_eq!(
            report.execution,
            ExecutionSummary::TimedOut { timeout_secs: 1 }
        );
        assert!(
            report
                .diagnostics
                .iter()
                .any(|d| matches!(d, Diagnostic::ExecutionFailed { .. }))
        );
        assert_eq!(report.frames, 1);
        assert!(!bench.local.path().join("slow").exists());
        assert!(!bench.remote.path().join("slow").exists());
    }

    #[test_log::test]
    fn test_shipped_frames_are_not_harvested() {
        let bench = Bench::new();
        bench.add(
            "delta.zip",
            &[
                ("delta/000.png", "left over from a test run"),
                ("delta/run.sh", "echo x > 001.png\n"),
                ("delta/fps.txt", "30"),
            ],
        );
        let batch = bench.run(&bench.config("delta"));

        let report = batch.processed().next().unwrap();
        assert_eq!(report.frames, 1);
    }

    #[test_log::test]
    fn test_invalid_archive_is_skipped() {
        let bench = Bench::new();
        bench.add("alpha.zip", &[("alpha/run.sh", ALPHA_RUN), ("alpha/fps.txt", "24")]);
        bench.add("broken.zip", &[("run.sh", "true"), ("fps.txt", "24")]);
        let closed = Arc::new(AtomicUsize::new(0));
        let config = bench.config("alpha");

        let batch = run_batch(&config, || {
            Ok(LoopbackSession::new(bench.remote.path()).with_close_counter(Arc::clone(&closed)))
        })
        .unwrap();

        assert_eq!(batch.processed().count(), 1);
        let skipped: Vec<_> = batch.skipped().collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].0.ends_with("broken.zip"));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(!bench.results.path().join("broken").exists());
    }

    #[test_log::test]
    fn test_session_failure_skips_submission() {
        let bench = Bench::new();
        bench.add("alpha.zip", &[("alpha/run.sh", ALPHA_RUN)]);
        let config = bench.config("alpha");

        let batch = run_batch(&config, || {
            Err::<LoopbackSession, _>(RemoteError::Connect {
                host: "10.0.0.2".to_string(),
                status: Some(255),
            })
        })
        .unwrap();

        assert_eq!(batch.processed().count(), 0);
        let (_, reason) = batch.skipped().next().unwrap();
        assert!(reason.contains("could not open remote session"));
    }

    #[test_log::test]
    fn test_precopy_uploads_once() {
        let bench = Bench::new();
        bench.add("alpha.zip", &[("alpha/run.sh", ALPHA_RUN), ("alpha/fps.txt", "24")]);
        let config = BatchConfig {
            precopy: true,
            ..bench.config("alpha")
        };
        let batch = bench.run(&config);

        assert_eq!(batch.processed().next().unwrap().frames, 8);
        assert!(bench.remote.path().join("submissions/alpha.zip").is_file());
    }

    #[test]
    fn test_read_frame_rate() {
        let dir = tempdir().unwrap();
        assert_eq!(
            read_frame_rate(dir.path(), 60),
            (60, Some(Diagnostic::MissingFrameRate { default_fps: 60 }))
        );

        fs::write(dir.path().join(FPS_FILE_NAME), "24\n").unwrap();
        assert_eq!(read_frame_rate(dir.path(), 60), (24, None));

        fs::write(dir.path().join(FPS_FILE_NAME), "twenty").unwrap();
        assert_eq!(
            read_frame_rate(dir.path(), 60),
            (
                60,
                Some(Diagnostic::InvalidFrameRate {
                    content: "twenty".to_string(),
                    default_fps: 60
                })
            )
        );

        fs::write(dir.path().join(FPS_FILE_NAME), "0").unwrap();
        assert_eq!(read_frame_rate(dir.path(), 60).0, 60);
    }
}
