//! FFmpeg transcoder launcher.

use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ExitReporter, TranscodeJob, TranscoderHandle, TranscoderLauncher, TranscoderOutput,
    TranscoderProcessSide,
};
use crate::config::TranscoderConfig;
use crate::session::OutputMode;
use crate::{Error, Result};

/// Chunks queued in front of ffmpeg's stdin before writers see back-pressure.
const INPUT_QUEUE: usize = 16;

/// Launches one ffmpeg process per session.
pub struct FfmpegLauncher {
    config: TranscoderConfig,
    version: Option<String>,
}

impl FfmpegLauncher {
    pub fn new(config: TranscoderConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        Self { config, version }
    }

    /// Detect ffmpeg version.
    fn detect_version(path: &str) -> Option<String> {
        std::process::Command::new(path)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Build ffmpeg command arguments for a job.
    pub fn build_args(job: &TranscodeJob) -> Vec<String> {
        let mut args: Vec<String> = [
            "-loglevel", "error", "-i", "pipe:0", "-map", "0:v:0", "-map", "0:a?",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        match job.mode {
            OutputMode::Segmented => {
                args.extend(
                    [
                        "-c:v",
                        "copy",
                        "-c:a",
                        "aac",
                        "-b:a",
                        "96k",
                        "-f",
                        "hls",
                        "-hls_time",
                        "1",
                        "-hls_list_size",
                        "5",
                        "-hls_flags",
                        "delete_segments+append_list",
                    ]
                    .map(String::from),
                );
                args.push("-hls_base_url".to_string());
                args.push(job.segment_base_url.clone());
                // FFmpeg wants forward slashes on every platform.
                let playlist = job.output_dir.join(&job.playlist_name);
                args.push(playlist.to_string_lossy().replace('\\', "/"));
            }
            OutputMode::Continuous => {
                args.extend(
                    [
                        "-flush_packets",
                        "1",
                        "-max_delay",
                        "0",
                        "-c:v",
                        "libx264",
                        "-preset",
                        "veryfast",
                        "-tune",
                        "zerolatency",
                        "-g",
                        "30",
                        "-keyint_min",
                        "30",
                        "-c:a",
                        "aac",
                        "-b:a",
                        "96k",
                        "-f",
                        "mp4",
                        "-movflags",
                        "frag_keyframe+empty_moov+default_base_moof",
                        "pipe:1",
                    ]
                    .map(String::from),
                );
            }
        }

        args
    }
}

impl TranscoderLauncher for FfmpegLauncher {
    fn launch(&self, job: &TranscodeJob) -> Result<TranscoderHandle> {
        let args = Self::build_args(job);
        info!(
            session_id = %job.session_id,
            mode = %job.mode,
            "Starting ffmpeg with args: {:?}",
            args
        );

        let stdout = match job.mode {
            OutputMode::Segmented => Stdio::null(),
            OutputMode::Continuous => Stdio::piped(),
        };

        let mut command = process_utils::tokio_command(&self.config.binary_path);
        command
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| Error::spawn(&self.config.binary_path, &e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::config("Failed to capture ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::config("Failed to capture ffmpeg stderr"))?;
        let output = child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as TranscoderOutput);

        let (handle, TranscoderProcessSide { input, exit }) =
            TranscoderHandle::channel(INPUT_QUEUE, output);

        let session_id = job.session_id.to_string();

        tokio::spawn(pump_input(stdin, input, exit.terminate_token().clone()));

        // Monitor stderr; ffmpeg runs with `-loglevel error`, so every line matters.
        let stderr_id = session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => warn!(session_id = %stderr_id, "ffmpeg: {}", line),
                    Ok(None) => break,
                    Err(e) => {
                        error!(session_id = %stderr_id, error = %e, "Error reading ffmpeg stderr");
                        break;
                    }
                }
            }
        });

        tokio::spawn(wait_for_exit(child, exit, self.config.stop_grace, session_id));

        Ok(handle)
    }
}

/// Copy queued chunks into ffmpeg's stdin until terminated or the pipe breaks.
///
/// Dropping stdin on the way out gives ffmpeg EOF so it can finalize.
async fn pump_input(
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<Bytes>,
    terminate: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = terminate.cancelled() => break,
            chunk = input.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = terminate.cancelled() => break,
            written = stdin.write_all(&chunk) => {
                if let Err(e) = written {
                    debug!(error = %e, "ffmpeg stdin closed");
                    break;
                }
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    exit: ExitReporter,
    grace: std::time::Duration,
    session_id: String,
) {
    let code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code(),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Error waiting for ffmpeg");
                None
            }
        },
        _ = exit.terminate_token().cancelled() => {
            match process_utils::stop_child(&mut child, grace).await {
                Ok(outcome) => {
                    debug!(session_id = %session_id, ?outcome, "ffmpeg stopped");
                    outcome.code()
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to stop ffmpeg");
                    None
                }
            }
        }
    };

    info!(session_id = %session_id, code = ?code, "[-] ffmpeg exit");
    exit.report_exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use std::path::PathBuf;

    fn job(mode: OutputMode) -> TranscodeJob {
        TranscodeJob {
            session_id: SessionId::for_source("https://a.example/x").unwrap(),
            mode,
            output_dir: PathBuf::from("hls/stream_1"),
            playlist_name: "live.m3u8".to_string(),
            segment_base_url: "http://127.0.0.1:3001/hls/stream_1/".to_string(),
        }
    }

    #[test]
    fn test_segmented_args_write_rolling_playlist() {
        let args = FfmpegLauncher::build_args(&job(OutputMode::Segmented));

        assert_eq!(&args[..4], ["-loglevel", "error", "-i", "pipe:0"]);
        let hls_time = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[hls_time + 1], "1");
        let list_size = args.iter().position(|a| a == "-hls_list_size").unwrap();
        assert_eq!(args[list_size + 1], "5");
        let flags = args.iter().position(|a| a == "-hls_flags").unwrap();
        assert_eq!(args[flags + 1], "delete_segments+append_list");
        let base = args.iter().position(|a| a == "-hls_base_url").unwrap();
        assert_eq!(args[base + 1], "http://127.0.0.1:3001/hls/stream_1/");
        assert_eq!(args.last().unwrap(), "hls/stream_1/live.m3u8");
        assert!(!args.iter().any(|a| a == "pipe:1"));
    }

    #[test]
    fn test_continuous_args_pipe_fragmented_mp4() {
        let args = FfmpegLauncher::build_args(&job(OutputMode::Continuous));

        let format = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[format + 1], "mp4");
        let movflags = args.iter().position(|a| a == "-movflags").unwrap();
        assert_eq!(
            args[movflags + 1],
            "frag_keyframe+empty_moov+default_base_moof"
        );
        assert_eq!(args.last().unwrap(), "pipe:1");
        assert!(!args.iter().any(|a| a == "-hls_base_url"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process_and_reports_exit() {
        use std::time::Duration;

        // `cat` stands in for ffmpeg: it echoes stdin and exits on EOF.
        let mut command = process_utils::tokio_command("cat");
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command.spawn().unwrap();
        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().map(|s| Box::new(s) as TranscoderOutput);

        let (handle, TranscoderProcessSide { input, exit }) =
            TranscoderHandle::channel(INPUT_QUEUE, stdout);
        tokio::spawn(pump_input(stdin, input, exit.terminate_token().clone()));
        tokio::spawn(wait_for_exit(
            child,
            exit,
            Duration::from_secs(2),
            "stream_test".to_string(),
        ));

        let mut output = handle.take_output().unwrap();
        assert!(handle.input().write(Bytes::from_static(b"hello")).await);
        let mut buf = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut output, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"hello");

        handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.exited())
            .await
            .unwrap();
        assert!(exit.requested);
        assert_eq!(exit.code, Some(0));
    }
}
