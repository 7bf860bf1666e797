// ffmpeg transcoder
//
// Audio: the stream goes into stdin, progress comes back on stdout.
// Video: ffmpeg reads audio on fd 4 and video on fd 5, and writes progress to
// fd 3, so neither stream ever touches the disk. Platforms without fd passing
// spool both streams to part files first.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::downloader::errors::DownloadError;
use crate::downloader::traits::{MediaStream, ProgressSink, Transcoder};
use crate::downloader::utils::to_seconds;

const PUMP_BUFFER: usize = 64 * 1024;

/// Default upper bound for one encode or mux
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    audio_bitrate_kbps: u32,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, audio_bitrate_kbps: u32, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            audio_bitrate_kbps,
            timeout,
        }
    }

    fn command(&self, args: Vec<String>) -> TokioCommand {
        tracing::debug!("[Ffmpeg] {} {}", self.ffmpeg_path, args.join(" "));
        let mut cmd = TokioCommand::new(&self.ffmpeg_path);
        cmd.args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> DownloadError {
        if e.kind() == std::io::ErrorKind::NotFound {
            DownloadError::ToolNotFound(format!("ffmpeg ({})", self.ffmpeg_path))
        } else {
            DownloadError::Transcode(format!("failed to start ffmpeg: {}", e))
        }
    }

    #[cfg(unix)]
    async fn mux_piped(
        &self,
        audio: MediaStream,
        video: MediaStream,
        output: &Path,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        use std::os::fd::AsRawFd;
        use tokio::net::unix::pipe;

        let (progress_r, progress_w) = fdpipe::pipe()?;
        let (audio_r, audio_w) = fdpipe::pipe()?;
        let (video_r, video_w) = fdpipe::pipe()?;

        let child_fds = [progress_w.as_raw_fd(), audio_r.as_raw_fd(), video_r.as_raw_fd()];
        let mut cmd = self.command(mux_args(output));
        cmd.stdin(Stdio::null());
        // SAFETY: fdpipe::install only calls fcntl and dup2, both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || fdpipe::install(child_fds));
        }
        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // ffmpeg holds its own copies now; ours would keep the pipes from closing
        drop(progress_w);
        drop(audio_r);
        drop(video_r);

        let progress_rx = pipe::Receiver::from_owned_fd(progress_r)?;
        let audio_tx = pipe::Sender::from_owned_fd(audio_w)?;
        let video_tx = pipe::Sender::from_owned_fd(video_w)?;

        let pumps = tokio::spawn(async move {
            tokio::try_join!(pump(audio, audio_tx, "audio"), pump(video, video_tx, "video"))?;
            Ok::<(), DownloadError>(())
        });
        let reader = tokio::spawn(read_progress(progress_rx, progress));

        supervise(child, pumps, reader, self.timeout, cancel).await
    }

    #[cfg(not(unix))]
    async fn mux_spooled(
        &self,
        audio: MediaStream,
        video: MediaStream,
        output: &Path,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let audio_part = part_path(output, "audio");
        let video_part = part_path(output, "video");

        let spooled = tokio::select! {
            res = async {
                tokio::try_join!(
                    spool(audio, &audio_part, "audio"),
                    spool(video, &video_part, "video")
                )
            } => res.map(|_| ()),
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        };

        let result = match spooled {
            Ok(()) => {
                let mut cmd = self.command(spooled_mux_args(&audio_part, &video_part, output));
                cmd.stdin(Stdio::null()).stdout(Stdio::piped());
                match cmd.spawn() {
                    Ok(mut child) => match child.stdout.take() {
                        Some(stdout) => {
                            let reader = tokio::spawn(read_progress(stdout, progress));
                            let pumps = tokio::spawn(async { Ok::<(), DownloadError>(()) });
                            supervise(child, pumps, reader, self.timeout, cancel).await
                        }
                        None => Err(DownloadError::Transcode(
                            "failed to capture ffmpeg stdout".to_string(),
                        )),
                    },
                    Err(e) => Err(self.spawn_error(e)),
                }
            }
            Err(e) => Err(e),
        };

        let _ = tokio::fs::remove_file(&audio_part).await;
        let _ = tokio::fs::remove_file(&video_part).await;
        result
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn encode_audio(
        &self,
        audio: MediaStream,
        output: &Path,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut cmd = self.command(audio_args(output, self.audio_bitrate_kbps));
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DownloadError::Transcode("failed to open ffmpeg stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Transcode("failed to capture ffmpeg stdout".to_string()))?;

        let pumps = tokio::spawn(async move { pump(audio, stdin, "audio").await.map(|_| ()) });
        let reader = tokio::spawn(read_progress(stdout, progress));

        supervise(child, pumps, reader, self.timeout, cancel).await
    }

    async fn mux(
        &self,
        audio: MediaStream,
        video: MediaStream,
        output: &Path,
        progress: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        #[cfg(unix)]
        {
            self.mux_piped(audio, video, output, progress, cancel).await
        }
        #[cfg(not(unix))]
        {
            self.mux_spooled(audio, video, output, progress, cancel).await
        }
    }
}

/// Arguments for the audio-only encode
pub fn audio_args(output: &Path, bitrate_kbps: u32) -> Vec<String> {
    vec![
        "-loglevel".to_string(),
        "8".to_string(),
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-n".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-vn".to_string(),
        "-b:a".to_string(),
        format!("{}k", bitrate_kbps),
        output.to_string_lossy().into_owned(),
    ]
}

/// Arguments for the fd 3/4/5 mux: audio from input 0, video copied from input 1
pub fn mux_args(output: &Path) -> Vec<String> {
    [
        "-loglevel", "8", "-hide_banner",
        "-progress", "pipe:3",
        "-i", "pipe:4",
        "-i", "pipe:5",
        "-map", "0:a",
        "-map", "1:v",
        "-c:v", "copy",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain(std::iter::once(output.to_string_lossy().into_owned()))
    .collect()
}

#[cfg(not(unix))]
fn spooled_mux_args(audio: &Path, video: &Path, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-loglevel", "8", "-hide_banner", "-nostdin", "-progress", "pipe:1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push("-i".to_string());
    args.push(audio.to_string_lossy().into_owned());
    args.push("-i".to_string());
    args.push(video.to_string_lossy().into_owned());
    for arg in ["-map", "0:a", "-map", "1:v", "-c:v", "copy"] {
        args.push(arg.to_string());
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

#[cfg(not(unix))]
fn part_path(output: &Path, kind: &str) -> std::path::PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(format!(".{}.part", kind));
    std::path::PathBuf::from(name)
}

#[cfg(not(unix))]
async fn spool(source: MediaStream, path: &Path, label: &'static str) -> Result<u64, DownloadError> {
    let file = tokio::fs::File::create(path).await?;
    pump(source, file, label).await
}

/// Elapsed output time from one `-progress` line, if the line carries it
pub fn parse_progress_line(line: &str) -> Option<Duration> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time" => to_seconds(value).map(Duration::from_secs_f64),
        "out_time_us" => value
            .parse::<i64>()
            .ok()
            .map(|us| Duration::from_micros(us.max(0) as u64)),
        _ => None,
    }
}

/// Forward every elapsed time ffmpeg reports until the pipe closes
async fn read_progress<R: AsyncRead + Unpin>(reader: R, sink: ProgressSink) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(elapsed) = parse_progress_line(&line) {
                    // Keep draining even with nobody listening, or ffmpeg blocks
                    let _ = sink.send(elapsed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("[Ffmpeg] progress pipe error: {}", e);
                break;
            }
        }
    }
}

/// Copy `source` into `sink`. A failing source is an error; a sink that
/// closes early is not, ffmpeg's exit status tells what happened.
async fn pump<W: AsyncWrite + Unpin>(
    mut source: MediaStream,
    mut sink: W,
    label: &'static str,
) -> Result<u64, DownloadError> {
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut total = 0u64;
    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| DownloadError::Stream(format!("{} stream: {}", label, e)))?;
        if n == 0 {
            break;
        }
        if let Err(e) = sink.write_all(&buf[..n]).await {
            tracing::debug!("[Ffmpeg] {} pipe closed after {} bytes: {}", label, total, e);
            return Ok(total);
        }
        total += n as u64;
    }
    let _ = sink.shutdown().await;
    tracing::debug!("[Ffmpeg] {} stream done, {} bytes", label, total);
    Ok(total)
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Failed(DownloadError),
    TimedOut,
    Cancelled,
}

/// Wait for ffmpeg while the pumps run; kill it on stream failure, timeout or
/// cancellation.
async fn supervise(
    mut child: Child,
    mut pumps: JoinHandle<Result<(), DownloadError>>,
    reader: JoinHandle<()>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        })
    });

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut pumps_done = false;

    let exit = loop {
        let exit = tokio::select! {
            status = child.wait() => Some(Exit::Status(status)),
            joined = &mut pumps, if !pumps_done => {
                pumps_done = true;
                match joined {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(Exit::Failed(e)),
                    Err(e) => Some(Exit::Failed(DownloadError::Stream(format!("stream task failed: {}", e)))),
                }
            }
            _ = &mut deadline => Some(Exit::TimedOut),
            _ = cancel.cancelled() => Some(Exit::Cancelled),
        };
        if let Some(exit) = exit {
            break exit;
        }
    };

    let status = match exit {
        Exit::Status(status) => status,
        Exit::Failed(e) => {
            tracing::warn!("[Ffmpeg] stream failed, stopping ffmpeg: {}", e);
            return stop(child, pumps, reader, e).await;
        }
        Exit::TimedOut => {
            tracing::warn!("[Ffmpeg] no exit after {}s, stopping ffmpeg", timeout.as_secs());
            return stop(child, pumps, reader, DownloadError::Timeout(timeout.as_secs())).await;
        }
        Exit::Cancelled => return stop(child, pumps, reader, DownloadError::Cancelled).await,
    };

    pumps.abort();
    let _ = reader.await;
    let status = status?;
    if status.success() {
        return Ok(());
    }

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let message = stderr.trim();
    Err(DownloadError::Transcode(if message.is_empty() {
        format!("exited with {}", status)
    } else {
        message.lines().last().unwrap_or(message).to_string()
    }))
}

async fn stop(
    mut child: Child,
    pumps: JoinHandle<Result<(), DownloadError>>,
    reader: JoinHandle<()>,
    error: DownloadError,
) -> Result<(), DownloadError> {
    let _ = child.kill().await;
    pumps.abort();
    reader.abort();
    Err(error)
}

#[cfg(unix)]
mod fdpipe {
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    /// First fd handed to ffmpeg; the others follow
    const FIRST_CHILD_FD: RawFd = 3;
    /// Scratch range used while shuffling fds in the child
    const SCRATCH_FD: RawFd = 10;

    /// Anonymous pipe, (read end, write end), both close-on-exec
    pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as libc::c_int; 2];

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe just returned these two fds and nothing else owns them.
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        for fd in [fds[0], fds[1]] {
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok((r, w))
    }

    /// Runs in the forked child: put `sources` on fds 3, 4, 5.
    ///
    /// Sources are first moved out of the way so an earlier dup2 can never
    /// clobber a later source. The scratch copies are close-on-exec; the
    /// dup2 targets are not.
    pub fn install(sources: [RawFd; 3]) -> io::Result<()> {
        let mut moved = [0 as RawFd; 3];
        for (slot, fd) in moved.iter_mut().zip(sources) {
            let high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, SCRATCH_FD) };
            if high < 0 {
                return Err(io::Error::last_os_error());
            }
            *slot = high;
        }
        for (target, fd) in (FIRST_CHILD_FD..).zip(moved) {
            if unsafe { libc::dup2(fd, target) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
