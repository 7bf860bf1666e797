// Helper functions shared by backends

use std::process::Stdio;
use std::time::Duration;

use time::macros::format_description;
use time::Time;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

/// Run command with timeout, collecting stdout/stderr
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, String> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to start {}: {}", program, e))?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| format!("Failed to capture stdout from {}", program))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| format!("Failed to capture stderr from {}", program))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe
            .read_to_end(&mut buf)
            .await
            .map_err(|e| format!("Failed to read stdout: {}", e))?;
        Ok::<Vec<u8>, String>(buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe
            .read_to_end(&mut buf)
            .await
            .map_err(|e| format!("Failed to read stderr: {}", e))?;
        Ok::<Vec<u8>, String>(buf)
    });

    match timeout(Duration::from_secs(timeout_secs), child.wait()).await {
        Ok(status_res) => {
            let status = status_res.map_err(|e| format!("Failed to wait for {}: {}", program, e))?;
            let stdout = stdout_task
                .await
                .map_err(|e| format!("stdout task failed: {}", e))??;
            let stderr = stderr_task
                .await
                .map_err(|e| format!("stderr task failed: {}", e))??;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(format!("Timed out after {}s", timeout_secs))
        }
    }
}

/// Convert an ffmpeg timemark (`HH:MM:SS` or `HH:MM:SS.ffffff`) to seconds.
///
/// ffmpeg reports negative marks (`-00:00:00.01...`) before the first packet;
/// those count as zero.
pub fn to_seconds(timemark: &str) -> Option<f64> {
    let mark = timemark.trim();
    if mark.starts_with('-') {
        return Some(0.0);
    }

    let (hours, rest) = mark.split_once(':')?;
    let hours: u64 = hours.parse().ok()?;

    // `time` only knows wall-clock hours, so parse MM:SS(.f) against hour zero.
    let clock = format!("00:{}", rest);
    let parsed = if clock.contains('.') {
        Time::parse(&clock, format_description!("[hour]:[minute]:[second].[subsecond]"))
    } else {
        Time::parse(&clock, format_description!("[hour]:[minute]:[second]"))
    };
    let parsed = parsed.ok()?;

    Some(
        hours as f64 * 3600.0
            + parsed.minute() as f64 * 60.0
            + parsed.second() as f64
            + parsed.nanosecond() as f64 / 1e9,
    )
}

/// Whole percent of `total` covered by `elapsed`, rounded up and capped at 100
pub fn progress_percent(elapsed: Duration, total_seconds: u64) -> u8 {
    if total_seconds == 0 {
        return 0;
    }
    let pct = (elapsed.as_secs_f64() / total_seconds as f64 * 100.0).ceil();
    pct.clamp(0.0, 100.0) as u8
}

/// Build proxy arguments for yt-dlp
pub fn get_proxy_args(proxy: Option<&str>) -> Vec<String> {
    match proxy {
        Some(p) => vec!["--proxy".to_string(), p.to_string()],
        None => Vec::new(),
    }
}

/// Build timeout arguments for yt-dlp
pub fn get_timeout_args(timeout_secs: u64) -> Vec<String> {
    vec!["--socket-timeout".to_string(), timeout_secs.to_string()]
}
