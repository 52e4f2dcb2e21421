//! External media tools: the segmenter that cuts a source into shards and the
//! remuxer that joins decrypted shards back into one playable file.

use log::{debug, info};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::ToolError;

/// Cuts a source asset into a fixed number of contiguous segments.
pub trait Segmenter: Send + Sync {
    /// Write segments into `out_dir` and return how many were produced.
    fn segment(&self, source: &Path, out_dir: &Path) -> Result<usize, ToolError>;
}

/// Joins ordered segments into one file without re-encoding.
pub trait Remuxer: Send + Sync {
    fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<(), ToolError>;
}

/// `ffprobe` for the duration, then `ffmpeg -f segment` with keyframes
/// forced at every cut point.
#[derive(Debug, Clone)]
pub struct FfmpegSegmenter {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    total_shards: usize,
}

impl FfmpegSegmenter {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, total_shards: usize) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            total_shards: total_shards.max(1),
        }
    }

    fn probe_duration(&self, source: &Path) -> Result<f64, ToolError> {
        let mut args: Vec<OsString> = [
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(source.as_os_str().to_owned());

        let stdout = run_tool(&self.ffprobe, &args)?;
        let text = String::from_utf8_lossy(&stdout);
        let duration: f64 = text.trim().parse().map_err(|_| ToolError::UnexpectedOutput {
            tool: tool_name(&self.ffprobe),
            detail: format!("duration {:?}", text.trim()),
        })?;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(ToolError::UnexpectedOutput {
                tool: tool_name(&self.ffprobe),
                detail: format!("non-positive duration {}", duration),
            });
        }
        Ok(duration)
    }

    /// Whole seconds per segment so that `total_shards` segments cover the source.
    pub fn segment_seconds(&self, duration: f64) -> u64 {
        ((duration / self.total_shards as f64).ceil() as u64).max(1)
    }

    /// Arguments for the segmenting `ffmpeg` run.
    pub fn segment_args(&self, source: &Path, out_dir: &Path, segment_seconds: u64) -> Vec<OsString> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let pattern = out_dir.join(format!("{}_part%03d.mp4", stem));
        let keyframes = format!("expr:gte(t,n_forced*{})", segment_seconds);
        let seconds = segment_seconds.to_string();

        let mut args: Vec<OsString> = Vec::new();
        args.push("-y".into());
        args.push("-i".into());
        args.push(source.as_os_str().to_owned());
        for arg in [
            "-c:v",
            "libx264",
            "-preset",
            "fast",
            "-crf",
            "23",
            "-force_key_frames",
            keyframes.as_str(),
            "-c:a",
            "aac",
            "-f",
            "segment",
            "-segment_time",
            seconds.as_str(),
            "-reset_timestamps",
            "1",
        ] {
            args.push(arg.into());
        }
        args.push(pattern.into_os_string());
        args
    }
}

impl Segmenter for FfmpegSegmenter {
    fn segment(&self, source: &Path, out_dir: &Path) -> Result<usize, ToolError> {
        let duration = self.probe_duration(source)?;
        let seconds = self.segment_seconds(duration);
        info!(
            "Segmenting {} duration={:.1}s segment_time={}s target={}",
            source.display(),
            duration,
            seconds,
            self.total_shards
        );

        run_tool(&self.ffmpeg, &self.segment_args(source, out_dir, seconds))?;

        let produced = fs::read_dir(out_dir)?
            .flatten()
            .filter(|entry| entry.path().is_file())
            .count();
        Ok(produced)
    }
}

/// `ffmpeg -f concat -c copy` over a generated list file.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    ffmpeg: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

impl Remuxer for FfmpegRemuxer {
    fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list_path = list_dir.join("concat_list.txt");
        fs::write(&list_path, concat_list(parts))?;

        let mut args: Vec<OsString> = ["-y", "-f", "concat", "-safe", "0", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(list_path.as_os_str().to_owned());
        args.push("-c".into());
        args.push("copy".into());
        args.push(output.as_os_str().to_owned());

        let result = run_tool(&self.ffmpeg, &args).map(|_| ());
        let _ = fs::remove_file(&list_path);
        result
    }
}

/// Concat demuxer list: one `file '<path>'` line per part.
pub fn concat_list(parts: &[PathBuf]) -> String {
    let mut list = String::new();
    for part in parts {
        let escaped = part.to_string_lossy().replace('\'', "'\\''");
        list.push_str("file '");
        list.push_str(&escaped);
        list.push_str("'\n");
    }
    list
}

/// Appends parts byte for byte. Lossless for MPEG-TS and raw streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteConcatRemuxer;

impl Remuxer for ByteConcatRemuxer {
    fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        let mut out = File::create(output)?;
        for part in parts {
            let mut input = File::open(part)?;
            io::copy(&mut input, &mut out)?;
        }
        out.flush()?;
        out.sync_all()?;
        Ok(())
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Run `program` to completion and return its stdout, or the failure with stderr.
fn run_tool(program: &Path, args: &[OsString]) -> Result<Vec<u8>, ToolError> {
    debug!("Running {} {:?}", program.display(), args);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| ToolError::Launch {
            tool: tool_name(program),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ToolError::Failed {
            tool: tool_name(program),
            status: output.status.to_string(),
            stderr: tail,
        });
    }
    Ok(output.stdout)
}
