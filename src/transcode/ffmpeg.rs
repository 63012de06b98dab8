//! ffmpeg invocation
//!
//! Both job kinds use stream copy: the tool only remuxes, it never
//! re-encodes. Captures are pinned to a fixed output frame rate.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::ToolProfile;
use crate::jobs::JobKind;
use crate::worker::StartRequest;

/// Binary looked up on PATH when nothing else is configured
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Output frame rate for live captures
pub const CAPTURE_FRAME_RATE: u32 = 30;

/// Pick the ffmpeg binary: the configured path if it exists, else `ffmpeg` on PATH
pub fn resolve_ffmpeg(configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(path) if path.exists() => path.to_path_buf(),
        Some(path) => {
            warn!(
                "Configured ffmpeg {:?} does not exist, falling back to {}",
                path, DEFAULT_FFMPEG
            );
            PathBuf::from(DEFAULT_FFMPEG)
        }
        None => PathBuf::from(DEFAULT_FFMPEG),
    }
}

/// Builds ffmpeg command lines for capture and cut jobs
#[derive(Debug, Clone)]
pub struct FfmpegProfile {
    program: PathBuf,
    frame_rate: u32,
}

impl FfmpegProfile {
    pub fn new(configured: Option<&Path>) -> Self {
        let program = resolve_ffmpeg(configured);
        debug!("Using ffmpeg binary {:?}", program);
        Self {
            program,
            frame_rate: CAPTURE_FRAME_RATE,
        }
    }
}

impl ToolProfile for FfmpegProfile {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn default_program(&self) -> PathBuf {
        self.program.clone()
    }

    fn arguments(&self, request: &StartRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostats", "-y"]
            .iter()
            .map(OsString::from)
            .collect();

        match &request.kind {
            JobKind::Capture => {
                args.push("-i".into());
                args.push(request.target.clone().into());
                args.extend(
                    ["-c:v", "copy", "-c:a", "copy", "-r"]
                        .iter()
                        .map(OsString::from),
                );
                args.push(self.frame_rate.to_string().into());
            }
            JobKind::Cut { start, end } => {
                args.push("-ss".into());
                args.push(start.into());
                args.push("-to".into());
                args.push(end.into());
                args.push("-i".into());
                args.push(request.target.clone().into());
                args.extend(["-c:v", "copy", "-c:a", "copy"].iter().map(OsString::from));
            }
        }

        args.push(request.output_path.clone().into_os_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_capture_arguments_use_stream_copy_and_fixed_rate() {
        let profile = FfmpegProfile::new(None);
        let request = StartRequest {
            target: "https://live.example/stream.flv".to_string(),
            output_path: PathBuf::from("/out/a.mp4"),
            tool_path: None,
            kind: JobKind::Capture,
        };

        assert_eq!(
            strings(profile.arguments(&request)),
            vec![
                "-hide_banner",
                "-nostats",
                "-y",
                "-i",
                "https://live.example/stream.flv",
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-r",
                "30",
                "/out/a.mp4",
            ]
        );
    }

    #[test]
    fn test_cut_arguments_seek_before_input() {
        let profile = FfmpegProfile::new(None);
        let request = StartRequest {
            target: "/videos/source.mp4".to_string(),
            output_path: PathBuf::from("/out/clip.mp4"),
            tool_path: None,
            kind: JobKind::Cut {
                start: "00:01:00".to_string(),
                end: "00:02:30".to_string(),
            },
        };

        let args = strings(profile.arguments(&request));
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "00:01:00");
        assert!(args.contains(&"00:02:30".to_string()));
        assert!(!args.contains(&"-r".to_string()));
        assert_eq!(args.last().unwrap(), "/out/clip.mp4");
    }

    #[test]
    fn test_missing_configured_binary_falls_back_to_path() {
        let resolved = resolve_ffmpeg(Some(Path::new("/definitely/not/here/ffmpeg")));
        assert_eq!(resolved, PathBuf::from(DEFAULT_FFMPEG));
        assert_eq!(resolve_ffmpeg(None), PathBuf::from(DEFAULT_FFMPEG));
    }

    #[test]
    fn test_existing_configured_binary_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg");
        std::fs::write(&fake, b"").unwrap();

        assert_eq!(resolve_ffmpeg(Some(&fake)), fake);
    }
}
