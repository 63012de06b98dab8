//! Batch files: several jobs described in one TOML document
//!
//! ```toml
//! sequential = true
//!
//! [[job]]
//! target = "https://example.com/live/a.m3u8"
//!
//! [[job]]
//! target = "recordings/a.mp4"
//! output = "clips/a-intro.mp4"
//! start = "00:00:05"
//! end = "00:01:00"
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::jobs::JobRequest;

/// Parsed batch file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchFile {
    /// Run one job at a time with cooldown and retries instead of all at once
    #[serde(default)]
    pub sequential: bool,

    #[serde(default, rename = "job")]
    pub jobs: Vec<BatchJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub target: String,
    /// Relative paths resolve against the configured output directory
    pub output: Option<PathBuf>,
    pub tool: Option<PathBuf>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch file: {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Invalid batch file: {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let batch: BatchFile = toml::from_str(contents).context("Failed to parse batch TOML")?;
        if batch.jobs.is_empty() {
            bail!("batch contains no [[job]] entries");
        }
        Ok(batch)
    }

    /// Turn every entry into a job request
    pub fn to_requests(
        &self,
        output_dir: &Path,
        default_tool: Option<&Path>,
    ) -> Result<Vec<JobRequest>> {
        let now = Local::now();
        self.jobs
            .iter()
            .enumerate()
            .map(|(index, job)| {
                job.to_request(output_dir, default_tool, now)
                    .with_context(|| format!("job #{} ({})", index + 1, job.target))
            })
            .collect()
    }
}

impl BatchJob {
    fn to_request(
        &self,
        output_dir: &Path,
        default_tool: Option<&Path>,
        now: DateTime<Local>,
    ) -> Result<JobRequest> {
        if self.target.trim().is_empty() {
            bail!("target is empty");
        }

        let output = match &self.output {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => output_dir.join(path),
            None => default_output_path(output_dir, &self.target, now),
        };

        let request = match (&self.start, &self.end) {
            (None, None) => JobRequest::capture(self.target.clone(), output),
            (Some(start), Some(end)) => {
                if self.output.is_none() {
                    bail!("cut jobs need an explicit output");
                }
                JobRequest::cut(self.target.clone(), output, start.clone(), end.clone())
            }
            _ => bail!("cut jobs need both start and end"),
        };

        Ok(match self.tool.as_deref().or(default_tool) {
            Some(tool) => request.with_tool_path(tool),
            None => request,
        })
    }
}

/// `<dir>/<name>-<timestamp>.mp4`, with the name taken from the target's last
/// path segment
pub fn default_output_path(output_dir: &Path, target: &str, now: DateTime<Local>) -> PathBuf {
    let segment = target
        .split(['?', '#'])
        .next()
        .unwrap_or(target)
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("");
    let stem = segment.split('.').next().unwrap_or("");

    let mut name: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        name = "capture".to_string();
    }

    output_dir.join(format!("{}-{}.mp4", name, now.format("%Y%m%d-%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap()
    }

    #[test]
    fn test_default_output_name_from_url() {
        let dir = Path::new("/videos");
        assert_eq!(
            default_output_path(dir, "https://cdn.example.com/live/room42.m3u8?token=x", fixed_now()),
            PathBuf::from("/videos/room42-20240309-140500.mp4")
        );
        assert_eq!(
            default_output_path(dir, "rtmp://host/", fixed_now()),
            PathBuf::from("/videos/host-20240309-140500.mp4")
        );
        assert_eq!(
            default_output_path(dir, "???", fixed_now()),
            PathBuf::from("/videos/capture-20240309-140500.mp4")
        );
    }

    #[test]
    fn test_parse_mixed_batch() {
        let batch = BatchFile::parse(
            r#"
sequential = true

[[job]]
target = "https://example.com/live/a.m3u8"
output = "a.mp4"

[[job]]
target = "/rec/b.mp4"
output = "/clips/b-intro.mp4"
start = "00:00:05"
end = "00:01:00"
tool = "/opt/ffmpeg"
"#,
        )
        .unwrap();
        assert!(batch.sequential);

        let requests = batch
            .to_requests(Path::new("/videos"), Some(Path::new("/usr/bin/ffmpeg")))
            .unwrap();
        assert_eq!(requests.len(), 2);

        assert_eq!(requests[0].kind, JobKind::Capture);
        assert_eq!(requests[0].output_path, PathBuf::from("/videos/a.mp4"));
        assert_eq!(requests[0].tool_path, Some(PathBuf::from("/usr/bin/ffmpeg")));

        assert_eq!(
            requests[1].kind,
            JobKind::Cut {
                start: "00:00:05".to_string(),
                end: "00:01:00".to_string()
            }
        );
        assert_eq!(requests[1].output_path, PathBuf::from("/clips/b-intro.mp4"));
        assert_eq!(requests[1].tool_path, Some(PathBuf::from("/opt/ffmpeg")));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let err = BatchFile::parse("sequential = false\n").unwrap_err();
        assert!(err.to_string().contains("no [[job]]"));
    }

    #[test]
    fn test_half_cut_rejected() {
        let batch = BatchFile::parse(
            "[[job]]\ntarget = \"/rec/a.mp4\"\noutput = \"x.mp4\"\nstart = \"00:00:01\"\n",
        )
        .unwrap();
        let err = batch.to_requests(Path::new("/videos"), None).unwrap_err();
        assert!(format!("{:#}", err).contains("both start and end"));
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let dir = tempfile::tempdir().unwrap();
        let err = BatchFile::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read batch file"));
    }
}
