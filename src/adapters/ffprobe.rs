//! Media probing through ffprobe and `ffmpeg -encoders`.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::MediaProbe;

#[derive(Debug, Clone)]
pub struct FfprobeMedia {
    ffprobe_path: String,
    ffmpeg_path: String,
}

impl Default for FfprobeMedia {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfprobeMedia {
    /// `ffprobe` is looked up next to the given ffmpeg binary
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        let ffmpeg_path = ffmpeg_path.into();
        let ffprobe_path = match ffmpeg_path.rfind("ffmpeg") {
            Some(pos) => format!("{}ffprobe{}", &ffmpeg_path[..pos], &ffmpeg_path[pos + 6..]),
            None => "ffprobe".to_string(),
        };
        Self {
            ffprobe_path,
            ffmpeg_path,
        }
    }
}

#[async_trait]
impl MediaProbe for FfprobeMedia {
    async fn duration_secs(&self, path: &Path) -> Result<Option<f64>> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.ffprobe_path))?;

        if !output.status.success() {
            debug!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "ffprobe could not read duration"
            );
            return Ok(None);
        }

        Ok(parse_duration(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn has_encoder(&self, encoder: &str) -> Result<bool> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .output()
            .await
            .with_context(|| format!("Failed to run {} -encoders", self.ffmpeg_path))?;

        Ok(lists_encoder(&String::from_utf8_lossy(&output.stdout), encoder))
    }
}

fn parse_duration(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .find(|d| d.is_finite() && *d >= 0.0)
}

/// Encoder lines look like ` V..... h264_v4l2m2m  V4L2 mem2mem H.264 encoder wrapper`
fn lists_encoder(text: &str, encoder: &str) -> bool {
    text.lines()
        .any(|line| line.split_whitespace().nth(1) == Some(encoder))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600.021000\n"), Some(3600.021));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_lists_encoder() {
        let listing = "\
Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V..... h264_v4l2m2m         V4L2 mem2mem H.264 encoder wrapper (codec h264)
";
        assert!(lists_encoder(listing, "h264_v4l2m2m"));
        assert!(lists_encoder(listing, "libx264"));
        assert!(!lists_encoder(listing, "h264_nvenc"));
        assert!(!lists_encoder(listing, "Video"));
    }

    #[test]
    fn test_ffprobe_path_follows_ffmpeg() {
        let media = FfprobeMedia::new("/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(media.ffprobe_path, "/opt/ffmpeg/bin/ffprobe");
        assert_eq!(FfprobeMedia::default().ffprobe_path, "ffprobe");
    }
}
