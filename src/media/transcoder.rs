//! Transcoder wrapper (ffmpeg command line)

use super::error::MediaError;
use crate::tools::Tool;
use std::path::Path;
use std::time::Duration;

/// Encoder arguments for an output format
pub fn codec_args(format: &str, bitrate: &str) -> Vec<String> {
    let lossy = |codec: &str| {
        vec![
            "-codec:a".to_string(),
            codec.to_string(),
            "-b:a".to_string(),
            bitrate.to_string(),
        ]
    };
    match format {
        "m4a" => lossy("aac"),
        "opus" => lossy("libopus"),
        "ogg" => lossy("libvorbis"),
        "wav" => vec!["-codec:a".to_string(), "pcm_s16le".to_string()],
        "flac" => vec!["-codec:a".to_string(), "flac".to_string()],
        _ => lossy("libmp3lame"),
    }
}

pub struct Transcoder {
    tool: Tool,
    bitrate: String,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(tool: Tool, bitrate: String, timeout: Duration) -> Self {
        Self {
            tool,
            bitrate,
            timeout,
        }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn args(&self, input: &Path, output: &Path, format: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-y", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(input.to_string_lossy().into_owned());
        args.push("-vn".to_string());
        args.extend(codec_args(format, &self.bitrate));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Transcode `input` into `output`; a failed run leaves no output behind
    pub async fn transcode(&self, input: &Path, output: &Path, format: &str) -> Result<(), MediaError> {
        let result = self.tool.run(self.args(input, output, format), self.timeout).await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(output).await;
            return Err(e.into());
        }
        Ok(())
    }
}
