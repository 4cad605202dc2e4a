//! Media extractor wrapper (yt-dlp command line)

use super::error::MediaError;
use crate::tools::Tool;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Output template inside a job's work directory
const OUTPUT_TEMPLATE: &str = "source.%(ext)s";

/// Where a conversion takes its input from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertSource {
    /// Direct page or media URL
    Url(String),
    /// Free-text query, resolved to the first search hit
    Search(String),
}

impl ConvertSource {
    /// Build a source from request parameters; `url` wins over `q`
    pub fn from_params(url: Option<&str>, query: Option<&str>) -> Result<Self, MediaError> {
        let url = url.map(str::trim).filter(|u| !u.is_empty());
        let query = query.map(str::trim).filter(|q| !q.is_empty());

        match (url, query) {
            (Some(url), _) => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(ConvertSource::Url(url.to_string()))
                } else {
                    Err(MediaError::InvalidSource(url.to_string()))
                }
            }
            (None, Some(query)) => Ok(ConvertSource::Search(query.to_string())),
            (None, None) => Err(MediaError::MissingSource),
        }
    }

    /// The argument handed to the extractor (also the key input)
    pub fn target(&self) -> String {
        match self {
            ConvertSource::Url(url) => url.clone(),
            ConvertSource::Search(query) => format!("ytsearch1:{}", query),
        }
    }
}

/// One search hit
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub title: Option<String>,
    pub url: String,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
}

/// Fields read from the extractor's info JSON
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub entries: Vec<ExtractedInfo>,
}

impl ExtractedInfo {
    /// Playlists (search results) carry the downloaded item in `entries`
    fn into_item(mut self) -> Self {
        if self.entries.is_empty() {
            self
        } else {
            self.entries.swap_remove(0)
        }
    }

    fn uploader(&self) -> Option<String> {
        self.uploader.clone().or_else(|| self.channel.clone())
    }
}

/// Result of a download into a work directory
#[derive(Debug)]
pub struct Downloaded {
    pub path: PathBuf,
    pub info: ExtractedInfo,
}

impl Downloaded {
    pub fn uploader(&self) -> Option<String> {
        self.info.uploader()
    }
}

pub struct Extractor {
    tool: Tool,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl Extractor {
    pub fn new(tool: Tool, extra_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            tool,
            extra_args,
            timeout,
        }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn search_args(&self, query: &str, limit: usize) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend(
            ["--dump-json", "--flat-playlist", "--no-warnings", "--"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(format!("ytsearch{}:{}", limit, query));
        args
    }

    pub fn download_args(&self, target: &str, work_dir: &Path) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend(
            [
                "--no-playlist",
                "--no-progress",
                "--no-warnings",
                "-f",
                "bestaudio/best",
                "--dump-single-json",
                "--no-simulate",
                "-o",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(work_dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned());
        args.push("--".to_string());
        args.push(target.to_string());
        args
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, MediaError> {
        let output = self.tool.run(self.search_args(query, limit), self.timeout).await?;
        Ok(parse_search_output(&output.stdout))
    }

    /// Download the best audio stream for `target` into `work_dir`
    pub async fn download(&self, target: &str, work_dir: &Path) -> Result<Downloaded, MediaError> {
        let output = self
            .tool
            .run(self.download_args(target, work_dir), self.timeout)
            .await?;

        let info = parse_info_output(&output.stdout)?;
        let path = find_output_file(work_dir).await?;
        debug!(target, path = %path.display(), title = ?info.title, "Extractor download finished");

        Ok(Downloaded { path, info })
    }
}

/// One JSON object per line; unparseable lines are skipped
pub fn parse_search_output(stdout: &str) -> Vec<SearchResult> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<ExtractedInfo>(line) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Skipping unparseable search result line");
                None
            }
        })
        .filter_map(|info| {
            let id = info.id.clone()?;
            let url = info
                .webpage_url
                .clone()
                .or_else(|| info.url.clone())
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));
            Some(SearchResult {
                uploader: info.uploader(),
                id,
                title: info.title,
                url,
                duration: info.duration,
            })
        })
        .collect()
}

/// The info JSON is the last non-empty line of stdout
pub fn parse_info_output(stdout: &str) -> Result<ExtractedInfo, MediaError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .ok_or(MediaError::NoOutput)?;
    let info: ExtractedInfo = serde_json::from_str(line)?;
    Ok(info.into_item())
}

async fn find_output_file(work_dir: &Path) -> Result<PathBuf, MediaError> {
    let mut entries = tokio::fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".part") || name.ends_with(".ytdl") || name.starts_with('.') {
            continue;
        }
        if entry.file_type().await?.is_file() {
            return Ok(entry.path());
        }
    }
    Err(MediaError::NoOutput)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(extra: &[&str]) -> Extractor {
        Extractor::new(
            Tool {
                name: "extractor",
                path: PathBuf::from("yt-dlp"),
            },
            extra.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_source_from_params() {
        assert_eq!(
            ConvertSource::from_params(Some(" https://youtu.be/x "), Some("ignored")).unwrap(),
            ConvertSource::Url("https://youtu.be/x".to_string())
        );
        assert_eq!(
            ConvertSource::from_params(None, Some("daft punk")).unwrap(),
            ConvertSource::Search("daft punk".to_string())
        );
        assert_eq!(
            ConvertSource::from_params(Some(""), Some("q")).unwrap(),
            ConvertSource::Search("q".to_string())
        );
        assert!(matches!(
            ConvertSource::from_params(Some("--exec rm"), None),
            Err(MediaError::InvalidSource(_))
        ));
        assert!(matches!(
            ConvertSource::from_params(None, Some("  ")),
            Err(MediaError::MissingSource)
        ));
    }

    #[test]
    fn test_search_target() {
        let source = ConvertSource::Search("lofi beats".into());
        assert_eq!(source.target(), "ytsearch1:lofi beats");
    }

    #[test]
    fn test_args_put_target_after_separator() {
        let ex = extractor(&["--cookies", "c.txt"]);

        let args = ex.search_args("a b", 5);
        assert_eq!(&args[..2], &["--cookies".to_string(), "c.txt".to_string()]);
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args.last().unwrap(), "ytsearch5:a b");

        let args = ex.download_args("https://youtu.be/x", Path::new("/work/job-1"));
        assert_eq!(args.last().unwrap(), "https://youtu.be/x");
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args[args.len() - 3], "/work/job-1/source.%(ext)s");
        assert!(args.contains(&"--dump-single-json".to_string()));
    }

    #[test]
    fn test_parse_search_output() {
        let stdout = r#"
{"id": "abc", "title": "First", "url": "https://www.youtube.com/watch?v=abc", "duration": 212.0, "channel": "Chan"}
not json
{"id": "def", "title": "Second", "uploader": "Up"}
{"title": "no id"}
"#;
        let results = parse_search_output(stdout);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "abc");
        assert_eq!(results[0].uploader.as_deref(), Some("Chan"));
        assert_eq!(results[0].duration, Some(212.0));
        assert_eq!(results[1].url, "https://www.youtube.com/watch?v=def");
        assert_eq!(results[1].uploader.as_deref(), Some("Up"));
    }

    #[test]
    fn test_parse_info_output_single_and_playlist() {
        let info = parse_info_output("[download] done\n{\"id\":\"x\",\"title\":\"T\"}\n").unwrap();
        assert_eq!(info.id.as_deref(), Some("x"));

        let playlist = r#"{"id":"ytsearch1:q","entries":[{"id":"y","title":"Hit","duration":3.5}]}"#;
        let info = parse_info_output(playlist).unwrap();
        assert_eq!(info.id.as_deref(), Some("y"));
        assert_eq!(info.title.as_deref(), Some("Hit"));

        assert!(matches!(parse_info_output("  \n"), Err(MediaError::NoOutput)));
        assert!(matches!(parse_info_output("garbage"), Err(MediaError::Parse(_))));
    }

    #[tokio::test]
    async fn test_find_output_file_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_output_file(dir.path()).await,
            Err(MediaError::NoOutput)
        ));

        std::fs::write(dir.path().join("source.webm.part"), b"x").unwrap();
        assert!(find_output_file(dir.path()).await.is_err());

        std::fs::write(dir.path().join("source.webm"), b"x").unwrap();
        let found = find_output_file(dir.path()).await.unwrap();
        assert_eq!(found, dir.path().join("source.webm"));
    }
}
