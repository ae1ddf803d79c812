use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "flv", "wmv", "m4v"];
pub const MAX_IMAGES: usize = 9;

/// Format used for schedule strings on the command line and in platform date pickers.
pub const SCHEDULE_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("no media files supplied")]
    NoMedia,
    #[error("{content_type} posts accept {min}..={max} files, got {actual}")]
    FileCount {
        content_type: ContentType,
        min: usize,
        max: usize,
        actual: usize,
    },
    #[error("unsupported {content_type} format: {path}")]
    UnsupportedFormat {
        content_type: ContentType,
        path: PathBuf,
    },
    #[error("media file not found: {0}")]
    MissingFile(PathBuf),
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("scheduled time {0} is not in the future")]
    ScheduleInPast(NaiveDateTime),
    #[error("invalid schedule {value:?}: expected YYYY-MM-DD HH:MM")]
    InvalidSchedule { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Video,
    Image,
}

impl ContentType {
    /// Lenient parse: anything other than "image" is treated as video.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_lowercase()) {
            Some(value) if value == "image" => ContentType::Image,
            _ => ContentType::Video,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Video => "video",
            ContentType::Image => "image",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "at")]
pub enum PublishTime {
    Immediate,
    Scheduled(NaiveDateTime),
}

impl PublishTime {
    pub fn parse(raw: Option<&str>) -> Result<Self, ContentError> {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            None => Ok(PublishTime::Immediate),
            Some(value) => NaiveDateTime::parse_from_str(value, SCHEDULE_FORMAT)
                .map(PublishTime::Scheduled)
                .map_err(|_| ContentError::InvalidSchedule {
                    value: value.to_string(),
                }),
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, PublishTime::Immediate)
    }

    pub fn scheduled_at(&self) -> Option<NaiveDateTime> {
        match self {
            PublishTime::Immediate => None,
            PublishTime::Scheduled(at) => Some(*at),
        }
    }
}

/// Extension and count rules a platform applies to one content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPolicy {
    pub content_type: ContentType,
    pub extensions: &'static [&'static str],
    pub min_files: usize,
    pub max_files: usize,
}

impl MediaPolicy {
    pub fn video() -> Self {
        Self {
            content_type: ContentType::Video,
            extensions: VIDEO_EXTENSIONS,
            min_files: 1,
            max_files: 1,
        }
    }

    pub fn images(max_files: usize) -> Self {
        Self {
            content_type: ContentType::Image,
            extensions: IMAGE_EXTENSIONS,
            min_files: 1,
            max_files,
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .map(|ext| self.extensions.iter().any(|allowed| *allowed == ext))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub title: String,
    pub body: Option<String>,
    pub tags: Vec<String>,
    pub media: Vec<PathBuf>,
    pub content_type: ContentType,
    pub publish_time: PublishTime,
}

impl ContentItem {
    pub fn video(title: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            body: None,
            tags: Vec::new(),
            media: vec![file.into()],
            content_type: ContentType::Video,
            publish_time: PublishTime::Immediate,
        }
    }

    pub fn images<I, P>(title: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            title: title.into(),
            body: None,
            tags: Vec::new(),
            media: files.into_iter().map(Into::into).collect(),
            content_type: ContentType::Image,
            publish_time: PublishTime::Immediate,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body = if body.trim().is_empty() {
            None
        } else {
            Some(body)
        };
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn scheduled(mut self, at: NaiveDateTime) -> Self {
        self.publish_time = PublishTime::Scheduled(at);
        self
    }

    /// Checks intake invariants. Runs before any browser is launched.
    pub fn validate(&self, policy: &MediaPolicy, now: NaiveDateTime) -> Result<(), ContentError> {
        if self.title.trim().is_empty() {
            return Err(ContentError::EmptyTitle);
        }
        if self.media.is_empty() {
            return Err(ContentError::NoMedia);
        }
        let count = self.media.len();
        if count < policy.min_files || count > policy.max_files {
            return Err(ContentError::FileCount {
                content_type: policy.content_type,
                min: policy.min_files,
                max: policy.max_files,
                actual: count,
            });
        }
        if let Some(path) = self.media.iter().find(|path| !policy.accepts(path)) {
            return Err(ContentError::UnsupportedFormat {
                content_type: policy.content_type,
                path: path.clone(),
            });
        }
        if let Some(path) = self.media.iter().find(|path| !path.exists()) {
            return Err(ContentError::MissingFile(path.clone()));
        }
        if let PublishTime::Scheduled(at) = self.publish_time {
            if at <= now {
                return Err(ContentError::ScheduleInPast(at));
            }
        }
        Ok(())
    }

    /// Body followed by `#tag` tokens on their own line.
    pub fn note_text(&self) -> String {
        compose_note_text(self.body.as_deref(), &self.tags)
    }

    pub fn truncated_title(&self, max_chars: usize) -> String {
        self.title.trim().chars().take(max_chars).collect()
    }
}

pub fn compose_note_text(body: Option<&str>, tags: &[String]) -> String {
    let body = body.map(str::trim).unwrap_or_default();
    let tags = tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .map(|tag| format!("#{tag}"))
        .collect::<Vec<_>>()
        .join(" ");
    match (body.is_empty(), tags.is_empty()) {
        (false, false) => format!("{body}\n{tags}"),
        (false, true) => body.to_string(),
        (true, _) => tags,
    }
}

/// Splits a comma separated tag list, dropping blanks and a leading `#`.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|tag| tag.trim().trim_start_matches('#').trim())
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn normalize_defaults_to_video() {
        assert_eq!(ContentType::normalize(None), ContentType::Video);
        assert_eq!(ContentType::normalize(Some("")), ContentType::Video);
        assert_eq!(ContentType::normalize(Some("IMAGE")), ContentType::Image);
        assert_eq!(ContentType::normalize(Some("gallery")), ContentType::Video);
    }

    #[test]
    fn note_text_joins_body_and_tags() {
        let text = compose_note_text(Some("正文第一行"), &["旅行".into(), "摄影".into()]);
        assert_eq!(text, "正文第一行\n#旅行 #摄影");
        assert_eq!(compose_note_text(None, &["a".into(), " ".into()]), "#a");
        assert_eq!(compose_note_text(Some("  body "), &[]), "body");
    }

    #[test]
    fn rejects_too_many_images() {
        let dir = tempdir().unwrap();
        let files = (0..10)
            .map(|i| touch(dir.path(), &format!("img_{i}.jpg")))
            .collect::<Vec<_>>();
        let item = ContentItem::images("title", files);
        let err = item.validate(&MediaPolicy::images(MAX_IMAGES), now()).unwrap_err();
        assert!(matches!(err, ContentError::FileCount { actual: 10, .. }));
    }

    #[test]
    fn rejects_video_in_image_post() {
        let dir = tempdir().unwrap();
        let item = ContentItem::images("title", [touch(dir.path(), "demo.mp4")]);
        let err = item.validate(&MediaPolicy::images(MAX_IMAGES), now()).unwrap_err();
        assert!(matches!(err, ContentError::UnsupportedFormat { .. }));
    }

    #[test]
    fn accepts_mixed_case_image_extensions() {
        let dir = tempdir().unwrap();
        let item = ContentItem::images(
            "title",
            [
                touch(dir.path(), "a.PNG"),
                touch(dir.path(), "b.jpeg"),
                touch(dir.path(), "c.webp"),
            ],
        );
        item.validate(&MediaPolicy::images(MAX_IMAGES), now()).unwrap();
    }

    #[test]
    fn rejects_schedule_in_the_past() {
        let dir = tempdir().unwrap();
        let item = ContentItem::video("title", touch(dir.path(), "clip.mp4"))
            .scheduled(now() - chrono::Duration::minutes(5));
        let err = item.validate(&MediaPolicy::video(), now()).unwrap_err();
        assert!(matches!(err, ContentError::ScheduleInPast(_)));
    }

    #[test]
    fn parse_schedule_and_tags() {
        assert_eq!(PublishTime::parse(None).unwrap(), PublishTime::Immediate);
        let scheduled = PublishTime::parse(Some("2026-02-03 18:30")).unwrap();
        assert_eq!(
            scheduled.scheduled_at().unwrap().format(SCHEDULE_FORMAT).to_string(),
            "2026-02-03 18:30"
        );
        assert!(PublishTime::parse(Some("tomorrow")).is_err());
        assert_eq!(parse_tags("美食, #探店,,"), vec!["美食", "探店"]);
    }
}
