//! Output file naming: template rendering, sanitizing and collision handling

use crate::config::FileCollisionAction;
use crate::error::{Error, Result};
use crate::types::{Quality, TrackMetadata};
use regex::Regex;
use std::path::{Path, PathBuf};

/// Maximum number of rename attempts when resolving file collisions
pub(crate) const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Longest path component produced by [`sanitize_component`], in bytes
const MAX_COMPONENT_BYTES: usize = 200;

/// Placeholder used when a component renders to nothing
const EMPTY_COMPONENT: &str = "untitled";

/// Renders naming templates such as `"{artist}/{album}/{tracknumber} {title}"`
///
/// Recognized placeholders are `{title}`, `{artist}`, `{album}`,
/// `{tracknumber}` (two digits), `{provider}`, `{id}` and `{quality}`, plus any
/// key of [`TrackMetadata::extra`]. Unknown placeholders and missing optional
/// fields render as empty text. `/` in the template separates directories;
/// `/` inside a value never does.
#[derive(Clone, Debug)]
pub struct FileNamer {
    placeholder: Regex,
    reserved: Regex,
}

impl FileNamer {
    /// Compile the placeholder and sanitizing patterns
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Other(format!("invalid naming pattern '{pattern}': {e}")))
        };
        Ok(Self {
            placeholder: compile(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")?,
            reserved: compile(r#"[<>:"/\\|?*\x00-\x1f]"#)?,
        })
    }

    /// Relative output path for `metadata`, with the extension of `quality`
    ///
    /// ```
    /// use media_dl::naming::FileNamer;
    /// use media_dl::types::{Quality, TrackMetadata};
    ///
    /// let namer = FileNamer::new().unwrap();
    /// let meta = TrackMetadata {
    ///     title: "So What".into(),
    ///     artist: "Miles Davis".into(),
    ///     ..Default::default()
    /// };
    /// let path = namer.render("{title} - {artist}", &meta, Quality::Lossless);
    /// assert_eq!(path.to_str(), Some("So What - Miles Davis.flac"));
    /// ```
    pub fn render(&self, template: &str, metadata: &TrackMetadata, quality: Quality) -> PathBuf {
        let parts: Vec<String> = template
            .split('/')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                let rendered = self.placeholder.replace_all(part, |caps: &regex::Captures| {
                    lookup(&caps[1], metadata, quality)
                });
                self.sanitize(&rendered)
            })
            .collect();

        let mut path = PathBuf::new();
        match parts.split_last() {
            Some((file, dirs)) => {
                for dir in dirs {
                    path.push(dir);
                }
                path.push(format!("{file}.{}", quality.extension()));
            }
            None => path.push(format!("{EMPTY_COMPONENT}.{}", quality.extension())),
        }
        path
    }

    /// Make one path component safe on every common filesystem
    pub fn sanitize(&self, raw: &str) -> String {
        sanitize_component(&self.reserved.replace_all(raw, "_"))
    }
}

fn lookup(key: &str, metadata: &TrackMetadata, quality: Quality) -> String {
    match key {
        "title" => metadata.title.clone(),
        "artist" => metadata.artist.clone(),
        "album" => metadata.album.clone().unwrap_or_default(),
        "tracknumber" => metadata
            .track_number
            .map(|n| format!("{n:02}"))
            .unwrap_or_default(),
        "provider" => metadata.provider.clone(),
        "id" => metadata.item_id.clone(),
        "quality" => quality.to_string(),
        other => metadata.extra.get(other).cloned().unwrap_or_default(),
    }
}

/// Collapse whitespace, trim, bound the length and reject `.`/`..`
///
/// Reserved characters must already have been replaced.
fn sanitize_component(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut cleaned = collapsed.trim_end_matches(['.', ' ']).to_string();

    if cleaned.len() > MAX_COMPONENT_BYTES {
        let mut cut = MAX_COMPONENT_BYTES;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned = cleaned.trim_end_matches(['.', ' ']).to_string();
    }

    if cleaned.is_empty() {
        EMPTY_COMPONENT.to_string()
    } else if cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Get a unique path for a file, handling collisions according to the specified action
///
/// For `Rename`, `/music/song.flac` becomes `/music/song (1).flac`, then
/// `/music/song (2).flac` and so on. `Skip` fails when the path exists.
/// `Overwrite` returns the path unchanged.
pub fn get_unique_path(path: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    match action {
        FileCollisionAction::Overwrite => Ok(path.to_path_buf()),
        FileCollisionAction::Skip => {
            if path.exists() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("'{}' already exists", path.display()),
                )));
            }
            Ok(path.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }

            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::Other(format!("cannot extract file stem from '{}'", path.display())))?;
            let extension = path.extension().and_then(|e| e.to_str());
            let parent = path.parent().unwrap_or_else(|| Path::new(""));

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let candidate = match extension {
                    Some(ext) => parent.join(format!("{stem} ({i}).{ext}")),
                    None => parent.join(format!("{stem} ({i})")),
                };
                if !candidate.exists() {
                    return Ok(candidate);
                }
            }

            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!(
                    "no free name for '{}' after {MAX_RENAME_ATTEMPTS} attempts",
                    path.display()
                ),
            )))
        }
    }
}
