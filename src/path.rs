use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ArchiveError, Result};

const ARCHIVE_PREFIX: &str = "data/archive/";
const DATA_PREFIX: &str = "data/";
const JSON_FORMAT: &str = "format=json";

/// One level of the archive hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Projects,
    Subjects,
    Experiments,
    Scans,
    Resources,
    Files,
    /// Scene bundles stored under an experiment's `Slicer` resource.
    Slicer,
}

impl Level {
    pub const SEARCHABLE: [Level; 3] = [Level::Projects, Level::Subjects, Level::Experiments];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Projects => "projects",
            Level::Subjects => "subjects",
            Level::Experiments => "experiments",
            Level::Scans => "scans",
            Level::Resources => "resources",
            Level::Files => "files",
            Level::Slicer => "slicer",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().trim_matches('/').to_ascii_lowercase().as_str() {
            "projects" => Ok(Level::Projects),
            "subjects" => Ok(Level::Subjects),
            "experiments" => Ok(Level::Experiments),
            "scans" => Ok(Level::Scans),
            "resources" => Ok(Level::Resources),
            "files" => Ok(Level::Files),
            "slicer" => Ok(Level::Slicer),
            other => Err(ArchiveError::Configuration(format!(
                "Invalid archive level: '{other}'"
            ))),
        }
    }
}

/// Predefined query-string fragments that narrow a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryFilter {
    Accessible,
    ImagesOnly,
}

impl QueryFilter {
    pub fn fragment(self) -> &'static str {
        match self {
            QueryFilter::Accessible => "accessible=true",
            QueryFilter::ImagesOnly => "xsiType=xnat:imageSessionData",
        }
    }
}

impl FromStr for QueryFilter {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accessible" => Ok(QueryFilter::Accessible),
            "imagesonly" | "images_only" => Ok(QueryFilter::ImagesOnly),
            other => Err(ArchiveError::Configuration(format!(
                "Unknown query filter: '{other}'"
            ))),
        }
    }
}

/// A cleaned hierarchical address such as `projects/P1/subjects/S1`.
///
/// Never contains `//` outside a scheme prefix and never ends with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderPath(String);

impl FolderPath {
    pub fn new(raw: &str) -> Self {
        Self(clean_uri(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix of this path that ends at `level`.
    pub fn truncate_at(&self, level: Level) -> Result<FolderPath> {
        uri_at(&self.0, level).map(FolderPath)
    }

    pub fn with_filters(&self, filters: &[QueryFilter]) -> FolderPath {
        FolderPath(apply_query_filters(&self.0, filters))
    }

    pub fn join(&self, segment: &str) -> FolderPath {
        FolderPath::new(&format!("{}/{}", self.0, segment))
    }

    /// True when the last path segment (ignoring any query) names `level`.
    pub fn ends_with_level(&self, level: Level) -> bool {
        basename(&self.0).eq_ignore_ascii_case(level.as_str())
    }

    pub fn basename(&self) -> &str {
        basename(&self.0)
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FolderPath {
    fn from(value: &str) -> Self {
        FolderPath::new(value)
    }
}

impl From<String> for FolderPath {
    fn from(value: String) -> Self {
        FolderPath::new(&value)
    }
}

impl AsRef<str> for FolderPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collapses repeated separators (outside the scheme) and drops the
/// trailing separator. Relative inputs gain a leading `/`.
pub fn clean_uri(uri: &str) -> String {
    let uri = uri.trim();
    let mut cleaned = if uri.starts_with('/') || uri.starts_with("http") {
        collapse_separators(uri)
    } else {
        collapse_separators(&format!("/{uri}"))
    };
    while cleaned.ends_with('/') {
        cleaned.pop();
    }
    cleaned
}

/// Resolves `url` against the archive host. Paths outside `data/` are
/// placed under `data/archive/`.
pub fn make_archive_url(host: &str, url: &str) -> String {
    let url = url.trim();
    let relative = url.strip_prefix('/').unwrap_or(url);

    let joined = if relative.starts_with(host) || relative.contains("://") {
        relative.to_string()
    } else {
        let base = if host.ends_with('/') {
            host.to_string()
        } else {
            format!("{host}/")
        };
        if relative.starts_with(DATA_PREFIX) {
            format!("{base}{relative}")
        } else {
            format!("{base}{ARCHIVE_PREFIX}{relative}")
        }
    };

    collapse_separators(&joined)
}

/// Appends `format=json` unless the uri already requests it.
pub fn ensure_json_format(uri: &str) -> String {
    if uri.contains(JSON_FORMAT) {
        return uri.to_string();
    }
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{separator}{JSON_FORMAT}")
}

pub fn apply_query_filters(uri: &str, filters: &[QueryFilter]) -> String {
    let mut out = uri.to_string();
    for filter in filters {
        out.push(if out.contains('?') { '&' } else { '?' });
        out.push_str(filter.fragment());
    }
    out
}

/// Splices `uri` so that it ends at the first `/<level>` segment.
pub fn uri_at(uri: &str, level: Level) -> Result<String> {
    let needle = format!("/{}", level.as_str());
    let mut search_from = 0usize;
    while let Some(found) = uri[search_from..].find(&needle) {
        let end = search_from + found + needle.len();
        let boundary = uri[end..].chars().next();
        if matches!(boundary, None | Some('/') | Some('?')) {
            return Ok(uri[..end].to_string());
        }
        search_from = end;
    }
    Err(ArchiveError::Configuration(format!(
        "Invalid get level '{level}' for uri: {uri}"
    )))
}

/// Rewrites anything below `/scans/<id>/` to that scan's `files` listing.
pub fn scan_files_uri(uri: &str) -> Option<String> {
    let (head, tail) = uri.split_once("/scans/")?;
    let scan_id = tail.split(['/', '?']).next().filter(|id| !id.is_empty())?;
    Some(format!("{head}/scans/{scan_id}/files"))
}

/// Source and destination for downloading a folder as one zip archive.
pub fn zip_download_paths(src: &str, dst_base: &Path) -> Result<(String, PathBuf)> {
    let Some((_, below_projects)) = src.split_once("projects") else {
        return Err(ArchiveError::Configuration(format!(
            "Zip download source must lie under 'projects': {src}"
        )));
    };
    let folder = below_projects
        .split("/files")
        .next()
        .unwrap_or_default()
        .trim_matches('/');

    let mut dst = dst_base.join("projects");
    for segment in folder.split('/').filter(|segment| !segment.is_empty()) {
        dst.push(segment);
    }
    dst.push("files.zip");
    Ok((format!("{src}?format=zip"), dst))
}

/// Last path segment of `uri`, ignoring any query string.
pub fn basename(uri: &str) -> &str {
    let path = strip_query(uri).trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}

pub(crate) fn strip_query(uri: &str) -> &str {
    uri.split_once('?').map_or(uri, |(path, _)| path)
}

fn collapse_separators(uri: &str) -> String {
    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, uri),
    };

    let mut out = String::with_capacity(uri.len());
    if let Some(scheme) = scheme {
        out.push_str(scheme);
        out.push_str("://");
    }
    let mut previous_slash = false;
    for ch in rest.chars() {
        if ch == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(ch);
    }
    out
}
