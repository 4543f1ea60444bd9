use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ArchiveConfig;
use crate::download::ChunkedDownloader;
use crate::error::{ArchiveError, Result};
use crate::events::{Event, EventBus};
use crate::metadata::{self, LABEL_TAGS};
use crate::path::{
    basename, ensure_json_format, make_archive_url, scan_files_uri, strip_query, uri_at,
    FolderPath, Level, QueryFilter,
};
use crate::queue::{Transfer, TransferQueue};
use crate::transport::{HttpTransport, Method, Request, Response, Transport};

/// One entry of a folder listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRecord {
    attributes: BTreeMap<String, String>,
}

impl RemoteRecord {
    pub fn new(attributes: BTreeMap<String, String>) -> Self {
        Self { attributes }
    }

    fn from_json(object: Map<String, Value>) -> Self {
        let attributes = object
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(text) => Some((key, text)),
                other => Some((key, other.to_string())),
            })
            .collect();
        Self { attributes }
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.attributes.get(tag).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// First label-like field present on the record.
    pub fn label(&self) -> Option<&str> {
        LABEL_TAGS.iter().find_map(|tag| self.get(tag))
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.get("Size")?.trim().parse().ok()
    }
}

/// Listing results keyed by metadata tag, one value per matching record.
pub type FolderListing = BTreeMap<String, Vec<String>>;

pub type SearchResults = BTreeMap<Level, Vec<RemoteRecord>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileSize {
    pub bytes: u64,
    pub megabytes: f64,
}

/// Status and body of a PUT/POST/DELETE round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "ResultSet")]
    result_set: ResultSet,
}

#[derive(Deserialize)]
struct ResultSet {
    #[serde(rename = "Result", default)]
    result: Vec<Map<String, Value>>,
}

#[derive(Default)]
struct Caches {
    projects: Option<Vec<RemoteRecord>>,
    files: HashMap<String, RemoteRecord>,
}

/// Authenticated access to one archive host.
///
/// Network failures never surface as `Err`: listing calls return `None`
/// (the "no result" sentinel) and a [`Event::JsonError`] is published.
pub struct RemoteClient {
    config: ArchiveConfig,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    queue: TransferQueue,
    caches: Mutex<Caches>,
}

impl RemoteClient {
    pub fn connect(config: ArchiveConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ArchiveConfig, transport: Arc<dyn Transport>) -> Self {
        let bus = Arc::new(EventBus::with_all_kinds());
        let queue = TransferQueue::new(Arc::clone(&bus));
        Self {
            config,
            transport,
            bus,
            queue,
            caches: Mutex::new(Caches::default()),
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    /// Full URL for an archive path on this host.
    pub fn archive_url(&self, uri: &str) -> String {
        make_archive_url(&self.config.host, uri)
    }

    /// Concatenated records of every listed folder, or `None` when any
    /// listing failed or was rejected.
    pub fn list_records<P: AsRef<str>>(
        &self,
        paths: &[P],
        filters: &[QueryFilter],
    ) -> Option<Vec<RemoteRecord>> {
        let mut contents = Vec::new();

        for path in paths {
            let folder = FolderPath::new(path.as_ref());
            let records = self.fetch_result_set(folder.with_filters(filters).as_str())?;

            if folder.ends_with_level(Level::Projects) {
                self.lock_caches().projects = Some(records.clone());
            } else if folder.ends_with_level(Level::Files) {
                self.index_files(&records);
            }
            contents.extend(records);
        }

        Some(contents)
    }

    /// Lists folders and pivots the records into columns.
    ///
    /// With an empty `metadata` filter every attribute becomes a column.
    pub fn list_folder<P: AsRef<str>>(
        &self,
        paths: &[P],
        metadata: &[&str],
        filters: &[QueryFilter],
    ) -> Option<FolderListing> {
        let records = self.list_records(paths, filters)?;
        Some(pivot_records(&records, metadata))
    }

    /// Labels of the entries in `folder/resources`.
    pub fn resource_names(&self, folder: &FolderPath) -> Vec<String> {
        let resources = folder.join(Level::Resources.as_str());
        let Some(records) = self.fetch_result_set(resources.as_str()) else {
            return Vec::new();
        };

        records
            .iter()
            .filter_map(|record| record.get("label").or_else(|| record.get("Name")))
            .map(str::to_string)
            .collect()
    }

    pub fn file_size(&self, uri: &str) -> FileSize {
        let name = basename(uri);
        if let Some(bytes) = self.cached_size(name) {
            return self.file_size_of(bytes);
        }

        if !uri.contains("/scans") {
            return self.file_size_of(0);
        }
        let Some(listing) = scan_files_uri(uri) else {
            return self.file_size_of(0);
        };
        let Some(records) = self.list_records(&[listing], &[]) else {
            return self.file_size_of(0);
        };

        if let Some(bytes) = self.cached_size(name) {
            return self.file_size_of(bytes);
        }
        let total = records.iter().filter_map(RemoteRecord::size_bytes).sum();
        self.file_size_of(total)
    }

    pub fn exists(&self, uri: &str) -> Result<bool> {
        if self.lock_caches().files.contains_key(basename(uri)) {
            return Ok(true);
        }

        let url = self.archive_url(uri);
        let parent = uri_at(strip_query(&url), Level::Files)?;
        let name = basename(&url);
        let found = self.list_records(&[parent], &[]).is_some_and(|records| {
            records
                .iter()
                .any(|record| record.get("Name").is_some_and(|entry| entry.contains(name)))
        });
        Ok(found)
    }

    /// Wildcard search over the searchable columns of projects, subjects
    /// and experiments. Experiments are limited to MR and PET sessions.
    pub fn search(&self, query: &str) -> SearchResults {
        let pattern = format!("*{query}*");
        let mut results = SearchResults::new();

        for level in Level::SEARCHABLE {
            let sessions: Vec<Option<&str>> = if level == Level::Experiments {
                metadata::SEARCH_SESSION_TYPES.into_iter().map(Some).collect()
            } else {
                vec![None]
            };

            let mut found = Vec::new();
            for tag in metadata::search_tags(level) {
                for session in &sessions {
                    match self.search_url(level, tag, &pattern, *session) {
                        Ok(url) => found.extend(self.fetch_result_set(&url).unwrap_or_default()),
                        Err(err) => log::error!("{err}"),
                    }
                }
            }
            results.insert(level, found);
        }

        results
    }

    pub fn put_folder(&self, path: &str) -> Option<Reply> {
        let relative = path.trim().trim_start_matches('/');
        let target = if relative.starts_with("data/") || relative.contains("://") {
            relative.to_string()
        } else {
            format!("data/{relative}")
        };
        self.send(Request::new(Method::Put, self.archive_url(&target)))
    }

    pub fn put_file(&self, local: &Path, remote: &str, delete_existing: bool) -> Option<Reply> {
        if delete_existing {
            self.delete(remote);
        }
        self.send(Request::new(Method::Put, self.archive_url(remote)).with_upload(local))
    }

    pub fn delete(&self, path: &str) -> Option<Reply> {
        self.send(Request::new(Method::Delete, self.archive_url(path)))
    }

    /// Queues a download; see [`TransferQueue::enqueue`].
    pub fn enqueue(&self, source: &str, destination: impl AsRef<Path>) -> u64 {
        self.queue.enqueue(source, destination.as_ref())
    }

    /// Drains the download queue serially and returns the terminal records.
    pub fn start_downloads(&self) -> Vec<Transfer> {
        let downloader = ChunkedDownloader::new(self);
        self.queue.start(&downloader)
    }

    /// The most recent root project listing.
    pub fn project_cache(&self) -> Option<Vec<RemoteRecord>> {
        self.lock_caches().projects.clone()
    }

    pub fn reset_caches(&self) {
        *self.lock_caches() = Caches::default();
    }

    pub(crate) fn open_stream(&self, source: &str) -> Result<Response> {
        self.transport.execute(&Request::get(self.archive_url(source)))
    }

    fn fetch_result_set(&self, uri: &str) -> Option<Vec<RemoteRecord>> {
        let url = self.archive_url(&ensure_json_format(uri));
        let response = match self.transport.execute(&Request::get(&url)) {
            Ok(response) => response,
            Err(err) => {
                self.report_error(&err, err.to_string());
                return None;
            }
        };

        if response.is_auth_failure() {
            let status = response.status;
            let body = response.text().unwrap_or_default();
            self.report_error(&ArchiveError::Authentication { url, status }, body);
            return None;
        }

        let status = response.status;
        let text = match response.text() {
            Ok(text) => text,
            Err(err) => {
                self.report_error(&ArchiveError::communication(&url, &err), err.to_string());
                return None;
            }
        };

        if !(200..300).contains(&status) {
            let err = ArchiveError::communication(&url, format!("HTTP {status}"));
            self.report_error(&err, text);
            return None;
        }
        if text.trim_start().starts_with("<?xml") {
            log::warn!("{url} answered with XML instead of JSON; treating listing as empty");
            return Some(Vec::new());
        }

        match parse_result_set(&text) {
            Ok(records) => Some(records),
            Err(err) => {
                let err = ArchiveError::communication(&url, format!("invalid listing JSON: {err}"));
                self.report_error(&err, text);
                None
            }
        }
    }

    /// Listing URL for one search column, with every value form-encoded.
    fn search_url(
        &self,
        level: Level,
        tag: &str,
        pattern: &str,
        session: Option<&str>,
    ) -> Result<String> {
        let base = self.archive_url(level.as_str());
        let mut url = Url::parse(&base).map_err(|err| {
            ArchiveError::Configuration(format!("Invalid search URL {base}: {err}"))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair(tag, pattern);
            if let Some(session) = session {
                pairs.append_pair("xsiType", session);
            }
            pairs.append_pair("format", "json");
        }
        Ok(url.into())
    }

    fn send(&self, request: Request) -> Option<Reply> {
        let response = match self.transport.execute(&request) {
            Ok(response) => response,
            Err(err) => {
                self.report_error(&err, err.to_string());
                return None;
            }
        };

        let status = response.status;
        match response.text() {
            Ok(body) => {
                if !(200..300).contains(&status) {
                    log::warn!("{} {} returned HTTP {status}", request.method, request.url);
                }
                Some(Reply { status, body })
            }
            Err(err) => {
                let err = ArchiveError::communication(&request.url, err);
                self.report_error(&err, err.to_string());
                None
            }
        }
    }

    fn report_error(&self, err: &ArchiveError, response: String) {
        log::error!("{err}");
        self.bus.emit(Event::JsonError {
            host: self.config.host.clone(),
            identity: self.config.username.clone(),
            response,
        });
    }

    fn index_files(&self, records: &[RemoteRecord]) {
        let mut caches = self.lock_caches();
        for record in records {
            let name = record
                .get("Name")
                .or_else(|| record.get("URI").map(basename));
            if let Some(name) = name {
                caches.files.insert(name.to_string(), record.clone());
            }
        }
    }

    fn cached_size(&self, name: &str) -> Option<u64> {
        self.lock_caches()
            .files
            .get(name)
            .map(|record| record.size_bytes().unwrap_or(0))
    }

    fn file_size_of(&self, bytes: u64) -> FileSize {
        FileSize {
            bytes,
            megabytes: metadata::bytes_to_mb(bytes, self.config.mb_decimal_places),
        }
    }

    fn lock_caches(&self) -> MutexGuard<'_, Caches> {
        self.caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_result_set(text: &str) -> serde_json::Result<Vec<RemoteRecord>> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(envelope
        .result_set
        .result
        .into_iter()
        .map(RemoteRecord::from_json)
        .collect())
}

fn pivot_records(records: &[RemoteRecord], metadata: &[&str]) -> FolderListing {
    let mut listing = FolderListing::new();
    for record in records {
        if metadata.is_empty() {
            for (tag, value) in record.attributes() {
                listing.entry(tag.clone()).or_default().push(value.clone());
            }
            continue;
        }
        for tag in metadata {
            if let Some(value) = record.get(tag) {
                listing.entry(tag.to_string()).or_default().push(value.to_string());
            }
        }
    }
    listing
}
