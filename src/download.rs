use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

use crate::client::RemoteClient;
use crate::error::ArchiveError;
use crate::events::Event;
use crate::queue::{Transfer, TransferExecutor, TransferState};

/// Streams one remote file to disk in fixed-size chunks.
///
/// Between chunks the downloader checks whether its transfer is still
/// queued; a transfer removed from the queue stops before the next write
/// and its partial file is deleted.
pub struct ChunkedDownloader<'a> {
    client: &'a RemoteClient,
    chunk_size: usize,
}

impl<'a> ChunkedDownloader<'a> {
    pub fn new(client: &'a RemoteClient) -> Self {
        Self {
            client,
            chunk_size: client.config().chunk_size,
        }
    }

    pub fn download(&self, transfer: &Transfer) -> TransferState {
        let source = transfer.source.as_str();
        let queue = self.client.queue();
        let bus = self.client.events();

        // listing sizes describe the scan files, not a zip bundle built from them
        let known_size = if source.contains("format=zip") {
            None
        } else {
            Some(self.client.file_size(source).bytes).filter(|bytes| *bytes > 0)
        };

        let mut file = match open_destination(&transfer.destination) {
            Ok(file) => file,
            Err(err) => return self.fail(transfer, None, err.to_string()),
        };
        let mut response = match self.client.open_stream(source) {
            Ok(response) => response,
            Err(err) => return self.fail(transfer, Some(file), err.to_string()),
        };
        if !response.is_success() {
            let err = if response.is_auth_failure() {
                ArchiveError::Authentication {
                    url: self.client.archive_url(source),
                    status: response.status,
                }
            } else {
                ArchiveError::communication(
                    &self.client.archive_url(source),
                    format!("HTTP {}", response.status),
                )
            };
            return self.fail(transfer, Some(file), err.to_string());
        }

        let mut total = known_size.or(response.content_length);
        queue.record_progress(transfer.id(), total, 0);
        log::info!(
            "downloading {source} -> {} ({})",
            transfer.destination.display(),
            total.map_or_else(|| "unknown size".to_string(), |bytes| format!("{bytes} bytes"))
        );
        bus.emit(Event::DownloadStarted {
            source: source.to_string(),
            total_bytes: total.map_or(-1, |bytes| bytes as i64),
        });

        let mut buffer = vec![0u8; self.chunk_size];
        let mut transferred = 0u64;
        loop {
            let read = match read_chunk(response.body_mut(), &mut buffer) {
                Ok(read) => read,
                Err(err) => {
                    let err = ArchiveError::communication(&self.client.archive_url(source), err);
                    return self.fail(transfer, Some(file), err.to_string());
                }
            };

            if !queue.contains(transfer.id()) {
                drop(file);
                remove_partial(&transfer.destination);
                if !queue.take_cancel_notice(transfer.id()) {
                    bus.emit(Event::DownloadCancelled {
                        source: source.to_string(),
                    });
                }
                log::info!("stopped {source} after {transferred} bytes");
                return TransferState::Cancelled;
            }
            if read == 0 {
                break;
            }

            if let Err(err) = file.write_all(&buffer[..read]) {
                let err = ArchiveError::local_io(&transfer.destination, err);
                return self.fail(transfer, Some(file), err.to_string());
            }
            transferred += read as u64;
            if let Some(expected) = total.filter(|expected| transferred > *expected) {
                log::warn!("{source} is larger than the expected {expected} bytes");
                total = None;
            }
            queue.record_progress(transfer.id(), total, transferred);
            bus.emit(Event::Downloading {
                source: source.to_string(),
                bytes: transferred,
            });
        }

        if let Err(err) = file.sync_all() {
            let err = ArchiveError::local_io(&transfer.destination, err);
            return self.fail(transfer, Some(file), err.to_string());
        }
        drop(file);

        queue.finish(transfer.id(), TransferState::Completed);
        log::info!("finished {source} ({transferred} bytes)");
        bus.emit(Event::DownloadFinished {
            source: source.to_string(),
        });
        TransferState::Completed
    }

    fn fail(&self, transfer: &Transfer, file: Option<File>, message: String) -> TransferState {
        drop(file);
        remove_partial(&transfer.destination);

        let queue = self.client.queue();
        if queue.finish(transfer.id(), TransferState::Failed).is_none()
            && queue.take_cancel_notice(transfer.id())
        {
            return TransferState::Cancelled;
        }

        log::error!("download of {} failed: {message}", transfer.source);
        self.client.events().emit(Event::DownloadFailed {
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            message,
        });
        TransferState::Failed
    }
}

impl TransferExecutor for ChunkedDownloader<'_> {
    fn execute(&self, transfer: &Transfer) -> TransferState {
        self.download(transfer)
    }
}

fn open_destination(path: &Path) -> Result<File, ArchiveError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| ArchiveError::local_io(parent, err))?;
    }
    File::create(path).map_err(|err| ArchiveError::local_io(path, err))
}

/// Fills `buffer` unless the stream ends first; returns the bytes read.
fn read_chunk(reader: &mut (dyn Read + Send), buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("removed partial file {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => log::warn!("could not remove partial file {}: {err}", path.display()),
    }
}
