use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use archive_transfer::inspect::inspect_completed;
use archive_transfer::path::{basename, zip_download_paths};
use archive_transfer::{
    metadata, parse_credentials, ArchiveConfig, Event, EventKind, FolderPath, Level, QueryFilter,
    RemoteClient, TransferState,
};

#[derive(Debug, Parser)]
#[command(name = "archive-transfer", version, about)]
struct Cli {
    #[command(flatten)]
    connection: Connection,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Connection {
    /// Archive base URL, e.g. https://central.example.org
    #[arg(long, env = "ARCHIVE_HOST")]
    host: String,

    #[arg(long, env = "ARCHIVE_USER")]
    user: Option<String>,

    #[arg(long, env = "ARCHIVE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Percent-encoded `username:password`, instead of --user/--password
    #[arg(long, conflicts_with_all = ["user", "password"])]
    auth: Option<String>,

    /// Overall per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long, default_value_t = archive_transfer::config::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List folders and print the requested metadata columns
    List {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Metadata column to keep; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Use the short column set for the listed level
        #[arg(long, conflicts_with = "tags")]
        lite: bool,
        /// Use every known column for the listed level
        #[arg(long, conflicts_with_all = ["tags", "lite"])]
        full: bool,
        #[arg(long)]
        accessible: bool,
        #[arg(long)]
        images_only: bool,
    },
    /// Print the resource names below a folder
    Resources { folder: String },
    /// Wildcard search across projects, subjects and experiments
    Search { query: String },
    /// Print the size of a remote file or scan
    Size { uri: String },
    /// Check whether a remote file exists
    Exists { uri: String },
    /// Queue downloads and run them serially
    Download {
        #[arg(required = true)]
        sources: Vec<String>,
        /// Local directory receiving the files
        #[arg(long, default_value = ".")]
        dest: PathBuf,
        /// Fetch each source folder as one zip bundle
        #[arg(long)]
        zip: bool,
        /// Print DICOM header fields of completed files
        #[arg(long)]
        inspect: bool,
    },
    /// Create a folder on the archive
    PutFolder { path: String },
    /// Upload a local file
    PutFile {
        local: PathBuf,
        remote: String,
        /// Delete any existing remote file first
        #[arg(long)]
        replace: bool,
    },
    /// Delete a remote file or folder
    Delete { path: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = build_config(&cli.connection)?;
    let client = RemoteClient::connect(config).context("Could not set up archive client")?;

    match cli.command {
        Command::List {
            paths,
            tags,
            lite,
            full,
            accessible,
            images_only,
        } => {
            let mut filters = Vec::new();
            if accessible {
                filters.push(QueryFilter::Accessible);
            }
            if images_only {
                filters.push(QueryFilter::ImagesOnly);
            }
            let columns: Vec<&str> = if lite {
                level_columns(&paths, metadata::lite_tags)?
            } else if full {
                level_columns(&paths, metadata::tags)?
            } else {
                tags.iter().map(String::as_str).collect()
            };

            let Some(listing) = client.list_folder(&paths, &columns, &filters) else {
                bail!("Listing failed; see log for the archive response");
            };
            for (tag, values) in listing {
                println!("{tag}: {}", values.join(", "));
            }
        }
        Command::Resources { folder } => {
            for name in client.resource_names(&FolderPath::new(&folder)) {
                println!("{name}");
            }
        }
        Command::Search { query } => {
            for (level, records) in client.search(&query) {
                for record in records {
                    println!("{level}\t{}", record.label().unwrap_or("?"));
                }
            }
        }
        Command::Size { uri } => {
            let size = client.file_size(&uri);
            println!("{} bytes ({} MB)", size.bytes, size.megabytes);
        }
        Command::Exists { uri } => {
            let exists = client.exists(&uri)?;
            println!("{exists}");
        }
        Command::Download {
            sources,
            dest,
            zip,
            inspect,
        } => download(&client, &sources, &dest, zip, inspect)?,
        Command::PutFolder { path } => report_reply(client.put_folder(&path))?,
        Command::PutFile {
            local,
            remote,
            replace,
        } => {
            if !local.is_file() {
                bail!("{} is not a file", local.display());
            }
            report_reply(client.put_file(&local, &remote, replace))?
        }
        Command::Delete { path } => report_reply(client.delete(&path))?,
    }

    Ok(())
}

fn build_config(connection: &Connection) -> Result<ArchiveConfig> {
    let (user, password) = match (&connection.auth, &connection.user, &connection.password) {
        (Some(auth), _, _) => parse_credentials(auth)?,
        (None, Some(user), Some(password)) => (user.clone(), password.clone()),
        _ => bail!("Provide --auth or both --user and --password"),
    };

    let config = ArchiveConfig::new(&connection.host, &user, &password)?
        .with_chunk_size(connection.chunk_size)
        .with_request_timeout(connection.timeout.map(Duration::from_secs));
    Ok(config)
}

/// Column set for the level named by the last listed path.
fn level_columns(
    paths: &[String],
    table: fn(Level) -> &'static [&'static str],
) -> Result<Vec<&'static str>> {
    let Some(last) = paths.last() else {
        return Ok(Vec::new());
    };
    let level: Level = FolderPath::new(last)
        .basename()
        .parse()
        .with_context(|| format!("--lite and --full need a path ending in a level name: {last}"))?;
    Ok(table(level).to_vec())
}

fn download(
    client: &RemoteClient,
    sources: &[String],
    dest: &Path,
    zip: bool,
    inspect: bool,
) -> Result<()> {
    for source in sources {
        let (source, destination) = if zip {
            zip_download_paths(source, dest)?
        } else {
            (source.clone(), dest.join(basename(source)))
        };
        client.enqueue(&source, destination);
    }
    log_transfer_events(client)?;

    let finished = client.start_downloads();
    let failed = finished
        .iter()
        .filter(|transfer| transfer.state == TransferState::Failed)
        .count();

    for transfer in &finished {
        println!(
            "{:?}\t{}\t{}",
            transfer.state,
            transfer.bytes_transferred,
            transfer.destination.display()
        );
    }

    if inspect {
        for summary in inspect_completed(&finished) {
            println!("{}", summary.path.display());
            for (name, value) in &summary.fields {
                println!("  {name}: {value}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} transfer(s) failed", finished.len());
    }
    Ok(())
}

fn log_transfer_events(client: &RemoteClient) -> Result<()> {
    let events = client.events();
    events.subscribe(EventKind::Downloading, |event| {
        if let Event::Downloading { source, bytes } = event {
            log::debug!("{source}: {bytes} bytes");
        }
    })?;
    events.subscribe(EventKind::DownloadCancelled, |event| {
        log::warn!("cancelled {}", event.source().unwrap_or_default());
    })?;
    events.subscribe(EventKind::JsonError, |event| {
        if let Event::JsonError { host, identity, .. } = event {
            log::error!("archive {host} rejected a request for {identity}");
        }
    })?;
    Ok(())
}

fn report_reply(reply: Option<archive_transfer::Reply>) -> Result<()> {
    let Some(reply) = reply else {
        bail!("Request failed; see log for details");
    };
    println!("HTTP {}", reply.status);
    if !reply.body.trim().is_empty() {
        println!("{}", reply.body);
    }
    if !reply.is_success() {
        bail!("Archive answered HTTP {}", reply.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_columns_follow_last_path() {
        let paths = vec!["projects/P1".to_string(), "projects/P1/subjects".to_string()];

        assert_eq!(
            level_columns(&paths, metadata::tags).unwrap(),
            metadata::tags(Level::Subjects)
        );
        assert_eq!(
            level_columns(&paths, metadata::lite_tags).unwrap(),
            vec!["label"]
        );
        assert!(level_columns(&["projects/P1".to_string()], metadata::tags).is_err());
    }

    #[test]
    fn full_conflicts_with_explicit_tags() {
        let parsed = Cli::try_parse_from([
            "archive-transfer",
            "--host",
            "https://archive.test",
            "list",
            "projects",
            "--full",
            "--tag",
            "ID",
        ]);
        assert!(parsed.is_err());
    }
}
