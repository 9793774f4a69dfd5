//! # Progress Store
//!
//! Persists a subscription's progress under `<data_dir>/subscribe/<topic>`,
//! one text file per topic:
//!
//! ```text
//! <sql text>
//! <uid>:<key>
//! <uid>:<key>
//! ```
//!
//! The first line gates the file: progress recorded for a different SQL text
//! is never applied. Entry lines are read up to the first malformed one.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{trace, warn};

use crate::error::{Result, SubscribeError};
use crate::progress::set::{ProgressEntry, ProgressSet};

/// Name of the directory holding progress files, below the data directory.
pub const SUBSCRIBE_DIR: &str = "subscribe";

/// Result of loading a topic's progress file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The file matched the SQL text; entries are sorted by uid.
    Loaded(ProgressSet),
    /// No progress file exists for the topic.
    Missing,
    /// The file was recorded for a different SQL text.
    Mismatch,
    /// The file has no SQL line.
    Corrupt,
}

/// Raw content of a progress file, without the SQL gate applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressFile {
    /// SQL text recorded on the first line.
    pub sql: String,
    /// Entries read before the end of file or the first malformed line.
    pub progress: ProgressSet,
    /// Whether reading stopped at a malformed line.
    pub truncated: bool,
}

/// File-backed store of subscription progress.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    /// Creates a store rooted at `<data_dir>/subscribe`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join(SUBSCRIBE_DIR),
        }
    }

    /// Directory holding the progress files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the progress file for `topic`.
    pub fn path_for(&self, topic: &str) -> PathBuf {
        self.dir.join(topic)
    }

    fn ensure_dir(&self) -> Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o777);
        }
        builder
            .create(&self.dir)
            .map_err(|e| SubscribeError::io(&self.dir, e))
    }

    /// Truncates and rewrites the progress file for `topic`.
    pub fn save(&self, topic: &str, sql: &str, progress: &ProgressSet) -> Result<()> {
        self.ensure_dir()?;

        let path = self.path_for(topic);
        let write = || -> io::Result<()> {
            let mut out = BufWriter::new(File::create(&path)?);
            writeln!(out, "{}", sql)?;
            for entry in progress {
                writeln!(out, "{}:{}", entry.uid, entry.key)?;
            }
            out.flush()
        };
        write().map_err(|e| SubscribeError::io(&path, e))?;

        trace!(topic, tables = progress.len(), "subscription progress saved");
        Ok(())
    }

    /// Reads the progress file for `topic` without checking its SQL text.
    ///
    /// Returns `Ok(None)` when the file does not exist, and a
    /// [`ProgressFile`] with an empty `sql` when the file is empty or its
    /// first line is not valid text.
    pub fn read(&self, topic: &str) -> Result<Option<ProgressFile>> {
        let path = self.path_for(topic);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SubscribeError::io(&path, e)),
        };
        let mut reader = BufReader::new(file);

        let mut first = String::new();
        match reader.read_line(&mut first) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => first.clear(),
            Err(e) => return Err(SubscribeError::io(&path, e)),
        }
        if let Some(end) = first.find(['\r', '\n']) {
            first.truncate(end);
        }

        let mut entries = Vec::new();
        let mut truncated = false;
        for line in reader.lines() {
            let parsed = line.ok().and_then(|l| parse_entry(&l));
            match parsed {
                Some(entry) => entries.push(entry),
                None => {
                    truncated = true;
                    break;
                }
            }
        }

        Ok(Some(ProgressFile {
            sql: first,
            progress: ProgressSet::from_unsorted(entries),
            truncated,
        }))
    }

    /// Loads the progress recorded for `topic` if it was recorded for `sql`.
    pub fn load(&self, topic: &str, sql: &str) -> Result<LoadOutcome> {
        let Some(file) = self.read(topic)? else {
            trace!(topic, "subscription progress file does not exist");
            return Ok(LoadOutcome::Missing);
        };

        if file.sql.is_empty() {
            trace!(topic, "invalid subscription progress file");
            return Ok(LoadOutcome::Corrupt);
        }
        if file.sql != sql {
            trace!(topic, "subscription sql statement mismatch");
            return Ok(LoadOutcome::Mismatch);
        }
        if file.truncated {
            warn!(
                topic,
                tables = file.progress.len(),
                "progress file has a malformed line, keeping the entries before it"
            );
        }

        trace!(topic, tables = file.progress.len(), "subscription progress loaded");
        Ok(LoadOutcome::Loaded(file.progress))
    }

    /// Deletes the progress file for `topic`.
    pub fn remove(&self, topic: &str) -> Result<()> {
        let path = self.path_for(topic);
        fs::remove_file(&path).map_err(|e| SubscribeError::io(&path, e))
    }

    /// Topics that have a progress file, in name order.
    pub fn list_topics(&self) -> Result<Vec<String>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SubscribeError::io(&self.dir, e)),
        };

        let mut topics: Vec<String> = read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        topics.sort();
        Ok(topics)
    }
}

/// Parses one `<uid>:<key>` line. Anything after the key is ignored.
fn parse_entry(line: &str) -> Option<ProgressEntry> {
    let (uid, rest) = leading_i64(line)?;
    let rest = rest.strip_prefix(':')?;
    let (key, _) = leading_i64(rest)?;
    Some(ProgressEntry::new(uid, key))
}

/// Splits an optionally signed decimal integer, after leading whitespace,
/// off the front of `text`.
fn leading_i64(text: &str) -> Option<(i64, &str)> {
    let text = text.trim_start();
    let sign = usize::from(text.starts_with(['-', '+']));
    let digits = text[sign..].bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let (number, rest) = text.split_at(sign + digits);
    Some((number.parse().ok()?, rest))
}
