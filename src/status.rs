//! Shared build status, held as one JSON document in object storage.
//!
//! Every mutation is a read-current / mutate-one-key / write-all cycle.
//! There is no locking: concurrent workers on the same prefix race, and
//! the last writer wins.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::{fs, io};

use crate::context::Context;
use crate::model::{BuildStatus, BuildStatusRecord, StatusDocument};

/// Errors from the object store or the status document.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("object store command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed status document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, StatusError>;

/// Minimal key/value view of a bucket.
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. An absent key is `Ok(None)`, not an error.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Keys under a prefix, in no particular order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// ── S3 ──

/// An S3 bucket accessed through the `aws` CLI with requester-pays.
pub struct S3Bucket {
    bucket: String,
    ctx: Context,
}

impl S3Bucket {
    pub fn new(bucket: impl Into<String>, ctx: Context) -> Self {
        Self {
            bucket: bucket.into(),
            ctx,
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}

/// JSON shape returned by `aws s3api list-objects-v2`.
#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjects {
    #[serde(default)]
    contents: Vec<ListedObject>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

impl ObjectStore for S3Bucket {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let output = self
            .ctx
            .command("aws")
            .args(["s3", "cp", "--request-payer", "requester", &self.uri(key), "-"])
            .output()?;

        if output.status.success() {
            return Ok(Some(output.stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("404") || stderr.contains("NoSuchKey") || stderr.contains("Not Found")
        {
            return Ok(None);
        }
        Err(StatusError::Command(stderr.trim().to_string()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut child = self
            .ctx
            .command("aws")
            .args(["s3", "cp", "--request-payer", "requester", "-", &self.uri(key)])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(bytes)?;
        }
        let output = child.wait_with_output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(StatusError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .ctx
            .command("aws")
            .args([
                "s3api",
                "list-objects-v2",
                "--request-payer",
                "requester",
                "--bucket",
                &self.bucket,
                "--prefix",
                prefix,
                "--output",
                "json",
            ])
            .output()?;

        if !output.status.success() {
            return Err(StatusError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        // An empty listing prints nothing at all.
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let listing: ListObjects = serde_json::from_slice(&output.stdout)?;
        Ok(listing.contents.into_iter().map(|o| o.key).collect())
    }
}

// ── Local directory ──

/// A directory standing in for a bucket. Keys map to relative paths.
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl ObjectStore for LocalBucket {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in ignore::WalkBuilder::new(&self.root)
            .standard_filters(false)
            .build()
        {
            let entry = entry.map_err(|e| StatusError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

// ── Status store ──

/// Typed access to the status document at one key.
pub struct StatusStore<'a> {
    store: &'a dyn ObjectStore,
    key: String,
}

impl<'a> StatusStore<'a> {
    pub fn new(store: &'a dyn ObjectStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The whole document. An absent object is an empty document.
    pub fn load(&self) -> Result<StatusDocument> {
        match self.store.get(&self.key)? {
            Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(StatusDocument::new()),
        }
    }

    pub fn get(&self, recipe: &str) -> Result<Option<BuildStatusRecord>> {
        Ok(self.load()?.remove(recipe))
    }

    /// Re-read the document, mutate one record, write the whole document back.
    ///
    /// A missing record starts out as a fresh `unknown` record.
    pub fn update<F>(&self, recipe: &str, mutate: F) -> Result<BuildStatusRecord>
    where
        F: FnOnce(&mut BuildStatusRecord),
    {
        let mut doc = self.load()?;
        let record = doc
            .entry(recipe.to_string())
            .or_insert_with(|| BuildStatusRecord::new(BuildStatusRecord::now_trydate()));
        mutate(record);
        let updated = record.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    /// Replace a record with a fresh one, discarding its history.
    pub fn reset(&self, recipe: &str) -> Result<BuildStatusRecord> {
        let mut doc = self.load()?;
        let record = BuildStatusRecord::new(BuildStatusRecord::now_trydate());
        doc.insert(recipe.to_string(), record.clone());
        self.save(&doc)?;
        Ok(record)
    }

    fn save(&self, doc: &StatusDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc)?;
        self.store.put(&self.key, &json)
    }
}

// ── Summary ──

/// Aggregate counts over a status document.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub by_status: BTreeMap<BuildStatus, usize>,

    /// Reasons seen more than once, most frequent first.
    pub common_reasons: Vec<(String, usize)>,
}

impl StatusSummary {
    pub fn from_document(doc: &StatusDocument) -> Self {
        let mut by_status = BTreeMap::new();
        let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
        for record in doc.values() {
            *by_status.entry(record.status).or_insert(0) += 1;
            *reasons.entry(record.reason.as_str()).or_insert(0) += 1;
        }

        let mut common_reasons: Vec<(String, usize)> = reasons
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(r, n)| (r.to_string(), n))
            .collect();
        common_reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Self {
            by_status,
            common_reasons,
        }
    }

    pub fn total(&self) -> usize {
        self.by_status.values().sum()
    }
}
