//! Install tree archives.
//!
//! A finished install `software/<pkg>/<version>/` (recognized by build logs
//! under `easybuild/`) is packed as `software/<pkg>/<pkg>-<version>.eb.tar.gz`.
//! An archive pulled from the bucket and extracted locally leaves a zero-byte
//! `<archive>.stub` next to where it would live, so it is neither extracted
//! again nor re-archived and re-uploaded.

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, mpsc};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ignore::WalkBuilder;

use crate::status::ObjectStore;

pub const ARCHIVE_SUFFIX: &str = ".eb.tar.gz";
pub const STUB_SUFFIX: &str = ".stub";

/// Version directories that hold nested `easybuild/` dirs but are not installs.
const NOT_VERSIONS: &[&str] = &["site-packages", "lib", "sandbox"];

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("object store error: {0}")]
    Store(#[from] crate::status::StatusError),
}

pub type Result<T> = core::result::Result<T, ArchiveError>;

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `<path>.stub`
pub fn stub_path(archive: &Path) -> PathBuf {
    let mut s = archive.as_os_str().to_owned();
    s.push(STUB_SUFFIX);
    PathBuf::from(s)
}

// ── Packing ──

/// Archives found or written by one packing pass.
#[derive(Debug, Default)]
pub struct ArchiveReport {
    /// Every archive that belongs to a local build, new or not.
    pub all: Vec<PathBuf>,
    /// Archives written by this pass.
    pub new: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Pack every finished install under `software_dir` that has no archive yet.
pub fn archive_software(software_dir: &Path) -> ArchiveReport {
    let mut report = ArchiveReport::default();

    let mut builder = WalkBuilder::new(software_dir);
    builder
        .standard_filters(false)
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != ".snapshot" && name != "__archive__"
        })
        .sort_by_file_name(Ord::cmp);

    for entry in builder.build().flatten() {
        if !entry.file_type().is_some_and(|t| t.is_dir()) {
            continue;
        }
        let version_dir = entry.path();
        if !has_build_logs(&version_dir.join("easybuild")) {
            continue;
        }
        let (Some(version), Some(package_root)) = (
            version_dir.file_name().map(|v| v.to_string_lossy().into_owned()),
            version_dir.parent(),
        ) else {
            continue;
        };
        if NOT_VERSIONS.contains(&version.as_str()) {
            continue;
        }
        let Some(package) = package_root.file_name().map(|p| p.to_string_lossy().into_owned())
        else {
            continue;
        };

        let tarball = software_dir
            .join(&package)
            .join(format!("{package}-{version}{ARCHIVE_SUFFIX}"));
        if stub_path(&tarball).exists() {
            tracing::debug!(tarball = %tarball.display(), "previously downloaded");
            continue;
        }
        report.all.push(tarball.clone());
        if tarball.is_file() {
            continue;
        }

        tracing::info!(tarball = %tarball.display(), "creating archive");
        match pack(version_dir, &version, &tarball) {
            Ok(()) => report.new.push(tarball),
            Err(e) => {
                tracing::warn!(error = %e, "archive failed");
                report.failed.push(tarball);
            }
        }
    }
    report
}

fn has_build_logs(easybuild_dir: &Path) -> bool {
    fs::read_dir(easybuild_dir).is_ok_and(|entries| {
        entries
            .flatten()
            .any(|e| e.path().extension().is_some_and(|x| x == "log"))
    })
}

/// Write `tarball` from `dir`, stored under `arcname`, via a `.tmp` file.
fn pack(dir: &Path, arcname: &str, tarball: &Path) -> Result<()> {
    let mut tmp = tarball.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = File::create(&tmp).map_err(io_at(&tmp))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(arcname, dir).map_err(io_at(dir))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(io_at(&tmp))?;

    fs::rename(&tmp, tarball).map_err(io_at(tarball))
}

// ── Extraction ──

/// Extract a gzipped tar stream into `dest`, giving the owner read and
/// write on everything extracted.
pub fn extract(reader: impl Read, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(io_at(dest))?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(io_at(dest))? {
        let mut entry = entry.map_err(io_at(dest))?;
        let rel = entry.path().map_err(io_at(dest))?.into_owned();
        entry.unpack_in(dest).map_err(io_at(&rel))?;

        let path = dest.join(&rel);
        if let Ok(meta) = fs::symlink_metadata(&path)
            && !meta.file_type().is_symlink()
        {
            let mode = owner_read_write(meta.permissions().mode());
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(io_at(&path))?;
        }
    }
    Ok(())
}

/// Add owner read/write, keep owner execute and every group/other bit.
pub fn owner_read_write(mode: u32) -> u32 {
    (mode & 0o7077) | 0o600 | (mode & 0o100)
}

/// Outcome of a bulk extraction.
#[derive(Debug, Default)]
pub struct UntarReport {
    pub extracted: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

enum JobResult {
    Extracted,
    Skipped,
    Failed(String, String),
}

/// Run `job` over `items` on at most `workers` scoped threads.
fn run_pool<T, F>(items: Vec<T>, workers: usize, job: F) -> UntarReport
where
    T: Send,
    F: Fn(T) -> JobResult + Sync,
{
    let workers = workers.clamp(1, items.len().max(1));
    let (job_tx, job_rx) = mpsc::channel::<T>();
    let (result_tx, result_rx) = mpsc::channel::<JobResult>();
    let job_rx = Mutex::new(job_rx);

    for item in items {
        // The receiver is alive until the scope below ends.
        let _ = job_tx.send(item);
    }
    drop(job_tx);

    std::thread::scope(|s| {
        for _ in 0..workers {
            let tx = result_tx.clone();
            let job_rx = &job_rx;
            let job = &job;
            s.spawn(move || {
                loop {
                    let next = match job_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(item) = next else { break };
                    if tx.send(job(item)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut report = UntarReport::default();
    for result in result_rx {
        match result {
            JobResult::Extracted => report.extracted += 1,
            JobResult::Skipped => report.skipped += 1,
            JobResult::Failed(name, error) => report.failed.push((name, error)),
        }
    }
    report
}

/// Extract every archive under `prefix` in the bucket into `dest_root`,
/// mirroring the key layout below the prefix.
pub fn download_untar(
    store: &dyn ObjectStore,
    prefix: &str,
    dest_root: &Path,
    workers: usize,
) -> Result<UntarReport> {
    let prefix = if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    };
    let keys: Vec<String> = store
        .list(&prefix)?
        .into_iter()
        .filter(|k| k.ends_with(ARCHIVE_SUFFIX))
        .collect();
    tracing::info!(count = keys.len(), prefix = %prefix, "extracting archives");

    Ok(run_pool(keys, workers, |key| {
        let tail = &key[prefix.len()..];
        let target = dest_root.join(tail);
        let stub = stub_path(&target);
        if stub.exists() {
            return JobResult::Skipped;
        }
        let Some(dest) = target.parent() else {
            return JobResult::Failed(key.clone(), "no parent directory".into());
        };
        let result = match store.get(&key) {
            Ok(Some(bytes)) => extract(bytes.as_slice(), dest),
            Ok(None) => return JobResult::Failed(key.clone(), "object vanished".into()),
            Err(e) => Err(e.into()),
        };
        finish(key.clone(), &stub, result)
    }))
}

/// Extract every local archive under `dir` in place.
pub fn untar_tree(dir: &Path, workers: usize) -> UntarReport {
    let archives: Vec<PathBuf> = WalkBuilder::new(dir)
        .standard_filters(false)
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(ignore::DirEntry::into_path)
        .filter(|p| p.to_string_lossy().ends_with(ARCHIVE_SUFFIX))
        .collect();

    run_pool(archives, workers, |archive| {
        let name = archive.to_string_lossy().into_owned();
        let stub = stub_path(&archive);
        if stub.exists() {
            return JobResult::Skipped;
        }
        let Some(dest) = archive.parent() else {
            return JobResult::Failed(name, "no parent directory".into());
        };
        let result = File::open(&archive)
            .map_err(io_at(&archive))
            .and_then(|f| extract(f, dest));
        finish(name, &stub, result)
    })
}

fn finish(name: String, stub: &Path, result: Result<()>) -> JobResult {
    let result = result.and_then(|()| File::create(stub).map(drop).map_err(io_at(stub)));
    match result {
        Ok(()) => {
            tracing::info!(archive = %name, "extracted");
            JobResult::Extracted
        }
        Err(e) => {
            tracing::warn!(archive = %name, error = %e, "extraction failed");
            JobResult::Failed(name, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::status::LocalBucket;

    /// Lay out `software/<pkg>/<version>/easybuild/<pkg>.log` plus one file.
    fn install(software: &Path, pkg: &str, version: &str) -> PathBuf {
        let dir = software.join(pkg).join(version);
        fs::create_dir_all(dir.join("easybuild")).unwrap();
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("easybuild").join(format!("easybuild-{pkg}.log")), "ok").unwrap();
        fs::write(dir.join("bin").join(pkg), "#!/bin/sh\n").unwrap();
        dir
    }

    #[test]
    fn archives_new_installs_once() {
        let root = TempDir::new().unwrap();
        let software = root.path().join("software");
        install(&software, "zlib", "1.3-GCCcore-12.3.0");

        let first = archive_software(&software);
        let expected = software.join("zlib").join("zlib-1.3-GCCcore-12.3.0.eb.tar.gz");
        assert_eq!(first.new, [expected.clone()]);
        assert!(expected.is_file());

        let second = archive_software(&software);
        assert!(second.new.is_empty());
        assert_eq!(second.all, [expected]);
    }

    #[test]
    fn ignores_trees_without_logs_or_with_reserved_names() {
        let root = TempDir::new().unwrap();
        let software = root.path().join("software");
        fs::create_dir_all(software.join("half/1.0/easybuild")).unwrap();
        install(&software, "Python", "lib");

        let report = archive_software(&software);
        assert!(report.all.is_empty());
    }

    #[test]
    fn stub_prevents_rearchiving() {
        let root = TempDir::new().unwrap();
        let software = root.path().join("software");
        install(&software, "bzip2", "1.0.8");
        let tarball = software.join("bzip2").join("bzip2-1.0.8.eb.tar.gz");
        File::create(stub_path(&tarball)).unwrap();

        let report = archive_software(&software);
        assert!(report.all.is_empty());
        assert!(!tarball.exists());
    }

    #[test]
    fn permission_fix_keeps_owner_execute() {
        assert_eq!(owner_read_write(0o400), 0o600);
        assert_eq!(owner_read_write(0o555), 0o755);
        assert_eq!(owner_read_write(0o4511), 0o4711);
    }

    #[test]
    fn download_untar_extracts_and_writes_stubs() {
        let root = TempDir::new().unwrap();
        let built = root.path().join("built");
        install(&built, "zlib", "1.3");
        let report = archive_software(&built);
        let bytes = fs::read(&report.new[0]).unwrap();

        let bucket = LocalBucket::new(root.path().join("bucket")).unwrap();
        bucket
            .put("aws/p/software/zlib/zlib-1.3.eb.tar.gz", &bytes)
            .unwrap();
        bucket.put("aws/p/software/zlib/notes.txt", b"x").unwrap();

        let dest = root.path().join("dest");
        let first = download_untar(&bucket, "aws/p/software", &dest, 4).unwrap();
        assert_eq!(first.extracted, 1);
        assert!(first.failed.is_empty());
        assert!(dest.join("zlib/1.3/bin/zlib").is_file());
        assert!(dest.join("zlib/zlib-1.3.eb.tar.gz.stub").is_file());

        let second = download_untar(&bucket, "aws/p/software/", &dest, 4).unwrap();
        assert_eq!(second.extracted, 0);
        assert_eq!(second.skipped, 1);
    }

    #[test]
    fn corrupt_archive_fails_in_isolation() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("software");
        fs::create_dir_all(dir.join("a")).unwrap();
        fs::write(dir.join("a/a-1.eb.tar.gz"), b"not gzip").unwrap();
        install(&root.path().join("built"), "b", "2");
        let good = archive_software(&root.path().join("built"));
        fs::create_dir_all(dir.join("b")).unwrap();
        fs::copy(&good.new[0], dir.join("b/b-2.eb.tar.gz")).unwrap();

        let report = untar_tree(&dir, 2);
        assert_eq!(report.extracted, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(dir.join("b/2/easybuild").is_dir());
        assert!(!stub_path(&dir.join("a/a-1.eb.tar.gz")).exists());
    }
}
