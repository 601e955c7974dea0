//! Split zip packaging of completed batches
//!
//! Files are grouped into segments of at most `split_size` input bytes at
//! whole-file granularity. Segments are named `<base>.zip`, `<base>.zip.part1`,
//! `<base>.zip.part2` and so on. Every segment is first written to a `.tmp`
//! sibling and only renamed into place once all of them succeeded; on any
//! failure every file this invocation created is removed, and nothing else.
//! An output base whose `.zip` family already exists is handled with the same
//! [`FileCollisionAction`] policy as item output.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::FileOptions;

use crate::config::{ArchiveConfig, FileCollisionAction};
use crate::error::{Error, Result};
use crate::naming::MAX_RENAME_ATTEMPTS;

/// One written archive segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSegment {
    /// Final segment path
    pub path: PathBuf,
    /// Input files packed into this segment, in order
    pub files: Vec<PathBuf>,
    /// Sum of the input file sizes
    pub input_bytes: u64,
}

/// Group file sizes into segments of at most `split_size` bytes
///
/// Returns indices into `sizes`, in input order. A segment is sealed before a
/// file that would push it past `split_size`; a file larger than `split_size`
/// gets a segment of its own.
///
/// ```
/// use media_dl::archive::plan_segments;
///
/// assert_eq!(
///     plan_segments(&[40, 40, 40, 100, 10], 100),
///     vec![vec![0, 1], vec![2], vec![3], vec![4]]
/// );
/// ```
pub fn plan_segments(sizes: &[u64], split_size: u64) -> Vec<Vec<usize>> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes: u64 = 0;

    for (index, &size) in sizes.iter().enumerate() {
        if !current.is_empty() && current_bytes.saturating_add(size) > split_size {
            segments.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(index);
        current_bytes = current_bytes.saturating_add(size);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Path of segment `index` (0-based) for `output_base`
pub fn segment_path(output_base: &Path, index: usize) -> PathBuf {
    let mut name: OsString = output_base.as_os_str().to_owned();
    if index == 0 {
        name.push(".zip");
    } else {
        name.push(format!(".zip.part{index}"));
    }
    PathBuf::from(name)
}

fn temp_path(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Entry name for `path`, suffixed with ` (n)` if already used in this segment
fn entry_name(path: &Path, used: &mut HashSet<String>) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    if used.insert(file_name.clone()) {
        return file_name;
    }

    let as_path = Path::new(&file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = as_path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u32;
    loop {
        let candidate = match &extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Whether `<base>.zip` or any `<base>.zip.*` sibling (parts, temps) exists
fn base_in_use(base: &Path) -> std::io::Result<bool> {
    let Some(name) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(false);
    };
    let first = format!("{name}.zip");
    let family = format!("{name}.zip.");

    let entries = match std::fs::read_dir(parent_dir(base)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let file_name = entry?.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name == first || file_name.starts_with(&family) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `<base>.zip.partN` files with `N >= count`
fn stale_parts(base: &Path, count: usize) -> std::io::Result<Vec<PathBuf>> {
    let Some(name) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{name}.zip.part");

    let mut stale = Vec::new();
    for entry in std::fs::read_dir(parent_dir(base))? {
        let entry = entry?;
        let file_name = entry.file_name();
        let index = file_name
            .to_string_lossy()
            .strip_prefix(&prefix)
            .and_then(|n| n.parse::<usize>().ok());
        if index.is_some_and(|n| n >= count) {
            stale.push(entry.path());
        }
    }
    Ok(stale)
}

fn parent_dir(base: &Path) -> &Path {
    match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Base path the segments are written under, following the collision policy
///
/// `Rename` moves to `<base> (1)`, `<base> (2)`, ... while any file of the
/// `<base>.zip` family exists. `Skip` refuses an occupied base. `Overwrite`
/// keeps the base; stale parts are removed once the new set is in place.
fn resolve_base(output_base: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    let in_use = |base: &Path| {
        base_in_use(base).map_err(|e| Error::ArchiveWrite {
            path: segment_path(base, 0),
            reason: format!("cannot inspect output directory: {e}"),
        })
    };

    match action {
        FileCollisionAction::Overwrite => Ok(output_base.to_path_buf()),
        FileCollisionAction::Skip => {
            if in_use(output_base)? {
                return Err(Error::ArchiveWrite {
                    path: segment_path(output_base, 0),
                    reason: "archive already exists".into(),
                });
            }
            Ok(output_base.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !in_use(output_base)? {
                return Ok(output_base.to_path_buf());
            }

            let name = output_base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for i in 1..=MAX_RENAME_ATTEMPTS {
                let candidate = output_base.with_file_name(format!("{name} ({i})"));
                if !in_use(&candidate)? {
                    return Ok(candidate);
                }
            }

            Err(Error::ArchiveWrite {
                path: segment_path(output_base, 0),
                reason: format!("no free archive name after {MAX_RENAME_ATTEMPTS} attempts"),
            })
        }
    }
}

/// Writes split zip archives on the blocking pool
///
/// Cloning is cheap; clones share the compression semaphore.
#[derive(Clone, Debug)]
pub struct Archiver {
    compression_level: u32,
    read_chunk_bytes: usize,
    collision: FileCollisionAction,
    /// Bounds concurrent packing jobs, separate from the download limit
    semaphore: Arc<Semaphore>,
}

impl Archiver {
    /// Create an archiver from configuration
    ///
    /// An occupied output base is renamed; see [`with_collision`](Self::with_collision).
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            compression_level: config.compression_level.min(9),
            read_chunk_bytes: config.read_chunk_bytes.max(1),
            collision: FileCollisionAction::Rename,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }

    /// Policy for an output base whose `.zip` family already exists
    pub fn with_collision(mut self, action: FileCollisionAction) -> Self {
        self.collision = action;
        self
    }

    /// Pack `paths` into segments next to `output_base`
    ///
    /// Returns the segments in creation order, or an empty list for empty
    /// input. The segments may live under a renamed base when `output_base`
    /// is occupied. Inputs are left in place. On failure no file created by
    /// this invocation remains and [`Error::ArchiveWrite`] is returned.
    pub async fn pack(
        &self,
        paths: &[PathBuf],
        output_base: &Path,
        split_size: u64,
    ) -> Result<Vec<ArchiveSegment>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let mut sizes = Vec::with_capacity(paths.len());
        for path in paths {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| Error::ArchiveWrite {
                    path: path.clone(),
                    reason: format!("cannot stat input: {e}"),
                })?;
            sizes.push(metadata.len());
        }
        let plan = plan_segments(&sizes, split_size);

        // Held across base selection so concurrent packs cannot claim the same name
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("archiver closed".into()))?;

        info!(
            base = %output_base.display(),
            files = paths.len(),
            segments = plan.len(),
            "packing archive"
        );

        let job = SegmentJob {
            output_base: output_base.to_path_buf(),
            collision: self.collision,
            plan,
            sizes,
            paths: paths.to_vec(),
            options: self.file_options(),
            read_chunk_bytes: self.read_chunk_bytes,
        };
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| Error::ArchiveWrite {
                path: output_base.to_path_buf(),
                reason: format!("archive task failed: {e}"),
            })?
    }

    fn file_options(&self) -> FileOptions {
        if self.compression_level == 0 {
            FileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(self.compression_level as i32))
        }
    }
}

/// Blocking half of [`Archiver::pack`]
struct SegmentJob {
    output_base: PathBuf,
    collision: FileCollisionAction,
    plan: Vec<Vec<usize>>,
    sizes: Vec<u64>,
    paths: Vec<PathBuf>,
    options: FileOptions,
    read_chunk_bytes: usize,
}

impl SegmentJob {
    fn run(self) -> Result<Vec<ArchiveSegment>> {
        let base = resolve_base(&self.output_base, self.collision)?;
        if base != self.output_base {
            info!(
                requested = %self.output_base.display(),
                base = %base.display(),
                "archive name in use, packing under a free name"
            );
        }
        let segments = self.layout(&base);

        // Temps and placed finals owned by this invocation
        let mut created: Vec<PathBuf> = Vec::with_capacity(segments.len() * 2);
        let mut buf = vec![0u8; self.read_chunk_bytes];

        for segment in &segments {
            let tmp = temp_path(&segment.path);
            let file = match File::create(&tmp) {
                Ok(file) => file,
                Err(e) => {
                    rollback(&created);
                    return Err(Error::ArchiveWrite {
                        path: segment.path.clone(),
                        reason: format!("create failed: {e}"),
                    });
                }
            };
            created.push(tmp);

            if let Err(e) = self.write_segment(file, segment, &mut buf) {
                rollback(&created);
                return Err(e);
            }
            debug!(
                segment = %segment.path.display(),
                files = segment.files.len(),
                input_bytes = segment.input_bytes,
                "segment written"
            );
        }

        for segment in &segments {
            let tmp = temp_path(&segment.path);
            if let Err(e) = std::fs::rename(&tmp, &segment.path) {
                rollback(&created);
                return Err(Error::ArchiveWrite {
                    path: segment.path.clone(),
                    reason: format!("rename failed: {e}"),
                });
            }
            created.push(segment.path.clone());
        }

        if self.collision == FileCollisionAction::Overwrite {
            remove_stale_parts(&base, segments.len());
        }
        Ok(segments)
    }

    fn layout(&self, base: &Path) -> Vec<ArchiveSegment> {
        self.plan
            .iter()
            .enumerate()
            .map(|(index, members)| ArchiveSegment {
                path: segment_path(base, index),
                input_bytes: members.iter().map(|&i| self.sizes[i]).sum(),
                files: members.iter().map(|&i| self.paths[i].clone()).collect(),
            })
            .collect()
    }

    fn write_segment(&self, file: File, segment: &ArchiveSegment, buf: &mut [u8]) -> Result<()> {
        let fail = |reason: String| Error::ArchiveWrite {
            path: segment.path.clone(),
            reason,
        };

        let mut zip = ZipWriter::new(BufWriter::new(file));
        let mut used = HashSet::new();

        for input in &segment.files {
            let name = entry_name(input, &mut used);
            zip.start_file(name, self.options)
                .map_err(|e| fail(format!("cannot start entry for {}: {e}", input.display())))?;

            let mut reader = File::open(input)
                .map_err(|e| fail(format!("cannot open {}: {e}", input.display())))?;
            loop {
                let n = reader
                    .read(buf)
                    .map_err(|e| fail(format!("cannot read {}: {e}", input.display())))?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buf[..n])
                    .map_err(|e| fail(format!("write failed: {e}")))?;
            }
        }

        let mut out = zip
            .finish()
            .map_err(|e| fail(format!("finish failed: {e}")))?;
        out.flush().map_err(|e| fail(format!("flush failed: {e}")))?;
        out.get_ref()
            .sync_all()
            .map_err(|e| fail(format!("sync failed: {e}")))?;
        Ok(())
    }
}

/// Remove the temps and finals this invocation created
fn rollback(created: &[PathBuf]) {
    for path in created {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed segment during rollback"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "rollback could not remove segment"),
        }
    }
}

/// Drop parts of an overwritten set that the new set does not reach
fn remove_stale_parts(base: &Path, count: usize) {
    let stale = match stale_parts(base, count) {
        Ok(stale) => stale,
        Err(e) => {
            warn!(base = %base.display(), error = %e, "could not list stale archive parts");
            return;
        }
    };
    for path in stale {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale archive part"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale archive part"),
        }
    }
}
