//! Single-pass tar extraction with explicit fault classification.
//!
//! Nothing from the archive metadata besides names, types and contents is
//! applied: ownership, modes, timestamps and xattrs are left at the process
//! defaults. Every path is confined to the extraction root, and nothing is
//! ever written through a symlink. Symlinks themselves are created last, once
//! all regular entries exist, and only when their target resolves to an
//! existing path inside the root. Absolute targets are resolved against the
//! root and written as the equivalent relative link.
//!
//! Duplicate entries and dangling links are logged and skipped; only a stream
//! that cannot be read as an archive aborts the unpack.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Component, Path, PathBuf},
};

use flate2::read::MultiGzDecoder;
use tar::{Archive, Entry, EntryType};
use tracing::warn;

use super::ExtractFault;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
pub(crate) enum UnpackError {
    Fault(ExtractFault),
    Io(io::Error),
}

impl From<ExtractFault> for UnpackError {
    fn from(fault: ExtractFault) -> Self {
        UnpackError::Fault(fault)
    }
}

#[derive(Debug, Default)]
pub(crate) struct UnpackStats {
    pub entries: usize,
    pub skipped: Vec<ExtractFault>,
}

enum Unpacked {
    Written,
    Deferred,
    Ignored,
}

struct DeferredSymlink {
    name: String,
    relative: PathBuf,
    target: String,
}

enum Confined {
    Inside(PathBuf),
    Root,
    Outside,
}

/// Wraps `reader` in the decompressor its leading bytes call for.
pub(crate) fn open_stream<R: Read + Send + 'static>(
    reader: R,
) -> Result<Box<dyn Read + Send>, UnpackError> {
    let mut reader = BufReader::new(reader);
    let (empty, gzip, codec) = {
        let head = reader.fill_buf().map_err(UnpackError::Io)?;
        (
            head.is_empty(),
            head.starts_with(&[0x1f, 0x8b]),
            unsupported_codec(head),
        )
    };
    if empty {
        return Err(malformed("archive is empty"));
    }
    if let Some(codec) = codec {
        return Err(malformed(format!("unsupported compression: {codec}")));
    }
    if gzip {
        return Ok(Box::new(MultiGzDecoder::new(reader)));
    }
    Ok(Box::new(reader))
}

fn unsupported_codec(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"BZh") {
        Some("bzip2")
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some("xz")
    } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Some("zstd")
    } else {
        None
    }
}

/// Extracts every entry of `reader` below `root`, which must already exist.
pub(crate) fn unpack<R: Read>(
    reader: R,
    root: &Path,
    label: &str,
) -> Result<UnpackStats, UnpackError> {
    let mut archive = Archive::new(reader);
    let mut stats = UnpackStats::default();
    let mut deferred = Vec::new();

    let entries = archive.entries().map_err(read_fault)?;
    for entry in entries {
        let mut entry = entry.map_err(read_fault)?;
        let outcome = unpack_entry(&mut entry, root, &mut deferred);
        absorb(&mut stats, outcome, label)?;
    }

    link_deferred(root, deferred, &mut stats, label)?;
    Ok(stats)
}

fn absorb(
    stats: &mut UnpackStats,
    outcome: Result<Unpacked, UnpackError>,
    label: &str,
) -> Result<(), UnpackError> {
    match outcome {
        Ok(Unpacked::Written) => {
            stats.entries += 1;
            Ok(())
        }
        Ok(Unpacked::Deferred) | Ok(Unpacked::Ignored) => Ok(()),
        Err(UnpackError::Fault(fault)) if fault.is_recoverable() => {
            warn!(archive = label, fault = %fault, "skipping archive entry");
            stats.skipped.push(fault);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn unpack_entry<R: Read>(
    entry: &mut Entry<'_, R>,
    root: &Path,
    deferred: &mut Vec<DeferredSymlink>,
) -> Result<Unpacked, UnpackError> {
    let name = decode_name(&entry.path_bytes())?;
    let relative = match confine(&name) {
        Confined::Inside(relative) => relative,
        Confined::Root => return Ok(Unpacked::Ignored),
        Confined::Outside => {
            warn!(entry = %name, "skipping entry that resolves outside the archive root");
            return Ok(Unpacked::Ignored);
        }
    };
    if has_symlink_ancestor(root, &relative) {
        return Err(ExtractFault::DuplicateEntry(name).into());
    }
    let target = root.join(&relative);

    match entry.header().entry_type() {
        EntryType::Directory => {
            if let Ok(meta) = fs::symlink_metadata(&target) {
                if !meta.is_dir() {
                    return Err(ExtractFault::DuplicateEntry(name).into());
                }
                return Ok(Unpacked::Written);
            }
            create_dirs(root, &target, &name)?;
            Ok(Unpacked::Written)
        }
        // The reader expands GNU sparse maps, so sparse entries are plain files here.
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
            write_file(entry, root, &target, &name)
        }
        EntryType::Symlink => {
            let link = link_name(entry, &name)?;
            deferred.push(DeferredSymlink {
                name,
                relative,
                target: link,
            });
            Ok(Unpacked::Deferred)
        }
        EntryType::Link => hard_link(entry, root, &target, &name),
        other => {
            warn!(entry = %name, kind = ?other, "skipping unsupported entry type");
            Ok(Unpacked::Ignored)
        }
    }
}

fn write_file<R: Read>(
    entry: &mut Entry<'_, R>,
    root: &Path,
    target: &Path,
    name: &str,
) -> Result<Unpacked, UnpackError> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {
            return Err(ExtractFault::DuplicateEntry(name.to_string()).into());
        }
        // Later entries replace earlier ones; unlinking first keeps a
        // previously hard-linked sibling intact.
        Ok(_) => fs::remove_file(target).map_err(UnpackError::Io)?,
        Err(_) => {}
    }
    if let Some(parent) = target.parent() {
        create_dirs(root, parent, name)?;
    }

    let mut file = File::create(target).map_err(UnpackError::Io)?;
    let expected = entry.header().entry_size().map_err(read_fault)?;
    let copied = copy_data(entry, &mut file)?;
    if copied < expected {
        return Err(malformed(format!(
            "entry `{name}` is truncated ({copied} of {expected} bytes)"
        )));
    }
    Ok(Unpacked::Written)
}

fn copy_data<R: Read>(entry: &mut Entry<'_, R>, file: &mut File) -> Result<u64, UnpackError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_fault(err)),
        };
        file.write_all(&buf[..read]).map_err(UnpackError::Io)?;
        total += read as u64;
    }
    Ok(total)
}

fn hard_link<R: Read>(
    entry: &Entry<'_, R>,
    root: &Path,
    target: &Path,
    name: &str,
) -> Result<Unpacked, UnpackError> {
    let link = link_name(entry, name)?;
    let missing = || ExtractFault::MissingLinkTarget {
        path: name.to_string(),
        target: link.clone(),
    };

    let source = match confine(&link) {
        Confined::Inside(relative) if !has_symlink_ancestor(root, &relative) => root.join(relative),
        _ => return Err(missing().into()),
    };
    match fs::symlink_metadata(&source) {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(missing().into()),
    }
    if fs::symlink_metadata(target).is_ok() {
        return Err(ExtractFault::DuplicateEntry(name.to_string()).into());
    }
    if let Some(parent) = target.parent() {
        create_dirs(root, parent, name)?;
    }
    match fs::hard_link(&source, target) {
        Ok(()) => Ok(Unpacked::Written),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            Err(ExtractFault::DuplicateEntry(name.to_string()).into())
        }
        Err(err) => Err(UnpackError::Io(err)),
    }
}

/// Creates deferred symlinks, retrying until no more of them resolve so that
/// links pointing at other links work regardless of archive order.
fn link_deferred(
    root: &Path,
    mut pending: Vec<DeferredSymlink>,
    stats: &mut UnpackStats,
    label: &str,
) -> Result<(), UnpackError> {
    if pending.is_empty() {
        return Ok(());
    }
    let real_root = fs::canonicalize(root).map_err(UnpackError::Io)?;

    loop {
        let before = pending.len();
        let mut unresolved = Vec::new();
        for link in pending {
            match try_symlink(root, &real_root, &link) {
                Ok(true) => absorb(stats, Ok(Unpacked::Written), label)?,
                Ok(false) => unresolved.push(link),
                Err(err) => absorb(stats, Err(err), label)?,
            }
        }
        pending = unresolved;
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }

    for link in pending {
        let fault = ExtractFault::MissingLinkTarget {
            path: link.name,
            target: link.target,
        };
        absorb(stats, Err(fault.into()), label)?;
    }
    Ok(())
}

/// `Ok(false)` means the target does not exist (yet) inside the root.
fn try_symlink(root: &Path, real_root: &Path, link: &DeferredSymlink) -> Result<bool, UnpackError> {
    let destination = root.join(&link.relative);
    if has_symlink_ancestor(root, &link.relative) || fs::symlink_metadata(&destination).is_ok() {
        return Err(ExtractFault::DuplicateEntry(link.name.clone()).into());
    }
    let target = relative_target(&link.relative, &link.target);
    let parent = destination.parent().unwrap_or(root);
    create_dirs(root, parent, &link.name)?;

    match fs::canonicalize(parent.join(&target)) {
        Ok(resolved) if resolved.starts_with(real_root) => {}
        _ => return Ok(false),
    }
    make_symlink(&target, &destination)?;
    Ok(true)
}

/// Rewrites an absolute link target as a path relative to the link's own
/// directory, treating the archive root as `/`. Relative targets pass through.
fn relative_target(relative: &Path, target: &str) -> PathBuf {
    let absolute = Path::new(target);
    if !absolute.is_absolute() {
        return absolute.to_path_buf();
    }
    let depth = relative
        .parent()
        .map_or(0, |parent| parent.components().count());
    let mut rebased: PathBuf = std::iter::repeat(Component::ParentDir).take(depth).collect();
    for component in absolute.components() {
        match component {
            Component::Normal(_) | Component::ParentDir => rebased.push(component),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if rebased.as_os_str().is_empty() {
        rebased.push(Component::CurDir);
    }
    rebased
}

#[cfg(unix)]
fn make_symlink(target: &Path, destination: &Path) -> Result<(), UnpackError> {
    std::os::unix::fs::symlink(target, destination).map_err(UnpackError::Io)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, destination: &Path) -> Result<(), UnpackError> {
    tracing::debug!(
        link = %destination.display(),
        target = %target.display(),
        "symlinks are not supported on this platform; skipping"
    );
    Ok(())
}

fn create_dirs(root: &Path, dir: &Path, name: &str) -> Result<(), UnpackError> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) => {
            let relative = dir.strip_prefix(root).unwrap_or(dir);
            if occupied_by_non_dir(root, relative) {
                Err(ExtractFault::DuplicateEntry(name.to_string()).into())
            } else {
                Err(UnpackError::Io(err))
            }
        }
    }
}

fn occupied_by_non_dir(root: &Path, relative: &Path) -> bool {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if !meta.is_dir() => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    false
}

fn has_symlink_ancestor(root: &Path, relative: &Path) -> bool {
    let Some(parent) = relative.parent() else {
        return false;
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    false
}

fn confine(name: &str) -> Confined {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Confined::Outside;
            }
        }
    }
    if relative.as_os_str().is_empty() {
        Confined::Root
    } else {
        Confined::Inside(relative)
    }
}

fn link_name<R: Read>(entry: &Entry<'_, R>, name: &str) -> Result<String, UnpackError> {
    match entry.link_name_bytes() {
        Some(raw) if !raw.is_empty() => decode_name(&raw),
        _ => Err(ExtractFault::MissingLinkTarget {
            path: name.to_string(),
            target: String::new(),
        }
        .into()),
    }
}

fn decode_name(raw: &[u8]) -> Result<String, UnpackError> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| ExtractFault::UndecodableBytes(String::from_utf8_lossy(raw).into_owned()).into())
}

fn malformed(message: impl Into<String>) -> UnpackError {
    ExtractFault::MalformedStream(message.into()).into()
}

/// Errors surfacing from the archive reader are stream faults: bad headers,
/// checksum mismatches, truncated blocks, or corrupt compressed data.
fn read_fault(err: io::Error) -> UnpackError {
    malformed(err.to_string())
}
