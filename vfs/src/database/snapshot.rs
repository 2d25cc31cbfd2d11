//! The on-disk format of the content database.
//!
//! The snapshot is a sequence of frames, each being a little-endian u32
//! length followed by a bincode-encoded [Record]. After a [Header], entries
//! are grouped by provider. Within a group, every entry path is stored
//! relative to the parent of the previous one.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::handle::ExpectedContent;
use crate::content::ContentDescriptor;
use crate::path::{Path, PathBuf};
use crate::provider::ProviderKey;

const MAGIC: &str = "tvix-vfs-db";
const VERSION: u32 = 1;

/// Upper bound for the snapshot size we're willing to read.
const SNAPSHOT_LIMIT_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
enum RelPath {
    Absolute(PathBuf),
    /// Go up `up` components from the base, then descend into `rest`.
    Relative { up: u32, rest: PathBuf },
}

#[derive(Debug, Serialize, Deserialize)]
enum Record {
    Provider(ProviderKey),
    /// The path of the next entry. Followed by a [Record::Contents].
    Path(RelPath),
    Contents {
        disk: ContentDescriptor,
        user: ContentDescriptor,
    },
    EndProvider,
    TaskResults(Bytes),
    End,
}

/// The persisted state of a content database.
#[derive(Debug, Default)]
pub(super) struct Snapshot {
    pub groups: Vec<(ProviderKey, Vec<(PathBuf, ExpectedContent)>)>,
    pub task_results: Bytes,
}

fn relativize(base: Option<&Path>, path: &Path) -> RelPath {
    let Some(base) = base else {
        return RelPath::Absolute(path.to_owned());
    };
    let common = base
        .components_bytes()
        .zip(path.components_bytes())
        .take_while(|(a, b)| a == b)
        .count();
    let up = (base.name_count() - common) as u32;
    let mut rest = PathBuf::new();
    for c in path.components().skip(common) {
        rest.push(&c);
    }
    RelPath::Relative { up, rest }
}

fn resolve(base: Option<&Path>, rel: RelPath) -> Option<PathBuf> {
    match rel {
        RelPath::Absolute(p) => Some(p),
        RelPath::Relative { up, rest } => {
            let mut current = base?;
            for _ in 0..up {
                current = current.parent()?;
            }
            Some(current.join_path(&rest))
        }
    }
}

fn write_frame<W: Write>(w: &mut W, record: &impl Serialize) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)
}

fn encode(snapshot: &Snapshot) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_frame(
        &mut buf,
        &Header {
            magic: MAGIC.to_string(),
            version: VERSION,
        },
    )?;
    for (provider, entries) in &snapshot.groups {
        if entries.is_empty() {
            continue;
        }
        write_frame(&mut buf, &Record::Provider(*provider))?;
        let mut base: Option<&Path> = None;
        for (path, expected) in entries {
            write_frame(&mut buf, &Record::Path(relativize(base, path)))?;
            write_frame(
                &mut buf,
                &Record::Contents {
                    disk: (*expected.disk).clone(),
                    user: (*expected.user).clone(),
                },
            )?;
            base = path.parent();
        }
        write_frame(&mut buf, &Record::EndProvider)?;
    }
    write_frame(&mut buf, &Record::TaskResults(snapshot.task_results.clone()))?;
    write_frame(&mut buf, &Record::End)?;
    Ok(buf)
}

/// Writes the snapshot to `path`, replacing any previous one atomically.
#[instrument(skip(snapshot), fields(path = %path.display()), err)]
pub(super) fn write(path: &std::path::Path, snapshot: &Snapshot) -> io::Result<()> {
    let buf = encode(snapshot)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;

    debug!(bytes = buf.len(), "wrote snapshot");
    Ok(())
}

/// Splits the buffer into frame payloads. Stops at a truncated frame.
fn frames(mut buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    std::iter::from_fn(move || {
        if buf.len() < 4 {
            if !buf.is_empty() {
                warn!("truncated frame header in snapshot");
            }
            return None;
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if buf.len() - 4 < len {
            warn!("truncated frame in snapshot");
            return None;
        }
        let (payload, rest) = buf[4..].split_at(len);
        buf = rest;
        Some(payload)
    })
}

fn decode(buf: &[u8]) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let mut frames = frames(buf);

    match frames.next().map(|f| bincode::deserialize::<Header>(f)) {
        Some(Ok(header)) if header.magic == MAGIC && header.version == VERSION => {}
        _ => {
            warn!("snapshot header mismatch, starting from scratch");
            return snapshot;
        }
    }

    let mut group: Option<(ProviderKey, Vec<(PathBuf, ExpectedContent)>)> = None;
    // the parent of the last entry, None if unknown.
    let mut base: Option<PathBuf> = None;
    // the path of the entry whose contents are read next.
    let mut pending: Option<PathBuf> = None;

    for frame in frames {
        let record = match bincode::deserialize::<Record>(frame) {
            Ok(record) => record,
            Err(e) => {
                warn!(err = %e, "skipping unreadable snapshot record");
                // if no contents were expected, a path might have been lost.
                if pending.take().is_none() {
                    base = None;
                }
                continue;
            }
        };

        match record {
            Record::Provider(provider) => {
                if let Some(finished) = group.take() {
                    snapshot.groups.push(finished);
                }
                group = Some((provider, Vec::new()));
                base = None;
                pending = None;
            }
            Record::Path(rel) => {
                let is_absolute = matches!(rel, RelPath::Absolute(_));
                pending = if base.is_some() || is_absolute {
                    resolve(base.as_deref(), rel)
                } else {
                    None
                };
                base = pending.as_ref().and_then(|p| p.parent().map(|p| p.to_owned()));
            }
            Record::Contents { disk, user } => {
                match (pending.take(), group.as_mut()) {
                    (Some(path), Some((_, entries))) => entries.push((
                        path,
                        ExpectedContent {
                            user: Arc::new(user),
                            disk: Arc::new(disk),
                        },
                    )),
                    _ => debug!("dropping snapshot contents without a path"),
                }
            }
            Record::EndProvider => {
                if let Some(finished) = group.take() {
                    snapshot.groups.push(finished);
                }
            }
            Record::TaskResults(task_results) => snapshot.task_results = task_results,
            Record::End => break,
        }
    }
    if let Some(finished) = group.take() {
        snapshot.groups.push(finished);
    }

    snapshot
}

/// Reads the snapshot at `path`.
/// A missing or unreadable snapshot yields an empty one.
#[instrument(fields(path = %path.display()))]
pub(super) fn read(path: &std::path::Path) -> Snapshot {
    match fs::metadata(path) {
        Ok(metadata) if metadata.len() > SNAPSHOT_LIMIT_BYTES => {
            warn!(size = metadata.len(), "snapshot too large, ignoring");
            return Snapshot::default();
        }
        Ok(_) => {}
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(err = %e, "failed to stat snapshot");
            }
            return Snapshot::default();
        }
    }

    match fs::read(path) {
        Ok(buf) => decode(&buf),
        Err(e) => {
            warn!(err = %e, "failed to read snapshot");
            Snapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use super::{decode, encode, relativize, resolve, Snapshot};
    use crate::content::ContentDescriptor;
    use crate::database::handle::ExpectedContent;
    use crate::fixtures::{HASH_A, HASH_B};
    use crate::path::PathBuf;
    use crate::provider::ProviderKey;

    fn p(s: &str) -> PathBuf {
        s.parse().unwrap()
    }

    fn expected(user: &ContentDescriptor) -> ExpectedContent {
        ExpectedContent {
            user: Arc::new(user.clone()),
            disk: Arc::new(HASH_B.clone()),
        }
    }

    fn sample() -> Snapshot {
        Snapshot {
            groups: vec![(
                ProviderKey::from_uuid(uuid::Uuid::nil()),
                vec![
                    (p("a/b/c"), expected(&HASH_A)),
                    (p("a/b/d"), expected(&ContentDescriptor::Directory)),
                    (p("a/x"), expected(&HASH_A)),
                    (p("z/y/w"), expected(&HASH_A)),
                ],
            )],
            task_results: Bytes::from_static(b"results"),
        }
    }

    fn paths(snapshot: &Snapshot) -> Vec<PathBuf> {
        snapshot.groups[0].1.iter().map(|(p, _)| p.clone()).collect()
    }

    #[test]
    fn relative_paths() {
        let base = p("a/b");
        for target in ["a/b/c", "a/x", "q", "a/b/c/d/e"] {
            let rel = relativize(Some(&base), &p(target));
            assert_eq!(Some(p(target)), resolve(Some(&base), rel));
        }
    }

    #[test]
    fn decode_encoded() {
        let snapshot = sample();
        let decoded = decode(&encode(&snapshot).unwrap());

        assert_eq!(paths(&snapshot), paths(&decoded));
        assert_eq!(snapshot.task_results, decoded.task_results);
        assert_eq!(
            ContentDescriptor::Directory,
            *decoded.groups[0].1[1].1.user
        );
    }

    #[test]
    fn truncated_keeps_prefix() {
        let buf = encode(&sample()).unwrap();
        let decoded = decode(&buf[..buf.len() / 2]);
        let n = decoded.groups.first().map(|g| g.1.len()).unwrap_or(0);
        assert!(n < 4);
    }

    #[test]
    fn garbage_is_cold_start() {
        let decoded = decode(b"\x05\x00\x00\x00garbage and more");
        assert!(decoded.groups.is_empty());
    }

    #[test]
    fn corrupt_contents_record_is_skipped() {
        let snapshot = sample();
        let mut buf = encode(&snapshot).unwrap();

        // locate the second frame after the header and the provider frame,
        // which holds the contents of the first entry, and corrupt it.
        let mut offset = 0;
        for _ in 0..3 {
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4 + len;
        }
        // first byte of the payload is the enum discriminant
        buf[offset + 4] = 0xff;

        let decoded = decode(&buf);
        assert_eq!(vec![p("a/b/d"), p("a/x"), p("z/y/w")], paths(&decoded));
    }
}
