use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, warn};

use cask_types::{BlobId, LifecycleState};

use crate::attributes::BlobAttributes;
use crate::error::{MetadataError, MetadataResult};
use crate::index::MetadataTable;
use crate::record;
use crate::traits::{BlobMetadataStore, CompactStats, StateIter};

/// File name of the journal inside the store directory.
pub const JOURNAL_FILE_NAME: &str = "metadata.journal";

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Flush/sync strategy for the journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JournalSync {
    /// `fsync` after every entry.
    EveryWrite,
    /// Flush to the OS page cache only.
    #[default]
    OsDefault,
}

enum JournalOp {
    Put(BlobId, BlobAttributes),
    Delete(BlobId),
}

/// Append target of the journal.
///
/// Frames are written whole and unbuffered. After a failed append the sink
/// is cut back to the last complete frame.
trait JournalSink: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl JournalSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

struct JournalWriter {
    sink: Box<dyn JournalSink>,
    /// End of the last complete frame.
    offset: u64,
    /// Entries superseded by later puts or deletes.
    stale: usize,
}

/// Crash-recoverable metadata store backed by an append-only journal.
///
/// Each mutation appends one entry:
///
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload]
///
/// payload: op u8 | id length u16 BE | id UTF-8 | record (put only)
/// ```
///
/// The whole journal is replayed into memory on open. A torn tail left by a
/// crash is truncated away; entries failing their CRC are skipped.
/// [`compact`](BlobMetadataStore::compact) rewrites the journal with one
/// entry per live record.
pub struct JournalMetadataStore {
    path: PathBuf,
    sync: JournalSync,
    writer: Mutex<JournalWriter>,
    table: RwLock<MetadataTable>,
}

impl JournalMetadataStore {
    /// Open (or create) the journal in `dir`.
    pub fn open(dir: &Path, sync: JournalSync) -> MetadataResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE_NAME);

        let (table, valid_end, stale) = if path.exists() {
            replay(&path)?
        } else {
            (MetadataTable::new(), 0, 0)
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len > valid_end {
            warn!(
                path = %path.display(),
                valid_end,
                file_len,
                "truncating torn journal tail"
            );
            file.set_len(valid_end)?;
        }

        info!(
            path = %path.display(),
            records = table.len(),
            stale,
            "metadata journal opened"
        );

        Ok(Self {
            path,
            sync,
            writer: Mutex::new(JournalWriter {
                sink: Box::new(file),
                offset: valid_end,
                stale,
            }),
            table: RwLock::new(table),
        })
    }

    /// Path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of superseded entries a compaction would drop.
    pub fn stale_entries(&self) -> usize {
        self.writer.lock().expect("journal mutex poisoned").stale
    }

    /// Current journal size in bytes.
    pub fn journal_size(&self) -> u64 {
        self.writer.lock().expect("journal mutex poisoned").offset
    }

    /// Append one frame. On failure nothing of it survives in the journal.
    fn append(&self, w: &mut JournalWriter, payload: &[u8]) -> MetadataResult<()> {
        let frame = encode_frame(payload);
        let written = w
            .sink
            .write_all(&frame)
            .and_then(|()| w.sink.flush())
            .and_then(|()| match self.sync {
                JournalSync::EveryWrite => w.sink.sync(),
                JournalSync::OsDefault => Ok(()),
            });
        if let Err(e) = written {
            if let Err(te) = w.sink.truncate(w.offset) {
                warn!(
                    path = %self.path.display(),
                    offset = w.offset,
                    error = %te,
                    "failed to roll back partial journal entry"
                );
            }
            return Err(e.into());
        }
        w.offset += frame.len() as u64;
        Ok(())
    }
}

impl BlobMetadataStore for JournalMetadataStore {
    fn add(&self, mut attributes: BlobAttributes) -> MetadataResult<BlobId> {
        attributes.state = LifecycleState::Creating;
        let temporary = attributes.headers.is_temporary();

        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let id = {
            let table = self.table.read().expect("lock poisoned");
            let mut id = BlobId::generate(temporary);
            while table.contains(&id) {
                id = BlobId::generate(temporary);
            }
            id
        };
        self.append(&mut w, &put_payload(&id, &attributes))?;
        self.table
            .write()
            .expect("lock poisoned")
            .put(id.clone(), attributes);
        debug!(blob = %id, "metadata added");
        Ok(id)
    }

    fn add_with_id(&self, id: &BlobId, attributes: BlobAttributes) -> MetadataResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        if self.table.read().expect("lock poisoned").contains(id) {
            return Err(MetadataError::AlreadyExists(id.clone()));
        }
        self.append(&mut w, &put_payload(id, &attributes))?;
        self.table
            .write()
            .expect("lock poisoned")
            .put(id.clone(), attributes);
        Ok(())
    }

    fn update(&self, id: &BlobId, attributes: BlobAttributes) -> MetadataResult<()> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        if !self.table.read().expect("lock poisoned").contains(id) {
            return Err(MetadataError::NotFound(id.clone()));
        }
        let state = attributes.state;
        self.append(&mut w, &put_payload(id, &attributes))?;
        self.table
            .write()
            .expect("lock poisoned")
            .put(id.clone(), attributes);
        w.stale += 1;
        debug!(blob = %id, %state, "metadata updated");
        Ok(())
    }

    fn get(&self, id: &BlobId) -> MetadataResult<Option<BlobAttributes>> {
        Ok(self.table.read().expect("lock poisoned").get(id).cloned())
    }

    fn delete(&self, id: &BlobId) -> MetadataResult<bool> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        if !self.table.read().expect("lock poisoned").contains(id) {
            return Ok(false);
        }
        self.append(&mut w, &delete_payload(id))?;
        self.table.write().expect("lock poisoned").remove(id);
        w.stale += 2;
        debug!(blob = %id, "metadata deleted");
        Ok(true)
    }

    fn page_with_state(
        &self,
        state: LifecycleState,
        after: Option<&BlobId>,
        limit: usize,
    ) -> Vec<BlobId> {
        self.table
            .read()
            .expect("lock poisoned")
            .index()
            .page(state, after, limit)
    }

    fn find_with_state(&self, state: LifecycleState) -> StateIter<'_> {
        StateIter::new(self, state)
    }

    fn count_with_state(&self, state: LifecycleState) -> usize {
        self.table.read().expect("lock poisoned").index().count(state)
    }

    fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").len()
    }

    fn compact(&self) -> MetadataResult<CompactStats> {
        let mut w = self.writer.lock().expect("journal mutex poisoned");
        let table = self.table.read().expect("lock poisoned");

        let tmp = self.path.with_extension("journal.tmp");
        let mut written = 0u64;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for (id, attributes) in table.iter() {
                let frame = encode_frame(&put_payload(id, attributes));
                out.write_all(&frame)?;
                written += frame.len() as u64;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.sink = Box::new(file);
        w.offset = written;

        let stats = CompactStats {
            live: table.len(),
            reclaimed: std::mem::take(&mut w.stale),
        };
        info!(
            live = stats.live,
            reclaimed = stats.reclaimed,
            bytes = written,
            "metadata journal compacted"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for JournalMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalMetadataStore")
            .field("path", &self.path)
            .field("record_count", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn encode_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_u32_le(crc32fast::hash(payload));
    frame.put_slice(payload);
    frame.freeze()
}

fn put_payload(id: &BlobId, attributes: &BlobAttributes) -> Vec<u8> {
    let record = record::encode(attributes);
    let mut payload = Vec::with_capacity(3 + id.as_str().len() + record.len());
    payload.push(OP_PUT);
    payload.extend_from_slice(&(id.as_str().len() as u16).to_be_bytes());
    payload.extend_from_slice(id.as_str().as_bytes());
    payload.extend_from_slice(&record);
    payload
}

fn delete_payload(id: &BlobId) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3 + id.as_str().len());
    payload.push(OP_DELETE);
    payload.extend_from_slice(&(id.as_str().len() as u16).to_be_bytes());
    payload.extend_from_slice(id.as_str().as_bytes());
    payload
}

fn decode_payload(payload: &[u8]) -> MetadataResult<JournalOp> {
    if payload.len() < 3 {
        return Err(MetadataError::Corrupt("journal entry too short".into()));
    }
    let op = payload[0];
    let id_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    let rest = &payload[3..];
    if rest.len() < id_len {
        return Err(MetadataError::Corrupt("journal entry id truncated".into()));
    }
    let id = std::str::from_utf8(&rest[..id_len])
        .map_err(|e| MetadataError::Corrupt(format!("journal entry id: {e}")))?;
    let id = BlobId::parse(id)?;
    match op {
        OP_PUT => Ok(JournalOp::Put(id, record::decode(&rest[id_len..])?)),
        OP_DELETE => Ok(JournalOp::Delete(id)),
        other => Err(MetadataError::Corrupt(format!("unknown journal op {other}"))),
    }
}

/// Replay the journal front-to-back.
///
/// Returns the rebuilt table, the offset just past the last complete entry,
/// and the number of superseded entries.
fn replay(path: &Path) -> MetadataResult<(MetadataTable, u64, usize)> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut table = MetadataTable::new();
    let mut stale = 0usize;
    let mut offset = 0usize;

    while offset + HEADER_SIZE <= data.len() {
        let header = &data[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE + length > data.len() {
            warn!(offset, length, "invalid journal entry length; stopping replay");
            break;
        }

        let payload = &data[offset + HEADER_SIZE..offset + HEADER_SIZE + length];
        offset += HEADER_SIZE + length;

        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping journal entry"
            );
            stale += 1;
            continue;
        }

        match decode_payload(payload) {
            Ok(JournalOp::Put(id, attributes)) => {
                if table.put(id, attributes).is_some() {
                    stale += 1;
                }
            }
            Ok(JournalOp::Delete(id)) => {
                stale += if table.remove(&id).is_some() { 2 } else { 1 };
            }
            Err(e) => {
                warn!(offset, error = %e, "failed to decode journal entry; skipping");
                stale += 1;
            }
        }
    }

    debug!(records = table.len(), stale, "journal replay complete");
    Ok((table, offset as u64, stale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_types::{BlobMetrics, Headers, BLOB_NAME_HEADER};
    use std::io::{Seek, SeekFrom};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Writes at most `budget` bytes to the real journal, then fails.
    struct ShortFile {
        file: File,
        budget: Arc<AtomicU64>,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let budget = self.budget.load(Ordering::SeqCst) as usize;
            if budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(budget);
            let n = self.file.write(&buf[..n])?;
            self.budget.fetch_sub(n as u64, Ordering::SeqCst);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl JournalSink for ShortFile {
        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_data()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.file.set_len(len)
        }
    }

    fn attrs(name: &str) -> BlobAttributes {
        BlobAttributes::new(
            Headers::new().with(BLOB_NAME_HEADER, name),
            BlobMetrics::new(1, Some("abc".into()), 3),
        )
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let store = JournalMetadataStore::open(dir.path(), JournalSync::EveryWrite).unwrap();
            let a = store.add(attrs("a")).unwrap();
            let b = store.add(attrs("b")).unwrap();
            store
                .update(&a, attrs("a").with_state(LifecycleState::Alive))
                .unwrap();
            assert!(store.delete(&b).unwrap());
            (a, b)
        };

        let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap().unwrap().state, LifecycleState::Alive);
        assert!(store.get(&b).unwrap().is_none());
        let alive: Vec<_> = store.find_with_state(LifecycleState::Alive).collect();
        assert_eq!(alive, vec![a]);
        assert_eq!(store.stale_entries(), 3);
    }

    #[test]
    fn compact_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
        let keep = store.add(attrs("keep")).unwrap();
        for i in 0..10 {
            let id = store.add(attrs(&format!("tmp{i}"))).unwrap();
            store.delete(&id).unwrap();
        }
        let before = store.journal_size();

        let stats = store.compact().unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.reclaimed, 20);
        assert!(store.journal_size() < before);
        assert_eq!(store.stale_entries(), 0);

        // Writes after compaction land in the rewritten journal.
        store
            .update(&keep, attrs("keep").with_state(LifecycleState::Alive))
            .unwrap();
        drop(store);

        let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&keep).unwrap().unwrap().is_alive());
        assert!(!dir.path().join("metadata.journal.tmp").exists());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let a = {
            let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
            store.add(attrs("a")).unwrap()
        };

        // Simulate a crash mid-append: a header promising more bytes than exist.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(JOURNAL_FILE_NAME))
                .unwrap();
            file.write_all(&500u32.to_le_bytes()).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let b = {
            let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
            assert_eq!(store.len(), 1);
            store.add(attrs("b")).unwrap()
        };

        let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
        assert!(store.get(&a).unwrap().is_some());
        assert!(store.get(&b).unwrap().is_some());
    }

    #[test]
    fn crc_mismatch_skips_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
            (store.add(attrs("a")).unwrap(), store.add(attrs("b")).unwrap())
        };

        // Flip the first payload byte of the first entry.
        {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(dir.path().join(JOURNAL_FILE_NAME))
                .unwrap();
            file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            let mut buf = [0u8; 1];
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xFF;
            file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            file.write_all(&buf).unwrap();
        }

        let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
        assert!(store.get(&a).unwrap().is_none());
        assert!(store.get(&b).unwrap().is_some());
    }

    #[test]
    fn failed_append_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let (a, b) = {
            let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
            let a = store.add(attrs("a")).unwrap();
            let good_end = store.journal_size();

            let budget = Arc::new(AtomicU64::new(5));
            let file = OpenOptions::new().append(true).open(&path).unwrap();
            store.writer.lock().unwrap().sink = Box::new(ShortFile {
                file,
                budget: Arc::clone(&budget),
            });

            let err = store.update(&a, attrs("a").with_state(LifecycleState::MarkedForDeletion));
            assert!(matches!(err, Err(MetadataError::Io(_))));
            assert_eq!(store.get(&a).unwrap().unwrap().state, LifecycleState::Creating);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_end);

            // The next append succeeds without dragging the failed frame along.
            budget.store(u64::MAX, Ordering::SeqCst);
            let b = store.add(attrs("b")).unwrap();
            (a, b)
        };

        let store = JournalMetadataStore::open(dir.path(), JournalSync::OsDefault).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a).unwrap().unwrap().state, LifecycleState::Creating);
        assert!(store.get(&b).unwrap().is_some());
        assert_eq!(store.stale_entries(), 0);
    }
}
