//! File transfer engine: streaming (kind 2) and chunked (kind 1) strategies,
//! both directions.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use beam_core::chunk::{
    self, ChunkError, ChunkHeader, ChunkReceiveResult, TransferState, DEFAULT_CHUNK_SIZE,
    MAX_CHUNKS,
};
use beam_core::integrity;
use beam_core::progress::ProgressTracker;
use beam_core::scheduler::{RetryPolicy, Timer};
use beam_core::{Envelope, Frame, FrameEncodeError, StreamHeader};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, Link, PeerConnection, STREAM_BUF_SIZE};
use crate::events::OutputResolver;

/// `<path>.part`, where a chunked file is assembled before the final rename.
pub fn part_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

/// Hex SHA-256 of a file, hashed off the async threads.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || integrity::hash_reader(std::fs::File::open(path)?))
        .await
        .map_err(io::Error::other)?
}

// --- receiving ---

/// Result of one incoming chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Duplicate,
    InProgress { progress: Option<u8> },
    Complete { path: PathBuf, progress: Option<u8> },
}

struct IncomingFile {
    state: TransferState,
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
}

impl IncomingFile {
    async fn write(
        &mut self,
        header: &ChunkHeader,
        data: &[u8],
    ) -> Result<ChunkReceiveResult, TransferError> {
        let Some(offset) = self.state.begin(header, data.len())? else {
            return Ok(ChunkReceiveResult::Duplicate);
        };
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(self.state.commit(header.index))
    }

    async fn finish(&mut self) -> Result<PathBuf, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        Ok(self.final_path.clone())
    }
}

/// Map entry for a file being assembled; `total` is what its first chunk announced.
struct ActiveFile {
    total: u32,
    file: Arc<Mutex<IncomingFile>>,
}

/// Reassembles chunked files. One entry per file name, each behind its own
/// lock so different files never wait on each other.
pub struct ChunkReceiver {
    resolver: Arc<dyn OutputResolver>,
    active: Mutex<HashMap<String, ActiveFile>>,
}

impl ChunkReceiver {
    pub fn new(resolver: Arc<dyn OutputResolver>) -> Self {
        Self {
            resolver,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Decode and store one chunk payload. On error the transfer is abandoned
    /// and its `.part` file left in place.
    pub async fn receive(
        &self,
        payload: &[u8],
    ) -> Result<(ChunkHeader, ChunkOutcome), TransferError> {
        let (header, data) = chunk::decode_chunk(payload)?;
        let entry = self.entry_for(&header).await?;
        let mut incoming = entry.lock().await;
        let outcome = match incoming.write(&header, data).await {
            Ok(ChunkReceiveResult::Duplicate) => {
                debug!(file = %header.name, index = header.index, "duplicate chunk");
                ChunkOutcome::Duplicate
            }
            Ok(ChunkReceiveResult::InProgress { progress }) => ChunkOutcome::InProgress { progress },
            Ok(ChunkReceiveResult::Complete { progress }) => {
                self.forget(&header.name, &entry).await;
                let path = incoming.finish().await?;
                ChunkOutcome::Complete { path, progress }
            }
            Err(e) => {
                self.forget(&header.name, &entry).await;
                return Err(e);
            }
        };
        Ok((header, outcome))
    }

    /// Number of files currently being assembled.
    #[cfg(test)]
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// The transfer `header` belongs to. A chunk announcing a different total
    /// than the entry on file means the sender started over (an earlier
    /// attempt was abandoned), so the old state is dropped and `.part` truncated.
    async fn entry_for(
        &self,
        header: &ChunkHeader,
    ) -> Result<Arc<Mutex<IncomingFile>>, TransferError> {
        let mut active = self.active.lock().await;
        match active.get(&header.name) {
            Some(entry) if entry.total == header.total => return Ok(entry.file.clone()),
            Some(entry) => {
                info!(
                    file = %header.name,
                    old_total = entry.total,
                    new_total = header.total,
                    "chunk total changed, restarting transfer"
                );
            }
            None => {}
        }
        let state = TransferState::new(header.name.clone(), header.total, DEFAULT_CHUNK_SIZE)?;
        let final_path = self.resolver.resolve_output(&header.name)?;
        let part_path = part_path(&final_path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&part_path)
            .await?;
        info!(file = %header.name, chunks = header.total, path = %part_path.display(), "chunked transfer started");
        let entry = Arc::new(Mutex::new(IncomingFile {
            state,
            file,
            part_path,
            final_path,
        }));
        active.insert(
            header.name.clone(),
            ActiveFile {
                total: header.total,
                file: entry.clone(),
            },
        );
        Ok(entry)
    }

    /// Drop `name` from the active map if it still refers to `entry`.
    async fn forget(&self, name: &str, entry: &Arc<Mutex<IncomingFile>>) {
        let mut active = self.active.lock().await;
        if active.get(name).is_some_and(|e| Arc::ptr_eq(&e.file, entry)) {
            active.remove(name);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Complete(PathBuf),
    /// The sender stopped after `received` bytes.
    Truncated { received: u64 },
}

/// Copy a stream body to the destination resolved for `header.name`,
/// reporting whole-percent progress.
pub async fn receive_stream<F>(
    resolver: &dyn OutputResolver,
    header: &StreamHeader,
    body: &mut (dyn AsyncRead + Unpin + Send),
    mut progress: F,
) -> Result<StreamOutcome, TransferError>
where
    F: FnMut(u8),
{
    let path = resolver.resolve_output(&header.name)?;
    let mut file = File::create(&path).await?;
    let mut tracker = ProgressTracker::new();
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    let mut received = 0u64;
    if let Some(p) = tracker.update(0, header.size) {
        progress(p);
    }
    while received < header.size {
        let want = (header.size - received).min(buf.len() as u64) as usize;
        let n = body.read(&mut buf[..want]).await?;
        if n == 0 {
            file.flush().await?;
            return Ok(StreamOutcome::Truncated { received });
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
        if let Some(p) = tracker.update(received, header.size) {
            progress(p);
        }
    }
    file.flush().await?;
    Ok(StreamOutcome::Complete(path))
}

// --- sending ---

/// Stream one file to one connection. `progress` gets the running byte count.
pub async fn send_stream_file<F>(
    conn: &PeerConnection,
    path: &Path,
    name: &str,
    progress: F,
) -> Result<u64, TransferError>
where
    F: FnMut(u64) + Send,
{
    let file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let sent = conn
        .send_stream(&StreamHeader::new(name, size), file, progress)
        .await?;
    Ok(sent)
}

/// Write `frame` through `link`, retrying per `policy`.
pub async fn send_with_retry(
    link: &dyn Link,
    timer: &dyn Timer,
    frame: &Frame,
    policy: RetryPolicy,
) -> Result<usize, ConnectionError> {
    let mut failed = 0u32;
    loop {
        match link.send_frame(frame).await {
            Ok(n) => return Ok(n),
            Err(e) => {
                failed += 1;
                let Some(delay) = policy.next_delay(failed) else {
                    return Err(e);
                };
                debug!(attempt = failed, error = %e, "send failed, retrying");
                timer.sleep(delay).await;
            }
        }
    }
}

/// Send a file as independently addressed chunks, preceded by its digest.
/// Each chunk gets a bounded number of attempts; one exhausted chunk fails
/// the whole transfer. Returns the number of chunks sent.
pub async fn send_chunked_file<F>(
    link: &dyn Link,
    timer: &dyn Timer,
    path: &Path,
    name: &str,
    mut progress: F,
) -> Result<u32, TransferError>
where
    F: FnMut(u8) + Send,
{
    let policy = RetryPolicy::for_chunk();
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let ranges = chunk::split_into_chunks(size, DEFAULT_CHUNK_SIZE);
    let total = u32::try_from(ranges.len())
        .ok()
        .filter(|&n| n <= MAX_CHUNKS)
        .ok_or(ChunkError::TooManyChunks)?;
    let sha256 = hash_file(path).await?;
    let digest = Envelope::FileDigest {
        name: name.to_string(),
        sha256,
    }
    .to_frame()?;
    send_with_retry(link, timer, &digest, policy).await?;

    let mut tracker = ProgressTracker::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE as usize];
    for range in &ranges {
        let data = &mut buf[..range.len() as usize];
        file.read_exact(data).await?;
        let payload = chunk::encode_chunk(
            &ChunkHeader {
                index: range.index,
                total,
                name: name.to_string(),
            },
            data,
        )?;
        if let Err(e) = send_with_retry(link, timer, &Frame::Chunk(payload), policy).await {
            warn!(file = name, index = range.index, error = %e, "chunk failed, abandoning transfer");
            return Err(TransferError::ChunkRetriesExhausted { index: range.index });
        }
        if let Some(p) = tracker.update(u64::from(range.index) + 1, u64::from(total)) {
            progress(p);
        }
    }
    Ok(total)
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("chunk {index} could not be sent")]
    ChunkRetriesExhausted { index: u32 },
    #[error("not connected")]
    NotConnected,
    #[error("invalid file name {0:?}")]
    InvalidName(String),
}


#[cfg(test)]
mod tests {
    use super::test_link::RecordingLink;
    use super::*;
    use crate::events::DownloadDir;
    use crate::session::TokioTimer;
    use beam_core::chunk::decode_chunk;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::Ordering;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn chunk_payloads(name: &str, data: &[u8]) -> Vec<Vec<u8>> {
        let ranges = chunk::split_into_chunks(data.len() as u64, DEFAULT_CHUNK_SIZE);
        let total = ranges.len() as u32;
        ranges
            .iter()
            .map(|r| {
                chunk::encode_chunk(
                    &ChunkHeader {
                        index: r.index,
                        total,
                        name: name.into(),
                    },
                    &data[r.start as usize..r.end as usize],
                )
                .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn shuffled_chunks_reassemble_with_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(Arc::new(DownloadDir::new(dir.path())));
        let data = random_bytes(DEFAULT_CHUNK_SIZE as usize * 4 + 1234, 1);
        let mut payloads = chunk_payloads("photo.jpg", &data);
        assert_eq!(payloads.len(), 5);
        // Every chunk twice, in random order.
        payloads.extend(payloads.clone());
        payloads.shuffle(&mut StdRng::seed_from_u64(9));

        let mut completes = Vec::new();
        let mut hundreds = 0;
        let mut duplicates = 0;
        for p in &payloads {
            let (_, outcome) = receiver.receive(p).await.unwrap();
            match outcome {
                ChunkOutcome::Complete { path, progress } => {
                    hundreds += usize::from(progress == Some(100));
                    completes.push(path);
                }
                ChunkOutcome::InProgress { progress } => {
                    hundreds += usize::from(progress == Some(100));
                }
                ChunkOutcome::Duplicate => duplicates += 1,
            }
            if !completes.is_empty() {
                break;
            }
        }
        assert_eq!(completes.len(), 1);
        assert_eq!(hundreds, 1);
        assert!(duplicates <= 4);
        let final_path = dir.path().join("photo.jpg");
        assert_eq!(completes[0], final_path);
        assert_eq!(std::fs::read(&final_path).unwrap(), data);
        assert!(!part_path(&final_path).exists());
        assert_eq!(receiver.active_count().await, 0);
    }

    #[tokio::test]
    async fn completion_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old contents, longer").unwrap();
        let receiver = ChunkReceiver::new(Arc::new(DownloadDir::new(dir.path())));
        for p in chunk_payloads("a.txt", b"new") {
            receiver.receive(&p).await.unwrap();
        }
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn empty_file_is_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(Arc::new(DownloadDir::new(dir.path())));
        let payloads = chunk_payloads("empty", b"");
        assert_eq!(payloads.len(), 1);
        let (header, outcome) = receiver.receive(&payloads[0]).await.unwrap();
        assert_eq!((header.index, header.total), (0, 1));
        assert_eq!(
            outcome,
            ChunkOutcome::Complete {
                path: dir.path().join("empty"),
                progress: Some(100)
            }
        );
        assert_eq!(std::fs::metadata(dir.path().join("empty")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn bad_chunk_abandons_transfer_and_keeps_part() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(Arc::new(DownloadDir::new(dir.path())));
        let first = chunk::encode_chunk(
            &ChunkHeader {
                index: 0,
                total: 3,
                name: "x.bin".into(),
            },
            b"abc",
        )
        .unwrap();
        receiver.receive(&first).await.unwrap();
        let out_of_range = chunk::encode_chunk(
            &ChunkHeader {
                index: 7,
                total: 3,
                name: "x.bin".into(),
            },
            b"abc",
        )
        .unwrap();
        assert!(matches!(
            receiver.receive(&out_of_range).await,
            Err(TransferError::Chunk(ChunkError::IndexOutOfRange { .. }))
        ));
        assert_eq!(receiver.active_count().await, 0);
        assert!(part_path(&dir.path().join("x.bin")).exists());
    }

    #[tokio::test]
    async fn abandoned_transfer_restarts_with_new_total() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(Arc::new(DownloadDir::new(dir.path())));
        // First attempt: one chunk of three, then the sender gives up.
        let stale = chunk::encode_chunk(
            &ChunkHeader {
                index: 0,
                total: 3,
                name: "a.bin".into(),
            },
            &random_bytes(DEFAULT_CHUNK_SIZE as usize, 3),
        )
        .unwrap();
        receiver.receive(&stale).await.unwrap();
        assert_eq!(receiver.active_count().await, 1);

        // The file changed and is resent whole with a different total.
        let data = random_bytes(DEFAULT_CHUNK_SIZE as usize + 10, 4);
        let payloads = chunk_payloads("a.bin", &data);
        assert_eq!(payloads.len(), 2);
        let mut last = None;
        for p in &payloads {
            last = Some(receiver.receive(p).await.unwrap().1);
        }
        assert_eq!(
            last,
            Some(ChunkOutcome::Complete {
                path: dir.path().join("a.bin"),
                progress: Some(100)
            })
        );
        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), data);
        assert_eq!(receiver.active_count().await, 0);
    }

    #[tokio::test]
    async fn oversized_total_is_refused_without_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = ChunkReceiver::new(Arc::new(DownloadDir::new(dir.path())));
        let huge = chunk::encode_chunk(
            &ChunkHeader {
                index: 0,
                total: i32::MAX as u32,
                name: "huge.bin".into(),
            },
            b"x",
        )
        .unwrap();
        assert!(matches!(
            receiver.receive(&huge).await,
            Err(TransferError::Chunk(ChunkError::TooManyChunks))
        ));
        assert_eq!(receiver.active_count().await, 0);
        assert!(!part_path(&dir.path().join("huge.bin")).exists());
    }

    #[tokio::test]
    async fn stream_exact_size_completes() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DownloadDir::new(dir.path());
        let data = random_bytes(STREAM_BUF_SIZE * 3 + 5, 2);
        let header = StreamHeader::new("clip.mp4", data.len() as u64);
        let mut body = &data[..];
        let mut reports = Vec::new();
        let outcome = receive_stream(&resolver, &header, &mut body, |p| reports.push(p))
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Complete(dir.path().join("clip.mp4")));
        assert_eq!(std::fs::read(dir.path().join("clip.mp4")).unwrap(), data);
        assert_eq!(reports.first(), Some(&0));
        assert_eq!(reports.iter().filter(|p| **p == 100).count(), 1);
        assert!(reports.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn stream_cut_short_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DownloadDir::new(dir.path());
        let header = StreamHeader::new("cut.bin", 100);
        let data = [1u8; 40];
        let mut body = &data[..];
        let mut reports = Vec::new();
        let outcome = receive_stream(&resolver, &header, &mut body, |p| reports.push(p))
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Truncated { received: 40 });
        assert!(!reports.contains(&100));
    }

    #[tokio::test]
    async fn empty_stream_reports_hundred_once() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DownloadDir::new(dir.path());
        let header = StreamHeader::new("none", 0);
        let mut body: &[u8] = &[];
        let mut reports = Vec::new();
        let outcome = receive_stream(&resolver, &header, &mut body, |p| reports.push(p))
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Complete(dir.path().join("none")));
        assert_eq!(reports, vec![100]);
    }

    #[tokio::test]
    async fn chunked_send_announces_digest_then_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let data = random_bytes(DEFAULT_CHUNK_SIZE as usize * 2 + 7, 3);
        std::fs::write(&src, &data).unwrap();

        let link = RecordingLink::connected();
        let mut reports = Vec::new();
        let total = send_chunked_file(&link, &TokioTimer, &src, "src.bin", |p| reports.push(p))
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(reports, vec![33, 66, 100]);

        let frames = link.frames();
        assert_eq!(frames.len(), 4);
        let Frame::Control(json) = &frames[0] else {
            panic!("expected digest first");
        };
        assert_eq!(
            Envelope::from_json(json).unwrap(),
            Envelope::FileDigest {
                name: "src.bin".into(),
                sha256: integrity::hash_bytes(&data)
            }
        );
        let mut rebuilt = Vec::new();
        for (i, f) in frames[1..].iter().enumerate() {
            let Frame::Chunk(payload) = f else {
                panic!("expected chunk");
            };
            let (h, bytes) = decode_chunk(payload).unwrap();
            assert_eq!((h.index, h.total), (i as u32, 3));
            rebuilt.extend_from_slice(bytes);
        }
        assert_eq!(rebuilt, data);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_send_fails_after_bounded_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"payload").unwrap();

        let link = RecordingLink::default();
        let started = tokio::time::Instant::now();
        let res = send_chunked_file(&link, &TokioTimer, &src, "src.bin", |_| {}).await;
        assert!(matches!(
            res,
            Err(TransferError::Connection(ConnectionError::NotConnected))
        ));
        // Digest frame: 5 attempts, 4 pauses of 200 ms.
        assert_eq!(link.attempts.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= std::time::Duration::from_millis(800));
    }

    #[tokio::test]
    async fn stream_file_to_connection() {
        let (a, b) = crate::connection::tests::socket_pair().await;
        let (conn, _r) = PeerConnection::new(a, crate::connection::ConnState::Active).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("s.txt");
        std::fs::write(&src, b"hello stream").unwrap();

        let mut b = b;
        let (sent, received) = tokio::join!(
            send_stream_file(&conn, &src, "s.txt", |_| {}),
            async {
                let mut buf = vec![0u8; 5 + 4 + 5 + 8 + 12];
                b.read_exact(&mut buf).await.unwrap();
                buf
            }
        );
        assert_eq!(sent.unwrap(), 12);
        assert_eq!(&received[5..9], &5i32.to_be_bytes());
        assert_eq!(&received[9..14], b"s.txt");
        assert_eq!(&received[22..], b"hello stream");
    }
}
