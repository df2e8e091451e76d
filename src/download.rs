use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::peer::Peer;
use crate::peer::message::MessageId;
use crate::peer::session::PeerSession;
use crate::torrent::Torrent;

/// Largest number of bytes a single block request may ask for.
pub const MAX_BLOCK_SIZE: usize = 16384;

/// Cap on sent-but-unanswered requests per peer. This is the engine's
/// backpressure: it bounds in-flight data per session no matter how fast
/// the link is.
pub const MAX_BACKLOG: usize = 5;

const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// One piece the swarm still owes us. Claimed from the work queue by
/// exactly one worker at a time; returned on any failure.
#[derive(Debug, Clone)]
struct PieceWork {
    index: usize,
    hash: [u8; 20],
    length: usize,
    attempts: usize,
}

/// A verified piece on its way back to the orchestrator.
#[derive(Debug)]
struct PieceResult {
    index: usize,
    buf: Vec<u8>,
}

/// Per-attempt state while assembling one piece over one session.
struct PieceProgress {
    buf: Vec<u8>,
    downloaded: usize,
    requested: usize,
    backlog: usize,
}

struct SwarmShared {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    num_pieces: usize,
    max_piece_attempts: Option<usize>,
    work_tx: mpsc::Sender<PieceWork>,
    work_rx: Mutex<mpsc::Receiver<PieceWork>>,
    active_workers: AtomicUsize,
}

/// Decrements the worker count when the worker exits, however it exits.
struct ActiveGuard(Arc<SwarmShared>);

impl ActiveGuard {
    fn new(shared: Arc<SwarmShared>) -> Self {
        shared.active_workers.fetch_add(1, Ordering::Relaxed);
        Self(shared)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Concurrent piece-download engine: one worker per peer pulling from a
/// shared pool of piece work, verified results reassembled into a single
/// buffer in piece order.
pub struct Downloader {
    torrent: Torrent,
    peers: Vec<Peer>,
    peer_id: [u8; 20],
    max_piece_attempts: Option<usize>,
}

impl Downloader {
    pub fn new(torrent: Torrent, peers: Vec<Peer>, peer_id: [u8; 20]) -> Self {
        Self {
            torrent,
            peers,
            peer_id,
            max_piece_attempts: None,
        }
    }

    /// Caps download attempts per piece. Without a cap a piece no peer
    /// can supply is retried for as long as any worker stays alive.
    pub fn with_max_piece_attempts(mut self, cap: usize) -> Self {
        self.max_piece_attempts = Some(cap);
        self
    }

    /// Runs the download to completion and returns the fully verified
    /// content buffer.
    pub async fn run(self) -> Result<Vec<u8>, Error> {
        if self.peers.is_empty() {
            return Err(Error::OutOfPeers);
        }

        let num_pieces = self.torrent.num_pieces();
        let (work_tx, work_rx) = mpsc::channel(num_pieces.max(1));
        let (result_tx, mut result_rx) = mpsc::channel(self.peers.len());

        for (index, hash) in self.torrent.piece_hashes.iter().enumerate() {
            let work = PieceWork {
                index,
                hash: *hash,
                length: self.torrent.piece_size(index),
                attempts: 0,
            };
            work_tx.send(work).await.map_err(|_| Error::OutOfPeers)?;
        }

        let shared = Arc::new(SwarmShared {
            info_hash: self.torrent.info_hash,
            peer_id: self.peer_id,
            num_pieces,
            max_piece_attempts: self.max_piece_attempts,
            work_tx,
            work_rx: Mutex::new(work_rx),
            active_workers: AtomicUsize::new(0),
        });

        let workers: Vec<_> = self
            .peers
            .iter()
            .map(|peer| tokio::spawn(worker(*peer, Arc::clone(&shared), result_tx.clone())))
            .collect();
        drop(result_tx);

        let mut buf = vec![0u8; self.torrent.length];
        let mut received = vec![false; num_pieces];
        let mut done = 0usize;
        while done < num_pieces {
            match result_rx.recv().await {
                Some(Ok(result)) => {
                    let (begin, end) = self.torrent.piece_bounds(result.index);
                    buf[begin..end].copy_from_slice(&result.buf);
                    if !received[result.index] {
                        received[result.index] = true;
                        done += 1;
                    }
                    let percent = done as f64 / num_pieces as f64 * 100.0;
                    let active = shared.active_workers.load(Ordering::Relaxed);
                    info!(
                        piece = result.index,
                        active_peers = active,
                        "({percent:.2}%) piece verified"
                    );
                }
                Some(Err(err)) => {
                    for handle in &workers {
                        handle.abort();
                    }
                    return Err(err);
                }
                // every worker has exited with pieces still missing
                None => return Err(Error::OutOfPeers),
            }
        }

        // All pieces verified: tear the swarm down instead of letting
        // lingering reads drain on their own timeouts.
        for handle in &workers {
            handle.abort();
        }
        Ok(buf)
    }
}

async fn worker(
    peer: Peer,
    shared: Arc<SwarmShared>,
    results: mpsc::Sender<Result<PieceResult, Error>>,
) {
    let mut session =
        match PeerSession::connect(peer, shared.info_hash, shared.peer_id, shared.num_pieces).await
        {
            Ok(session) => session,
            Err(err) => {
                debug!(%peer, %err, "could not establish session");
                return;
            }
        };
    let _active = ActiveGuard::new(Arc::clone(&shared));

    if session.send_unchoke().await.is_err() {
        return;
    }
    if session.send_interested().await.is_err() {
        return;
    }

    loop {
        let work = {
            let mut queue = shared.work_rx.lock().await;
            match queue.recv().await {
                Some(work) => work,
                None => return,
            }
        };

        if !session.availability.has_piece(work.index) {
            // Hand it back unchanged for a peer that has it and move on.
            if shared.work_tx.send(work).await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
            continue;
        }

        match attempt_download(&mut session, &work).await {
            Ok(buf) => {
                if let Err(err) = check_integrity(&work, &buf) {
                    warn!(%peer, piece = work.index, %err, "integrity check failed");
                    if !requeue(&shared, &results, work).await {
                        return;
                    }
                    continue;
                }
                let _ = session.send_have(work.index).await;
                let index = work.index;
                if results.send(Ok(PieceResult { index, buf })).await.is_err() {
                    // orchestrator is done with us
                    return;
                }
            }
            Err(err) => {
                debug!(%peer, piece = work.index, %err, "piece attempt failed");
                let stalled = matches!(err, Error::StalledTransfer);
                if !requeue(&shared, &results, work).await {
                    return;
                }
                // A stall leaves the connection usable; anything else
                // means the session is gone and so is this worker.
                if !stalled {
                    return;
                }
            }
        }
    }
}

/// Returns the failed item to the queue, honoring the per-piece retry
/// budget. `false` means the worker should stop.
async fn requeue(
    shared: &SwarmShared,
    results: &mpsc::Sender<Result<PieceResult, Error>>,
    mut work: PieceWork,
) -> bool {
    work.attempts += 1;
    if let Some(cap) = shared.max_piece_attempts {
        if work.attempts >= cap {
            let _ = results
                .send(Err(Error::PieceAttemptsExhausted(work.index)))
                .await;
            return false;
        }
    }
    shared.work_tx.send(work).await.is_ok()
}

/// Drives the block-request pipeline for one piece over one session
/// until every byte has arrived or the attempt fails.
async fn attempt_download(session: &mut PeerSession, work: &PieceWork) -> Result<Vec<u8>, Error> {
    let mut progress = PieceProgress {
        buf: vec![0u8; work.length],
        downloaded: 0,
        requested: 0,
        backlog: 0,
    };

    while progress.downloaded < work.length {
        if !session.choked {
            while progress.backlog < MAX_BACKLOG && progress.requested < work.length {
                let block = MAX_BLOCK_SIZE.min(work.length - progress.requested);
                session
                    .send_request(work.index, progress.requested, block)
                    .await?;
                progress.backlog += 1;
                progress.requested += block;
            }
        }

        // Inactivity deadline: it rearms after every message.
        let msg = timeout(STALL_TIMEOUT, session.read_message())
            .await
            .map_err(|_| Error::StalledTransfer)??;

        if let Some(msg) = msg {
            if msg.id == MessageId::Piece {
                let n = msg.parse_piece(work.index, &mut progress.buf)?;
                progress.downloaded += n;
                progress.backlog = progress.backlog.saturating_sub(1);
            }
        }
    }

    Ok(progress.buf)
}

fn check_integrity(work: &PieceWork, buf: &[u8]) -> Result<(), Error> {
    let digest: [u8; 20] = Sha1::digest(buf).into();
    if digest != work.hash {
        return Err(Error::IntegrityFailure(work.index));
    }
    Ok(())
}
