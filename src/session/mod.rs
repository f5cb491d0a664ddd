//! A download session: peer roster, per-peer fetch loops and the shared
//! piece scheduler.

pub mod scheduler;
pub mod stats;

use std::{
    collections::HashSet,
    net::SocketAddr,
    path::Path,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    peer::{PeerConnection, PeerParams},
    storage::{PieceWriter, StorageError},
    torrent::{Manifest, ManifestError},
    tracker::Discovery,
};
pub use scheduler::{Assignment, PieceOutcome, PieceScheduler};

/// Rediscover once the roster falls below this share of the last baseline.
const CHURN_THRESHOLD: f64 = 0.7;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Started,
    Paused,
    Downloaded,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Fraction of pieces verified, `0.0..=1.0`
    pub progress: f64,
    pub peers: usize,
    /// Bytes per second since the previous status call
    pub throughput: f64,
}

#[derive(Debug, Default)]
struct Roster {
    peers: HashSet<SocketAddr>,
    blacklist: HashSet<SocketAddr>,
    baseline: usize,
}

struct SessionInner {
    manifest: Arc<Manifest>,
    scheduler: PieceScheduler,
    discovery: Arc<dyn Discovery>,
    peer_params: PeerParams,
    retry_backoff: Duration,
    discovery_retry: Duration,
    roster: Mutex<Roster>,
    state: watch::Sender<SessionState>,
    /// Bumped on every start, pause and completion so fetch loops and
    /// discovery rounds from an earlier run can tell they are stale.
    epoch: AtomicU64,
    discovering: AtomicBool,
    /// Start of the latest discovery round; churn-driven rounds are spaced
    /// at least `discovery_retry` apart.
    last_round: Mutex<Option<Instant>>,
    refresh_scheduled: AtomicBool,
}

/// Handle to a download. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Allocates storage and builds the piece table. A session whose pieces
    /// are all on disk already starts out `Downloaded`.
    pub fn open(
        manifest: Manifest,
        config: &ClientConfig,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self, SessionError> {
        let manifest = Arc::new(manifest);
        let writer = PieceWriter::open(&manifest, &config.download_dir, &config.checkpoint_dir)?;
        let scheduler = PieceScheduler::new(Arc::clone(&manifest), writer)?;

        let initial = if scheduler.is_complete() {
            SessionState::Downloaded
        } else {
            SessionState::NotStarted
        };
        info!(
            name = manifest.name(),
            info_hash = %manifest.info_hash_hex(),
            pieces = manifest.piece_count(),
            pending = scheduler.pending_pieces(),
            "session opened"
        );

        let peer_params = PeerParams {
            info_hash: *manifest.info_hash(),
            peer_id: config.peer_id,
            piece_count: manifest.piece_count(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        };
        let (state, _) = watch::channel(initial);

        Ok(Session {
            inner: Arc::new(SessionInner {
                manifest,
                scheduler,
                discovery,
                peer_params,
                retry_backoff: config.retry_backoff,
                discovery_retry: config.discovery_retry,
                roster: Mutex::new(Roster::default()),
                state,
                epoch: AtomicU64::new(0),
                discovering: AtomicBool::new(false),
                last_round: Mutex::new(None),
                refresh_scheduled: AtomicBool::new(false),
            }),
        })
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        config: &ClientConfig,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Self, SessionError> {
        Self::open(Manifest::from_file(path)?, config, discovery)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// Begins (or resumes) downloading with a discovery round. Must be
    /// called from within a Tokio runtime.
    pub fn start(&self) {
        let started = self.inner.state.send_if_modified(|state| match state {
            SessionState::NotStarted | SessionState::Paused => {
                *state = SessionState::Started;
                true
            }
            _ => false,
        });
        if started {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            info!("session started");
            spawn_refresh(Arc::clone(&self.inner));
        }
    }

    /// Stops every fetch loop. Blocks in flight go back to the table; the
    /// table itself is kept.
    pub fn pause(&self) {
        let paused = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Started {
                *state = SessionState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.roster.lock().peers.clear();
            info!("session paused");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            progress: self.inner.scheduler.progress(),
            peers: self.inner.roster.lock().peers.len(),
            throughput: self.inner.scheduler.throughput(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub async fn wait_until_downloaded(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Downloaded).await;
    }

    /// Endpoints that will never be dialled again in this session.
    pub fn blacklisted(&self) -> Vec<SocketAddr> {
        self.inner.roster.lock().blacklist.iter().copied().collect()
    }
}

fn spawn_refresh(inner: Arc<SessionInner>) {
    tokio::spawn(async move { inner.refresh_peers().await });
}

impl SessionInner {
    fn is_current(&self, epoch: u64) -> bool {
        *self.state.borrow() == SessionState::Started && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// One discovery round: ask for endpoints, connect to the new ones in
    /// parallel, record the baseline and start their fetch loops. Only one
    /// round runs at a time.
    async fn refresh_peers(self: Arc<Self>) {
        if self.discovering.swap(true, Ordering::SeqCst) {
            debug!("discovery already running");
            return;
        }

        let roster_size = loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            *self.last_round.lock() = Some(Instant::now());
            let endpoints = self.discovery.discover(&self.manifest).await;

            let candidates: Vec<SocketAddr> = {
                let roster = self.roster.lock();
                let mut seen = HashSet::new();
                endpoints
                    .into_iter()
                    .filter(|addr| {
                        !roster.peers.contains(addr)
                            && !roster.blacklist.contains(addr)
                            && seen.insert(*addr)
                    })
                    .collect()
            };
            debug!(count = candidates.len(), "connecting to discovered peers");

            let mut connects = JoinSet::new();
            for addr in candidates {
                let params = self.peer_params.clone();
                connects.spawn(async move { (addr, PeerConnection::connect(addr, &params).await) });
            }

            let mut fresh = Vec::new();
            let mut refused = Vec::new();
            while let Some(joined) = connects.join_next().await {
                match joined {
                    Ok((_, Ok(conn))) => fresh.push(conn),
                    Ok((addr, Err(e))) => {
                        debug!(%addr, error = %e, "connection failed");
                        if e.is_protocol_violation() {
                            refused.push(addr);
                        }
                    }
                    Err(e) => warn!(error = %e, "connect task failed"),
                }
            }

            if *self.state.borrow() != SessionState::Started {
                self.discovering.store(false, Ordering::SeqCst);
                return;
            }
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // Restarted while connecting; the new run needs its own round.
                continue;
            }

            let size = {
                let mut roster = self.roster.lock();
                roster.blacklist.extend(refused);
                roster.peers.extend(fresh.iter().map(PeerConnection::addr));
                roster.baseline = roster.peers.len().max(1);
                roster.peers.len()
            };
            for conn in fresh {
                tokio::spawn(run_peer(Arc::downgrade(&self), conn, epoch));
            }
            break size;
        };
        self.discovering.store(false, Ordering::SeqCst);
        info!(peers = roster_size, "discovery round finished");

        if roster_size == 0 {
            let weak = Arc::downgrade(&self);
            let delay = self.discovery_retry;
            let epoch = self.epoch.load(Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    if inner.is_current(epoch) && inner.roster.lock().peers.is_empty() {
                        spawn_refresh(inner);
                    }
                }
            });
        }
    }

    /// Removes a finished fetch loop from the roster, blacklisting it when it
    /// misbehaved, and rediscovers if too many peers are gone.
    fn on_peer_closed(self: &Arc<Self>, addr: SocketAddr, misbehaved: bool, epoch: u64) {
        let current = self.is_current(epoch);
        let refresh = {
            let mut roster = self.roster.lock();
            if misbehaved {
                warn!(%addr, "blacklisting peer");
                roster.blacklist.insert(addr);
            }
            if !current {
                return;
            }
            roster.peers.remove(&addr);
            (roster.peers.len() as f64) < CHURN_THRESHOLD * roster.baseline as f64
        };
        if refresh {
            self.schedule_refresh(epoch);
        }
    }

    /// Runs a discovery round now, or once `discovery_retry` has passed since
    /// the previous one. At most one delayed round is pending.
    fn schedule_refresh(self: &Arc<Self>, epoch: u64) {
        let wait = self
            .last_round
            .lock()
            .map_or(Duration::ZERO, |at| self.discovery_retry.saturating_sub(at.elapsed()));
        if wait.is_zero() {
            debug!("peer count fell below threshold, rediscovering");
            spawn_refresh(Arc::clone(self));
            return;
        }
        if self.refresh_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(?wait, "peer count fell below threshold, rediscovery delayed");
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = weak.upgrade() {
                inner.refresh_scheduled.store(false, Ordering::SeqCst);
                if inner.is_current(epoch) {
                    spawn_refresh(inner);
                }
            }
        });
    }

    fn mark_downloaded(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Downloaded {
                false
            } else {
                *state = SessionState::Downloaded;
                true
            }
        });
        if changed {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.roster.lock().peers.clear();
            info!(name = self.manifest.name(), "download complete");
        }
    }
}

async fn wait_until_not_started(rx: &mut watch::Receiver<SessionState>) {
    let _ = rx.wait_for(|state| *state != SessionState::Started).await;
}

/// Fetch loop for one connection. Holds only a weak handle to the session.
async fn run_peer(session: Weak<SessionInner>, mut conn: PeerConnection, epoch: u64) {
    let addr = conn.addr();
    let Some(mut state_rx) = session.upgrade().map(|inner| inner.state.subscribe()) else {
        return;
    };
    debug!(%addr, "fetch loop started");

    let misbehaved = loop {
        let Some(inner) = session.upgrade() else {
            return;
        };
        if !inner.is_current(epoch) {
            break false;
        }

        let block = match inner.scheduler.next_block(|piece| conn.has_piece(piece)) {
            Assignment::Block(block) => block,
            Assignment::Retry => {
                inner.scheduler.wait_for_work(inner.retry_backoff).await;
                continue;
            }
            Assignment::Exhausted => {
                debug!(%addr, "peer has nothing we still need");
                break false;
            }
        };

        let fetched = tokio::select! {
            result = conn.fetch_block(block) => Some(result),
            _ = wait_until_not_started(&mut state_rx) => None,
        };
        let data = match fetched {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                inner.scheduler.on_block_not_received(block);
                let misbehaved = e.is_protocol_violation() || !conn.has_bitfield();
                debug!(%addr, error = %e, misbehaved, "fetch failed");
                break misbehaved;
            }
            None => {
                inner.scheduler.on_block_not_received(block);
                break false;
            }
        };

        let finalizer = Arc::clone(&inner);
        let outcome =
            tokio::task::spawn_blocking(move || finalizer.scheduler.on_block_received(block, data))
                .await;
        match outcome {
            Ok(Ok(PieceOutcome::Verified { complete: true })) => inner.mark_downloaded(),
            Ok(Ok(PieceOutcome::Corrupt)) => {
                warn!(%addr, piece = block.piece_index, "peer sent a corrupt piece");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(piece = block.piece_index, error = %e, "storage failure"),
            Err(e) => error!(error = %e, "piece finalization task failed"),
        }
    };

    conn.close();
    debug!(%addr, misbehaved, "fetch loop finished");
    if let Some(inner) = session.upgrade() {
        inner.on_peer_closed(addr, misbehaved, epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures::manifest;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingDiscovery {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Discovery for CountingDiscovery {
        async fn discover(&self, _manifest: &Manifest) -> Vec<SocketAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    fn config(dir: &tempfile::TempDir) -> ClientConfig {
        ClientConfig {
            download_dir: dir.path().join("downloads"),
            checkpoint_dir: dir.path().join(".torrents_info"),
            discovery_retry: Duration::from_millis(50),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Arc::new(CountingDiscovery::default());
        let session = Session::open(
            manifest("f.bin", &[3u8; 100], 64, &[]),
            &config(&dir),
            discovery.clone(),
        )
        .unwrap();
        let mut rx = session.subscribe();
        assert_eq!(session.state(), SessionState::NotStarted);

        session.pause();
        assert_eq!(session.state(), SessionState::NotStarted);

        session.start();
        assert_eq!(session.state(), SessionState::Started);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Started);

        session.pause();
        assert_eq!(session.state(), SessionState::Paused);
        let status = session.status();
        assert_eq!(status.peers, 0);
        assert_eq!(status.progress, 0.0);

        session.start();
        assert_eq!(session.state(), SessionState::Started);
        session.pause();
    }

    #[tokio::test]
    async fn test_empty_discovery_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Arc::new(CountingDiscovery::default());
        let session = Session::open(
            manifest("f.bin", &[3u8; 100], 64, &[]),
            &config(&dir),
            discovery.clone(),
        )
        .unwrap();

        session.start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(discovery.calls.load(Ordering::SeqCst) >= 2);

        session.pause();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let calls = discovery.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(discovery.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_churn_rediscovery_is_spaced_out() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Arc::new(CountingDiscovery::default());
        let cfg = ClientConfig {
            discovery_retry: Duration::from_millis(300),
            ..config(&dir)
        };
        let session =
            Session::open(manifest("f.bin", &[3u8; 100], 64, &[]), &cfg, discovery.clone())
                .unwrap();
        session.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);

        let gone: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let kept: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        {
            let mut roster = session.inner.roster.lock();
            roster.peers.extend([gone, kept]);
            roster.baseline = 2;
        }
        let epoch = session.inner.epoch.load(Ordering::SeqCst);
        session.inner.on_peer_closed(gone, true, epoch);
        session.inner.on_peer_closed(gone, true, epoch);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.blacklisted(), vec![gone]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.status().peers, 1);
        session.pause();
    }

    #[tokio::test]
    async fn test_complete_on_disk_opens_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let content = [9u8; 100];
        let m = manifest("f.bin", &content, 64, &[]);
        {
            let writer = PieceWriter::open(
                &m,
                &dir.path().join("downloads"),
                &dir.path().join(".torrents_info"),
            )
            .unwrap();
            writer.write_piece(0, &content[..64]).unwrap();
            writer.write_piece(1, &content[64..]).unwrap();
        }

        let session =
            Session::open(m, &config(&dir), Arc::new(CountingDiscovery::default())).unwrap();
        assert_eq!(session.state(), SessionState::Downloaded);
        session.start();
        assert_eq!(session.state(), SessionState::Downloaded);
        assert_eq!(session.status().progress, 1.0);
        session.wait_until_downloaded().await;
    }
}
