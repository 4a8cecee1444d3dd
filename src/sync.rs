use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::remote::{chunk_object_key, ObjectStore};
use crate::store::{AudioChunk, ChunkStore, SessionStatus, SessionUpdate, StoreError};

/// Backoff schedule per chunk; one initial attempt plus one retry per entry
pub const RETRY_DELAYS_MS: [u64; 5] = [1000, 2000, 4000, 8000, 16000];

/// Delay between polls while waiting for new chunks or connectivity
const POLL_DELAY_MS: u64 = 1000;

/// Cooldown after a chunk exhausts its retries before the loop tries again
const ERROR_COOLDOWN_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Paused,
    Error,
}

/// Events emitted by the sync loop, in the order state actually changed
#[derive(Debug)]
pub enum SyncEvent {
    StatusChange(SyncStatus),
    ChunkUploaded {
        chunk_id: String,
        uploaded: u32,
        total: u32,
    },
    Error {
        chunk_id: String,
        message: String,
    },
    Complete {
        session_id: String,
    },
}

/// Source of connectivity state. `subscribe` delivers transitions so the
/// loop can resume promptly when the network returns.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> Receiver<bool>;
}

/// Monitor for environments without connectivity signals
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn subscribe(&self) -> Receiver<bool> {
        // No transitions will ever arrive
        let (_tx, rx) = unbounded();
        rx
    }
}

/// Manually switched monitor (user toggle, tests)
#[derive(Default)]
pub struct ToggleMonitor {
    online: AtomicBool,
    subscribers: Mutex<Vec<Sender<bool>>>,
}

impl ToggleMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(online).is_ok());
    }
}

impl NetworkMonitor for ToggleMonitor {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Receiver<bool> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

/// Background uploader draining unuploaded chunks for one session to remote
/// storage. One logical loop per engine; uploads are serial and strictly
/// lowest-index-first so progress counters are monotonic.
pub struct SyncEngine {
    store_path: PathBuf,
    objects: Arc<dyn ObjectStore>,
    monitor: Arc<dyn NetworkMonitor>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    session: Arc<Mutex<Option<String>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        store_path: &Path,
        objects: Arc<dyn ObjectStore>,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            objects,
            monitor,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            session: Arc::new(Mutex::new(None)),
            thread: Mutex::new(None),
        }
    }

    /// Start the sync loop for a session. Starting an already-running engine
    /// is a no-op with a warning.
    pub fn start(
        &self,
        session_id: &str,
        user_id: &str,
        events: Sender<SyncEvent>,
    ) -> Result<(), StoreError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("sync engine already running");
            return Ok(());
        }

        let store = match ChunkStore::open(&self.store_path) {
            Ok(store) => store,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.paused.store(false, Ordering::SeqCst);
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session_id.to_string());

        let worker = SyncWorker {
            store,
            objects: Arc::clone(&self.objects),
            monitor: Arc::clone(&self.monitor),
            running: Arc::clone(&self.running),
            paused: Arc::clone(&self.paused),
            session: Arc::clone(&self.session),
            events,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        };

        let handle = thread::spawn(move || worker.run());
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Halt the loop. The check is per-iteration; an upload attempt already
    /// in flight finishes or fails naturally. Full teardown: resuming a
    /// session afterwards requires `start` again.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Manual pause; the loop stops attempting uploads until resumed
    pub fn pause(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.paused.store(true, Ordering::SeqCst);
        }
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Block until the loop thread exits (tests, CLI)
    pub fn wait(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct SyncWorker {
    store: ChunkStore,
    objects: Arc<dyn ObjectStore>,
    monitor: Arc<dyn NetworkMonitor>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    session: Arc<Mutex<Option<String>>>,
    events: Sender<SyncEvent>,
    session_id: String,
    user_id: String,
}

impl SyncWorker {
    fn run(self) {
        debug!("starting sync loop for session {}", self.session_id);
        let connectivity = self.monitor.subscribe();
        let mut status = SyncStatus::Syncing;
        let _ = self.events.send(SyncEvent::StatusChange(status));

        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                self.set_status(&mut status, SyncStatus::Paused);
                thread::sleep(Duration::from_millis(POLL_DELAY_MS));
                continue;
            }

            if !self.monitor.is_online() {
                // No upload attempts while offline; a connectivity
                // notification wakes the loop early
                self.set_status(&mut status, SyncStatus::Paused);
                wait_for_signal(&connectivity, Duration::from_millis(POLL_DELAY_MS));
                continue;
            }

            self.set_status(&mut status, SyncStatus::Syncing);

            let pending = match self.store.get_unuploaded_chunks(&self.session_id) {
                Ok(pending) => pending,
                Err(e) => {
                    self.loop_error(&mut status, format!("failed to read pending chunks: {}", e));
                    continue;
                }
            };

            if pending.is_empty() {
                match self.store.get_session(&self.session_id) {
                    Ok(Some(session))
                        if session.status == SessionStatus::Uploading
                            && session.ended_at_ms.is_some() =>
                    {
                        // Recording ended and every chunk is uploaded
                        if let Err(e) = self.store.update_session(
                            &self.session_id,
                            &SessionUpdate {
                                status: Some(SessionStatus::Completed),
                                ..Default::default()
                            },
                        ) {
                            self.loop_error(
                                &mut status,
                                format!("failed to complete session: {}", e),
                            );
                            continue;
                        }
                        let _ = self.events.send(SyncEvent::Complete {
                            session_id: self.session_id.clone(),
                        });
                        break;
                    }
                    Ok(_) => {
                        // Still recording; wait for the capture loop
                        thread::sleep(Duration::from_millis(POLL_DELAY_MS));
                        continue;
                    }
                    Err(e) => {
                        self.loop_error(&mut status, format!("failed to read session: {}", e));
                        continue;
                    }
                }
            }

            // Lowest pending index first
            let chunk = &pending[0];
            debug!(
                "uploading chunk {} ({} bytes)",
                chunk.chunk_id(),
                chunk.data.len()
            );

            match self.upload_with_retry(chunk) {
                Ok(()) => {
                    if let Err(e) = self.record_upload(chunk) {
                        self.loop_error(&mut status, format!("failed to record upload: {}", e));
                    }
                }
                Err(message) => {
                    // Retries exhausted: cool down, then start over from the
                    // same chunk. The loop never gives up while running.
                    error!("chunk {} failed all retries: {}", chunk.chunk_id(), message);
                    self.set_status(&mut status, SyncStatus::Error);
                    thread::sleep(Duration::from_millis(ERROR_COOLDOWN_MS));
                    self.set_status(&mut status, SyncStatus::Syncing);
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let _ = self.events.send(SyncEvent::StatusChange(SyncStatus::Idle));
        debug!("sync loop ended for session {}", self.session_id);
    }

    fn set_status(&self, current: &mut SyncStatus, next: SyncStatus) {
        if *current != next {
            *current = next;
            let _ = self.events.send(SyncEvent::StatusChange(next));
        }
    }

    fn loop_error(&self, status: &mut SyncStatus, message: String) {
        error!("sync loop error: {}", message);
        self.set_status(status, SyncStatus::Error);
        thread::sleep(Duration::from_millis(ERROR_COOLDOWN_MS));
        self.set_status(status, SyncStatus::Syncing);
    }

    /// Upload one chunk with exponential backoff. Every failed attempt is
    /// reported; the final failure is returned to the loop.
    fn upload_with_retry(&self, chunk: &AudioChunk) -> Result<(), String> {
        let key = chunk_object_key(
            &self.user_id,
            &self.session_id,
            chunk.chunk_index,
            &chunk.media_type,
        );
        let mut attempt = 0;
        loop {
            match self
                .objects
                .put_object(&key, &chunk.data, &chunk.media_type)
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let message = e.to_string();
                    let _ = self.events.send(SyncEvent::Error {
                        chunk_id: chunk.chunk_id(),
                        message: message.clone(),
                    });
                    if attempt >= RETRY_DELAYS_MS.len() {
                        return Err(message);
                    }
                    let delay = RETRY_DELAYS_MS[attempt];
                    debug!("upload failed, retrying in {}ms: {}", delay, message);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                    if !self.running.load(Ordering::SeqCst) {
                        return Err(message);
                    }
                }
            }
        }
    }

    fn record_upload(&self, chunk: &AudioChunk) -> Result<(), StoreError> {
        self.store
            .mark_chunk_uploaded(&chunk.session_id, chunk.chunk_index)?;
        if let Some(session) = self.store.get_session(&self.session_id)? {
            let uploaded = session.uploaded_chunks + 1;
            self.store.update_session(
                &self.session_id,
                &SessionUpdate {
                    uploaded_chunks: Some(uploaded),
                    ..Default::default()
                },
            )?;
            let _ = self.events.send(SyncEvent::ChunkUploaded {
                chunk_id: chunk.chunk_id(),
                uploaded,
                total: session.total_chunks,
            });
        }
        Ok(())
    }
}

fn wait_for_signal(rx: &Receiver<bool>, timeout: Duration) {
    match rx.recv_timeout(timeout) {
        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
        // No monitor signals will arrive; plain sleep keeps the poll cadence
        Err(RecvTimeoutError::Disconnected) => thread::sleep(timeout),
    }
}
