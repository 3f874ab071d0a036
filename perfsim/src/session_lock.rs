//! Session lock contention probe.
//!
//! Models the per-session lock a stateful web stack takes for the length of a
//! request: one lock file per session id, locked exclusively with an OS
//! advisory lock. A holder keeps it for a chosen duration; anyone else asking
//! for the same session queues behind it in OS order, and the time spent
//! queuing is what the probe reports.
//!
//! Locks are tied to open file handles, so two handles inside one process
//! contend exactly like two processes do.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::SimulatorConfig;
use crate::error::{PerfSimError, PerfSimResult};
use crate::events::{codes, notify, EventSink, SimulationEvent};
use crate::simulation::{SessionLockParams, SimulationParams, SimulationTracker};
use crate::storage::file::file_stem;
use crate::time::Clock;

/// Informational payload written into the lock file while it is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderInfo {
    /// Id of this particular hold.
    pub holder_id: String,
    /// Process holding the lock.
    pub pid: u32,
    /// When the hold began.
    pub started_at: DateTime<Utc>,
    /// Declared hold length.
    pub duration_seconds: u64,
}

/// Outcome of [`SessionLockService::acquire_and_hold`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHoldResult {
    /// Id of the hold.
    pub holder_id: String,
    /// Requested hold, in seconds.
    pub requested_duration: u64,
    /// Measured hold, in seconds.
    pub actual_duration: f64,
    /// Process that held the lock.
    pub pid: u32,
    /// Time spent queuing before the hold began.
    pub lock_wait_ms: u64,
}

/// Outcome of [`SessionLockService::probe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Time spent queuing for the lock.
    pub lock_wait_ms: u64,
    /// Whether someone else held the lock when the probe asked for it.
    pub had_prior_holder: bool,
    /// When the probe got the lock.
    pub timestamp: DateTime<Utc>,
    /// Metadata left by the most recent holder, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_holder: Option<HolderInfo>,
}

/// An exclusively locked session file. Dropping it releases the lock.
struct HeldLock {
    file: File,
    waited: Duration,
    contended: bool,
}

impl HeldLock {
    fn release(self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the handle below releases it regardless.
            tracing::debug!(error = %e, "explicit unlock failed");
        }
    }
}

/// Acquires, holds and probes per-session locks.
#[derive(Debug, Clone)]
pub struct SessionLockService {
    lock_dir: PathBuf,
    tracker: SimulationTracker,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: Arc<SimulatorConfig>,
}

impl SessionLockService {
    /// Create a service keeping lock files under `config.lock_dir`.
    pub fn new(
        tracker: SimulationTracker,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: Arc<SimulatorConfig>,
    ) -> Self {
        Self {
            lock_dir: config.lock_dir.clone(),
            tracker,
            clock,
            events,
            config,
        }
    }

    /// Take the session lock, keep it for `hold_seconds`, then release it.
    ///
    /// Blocks while another holder has the lock, up to the configured
    /// ceiling. The hold is registered as a SESSION_LOCK simulation that is
    /// completed on release.
    pub async fn acquire_and_hold(
        &self,
        session_id: &str,
        hold_seconds: u64,
    ) -> PerfSimResult<LockHoldResult> {
        let params = SimulationParams::SessionLock(SessionLockParams {
            session_id: session_id.to_string(),
            hold_seconds,
        });
        params.validate(&self.config)?;

        let held = self.acquire(session_id, self.config.lock_timeout()).await?;
        let holder = HolderInfo {
            holder_id: format!("holder_{}_{:08x}", std::process::id(), rand::random::<u32>()),
            pid: std::process::id(),
            started_at: self.clock.now(),
            duration_seconds: hold_seconds,
        };
        let held = write_holder(held, &holder).await?;
        let sim = self.tracker.create_simulation(params, hold_seconds).await?;

        tracing::info!(
            session_id,
            holder_id = %holder.holder_id,
            hold_secs = hold_seconds,
            waited_ms = held.waited.as_millis() as u64,
            "session lock held"
        );
        let hold_started = Instant::now();
        tokio::time::sleep(Duration::from_secs(hold_seconds)).await;
        let lock_wait_ms = held.waited.as_millis() as u64;
        held.release();
        let actual_duration = hold_started.elapsed().as_secs_f64();

        self.tracker.complete_simulation(sim.id()).await?;
        notify(
            self.events.as_ref(),
            SimulationEvent::with_code(
                codes::SESSION_LOCK_RELEASED,
                format!("Session lock released after {:.2}s", actual_duration),
                &sim,
            ),
        )
        .await;

        Ok(LockHoldResult {
            holder_id: holder.holder_id,
            requested_duration: hold_seconds,
            actual_duration,
            pid: holder.pid,
            lock_wait_ms,
        })
    }

    /// Measure how long it takes to get the session lock, using the
    /// configured ceiling. Releases immediately after reading holder metadata.
    pub async fn probe(&self, session_id: &str) -> PerfSimResult<ProbeResult> {
        self.probe_with_ceiling(session_id, self.config.lock_timeout())
            .await
    }

    /// Like [`Self::probe`] with an explicit ceiling; `None` waits forever.
    pub async fn probe_with_ceiling(
        &self,
        session_id: &str,
        ceiling: Option<Duration>,
    ) -> PerfSimResult<ProbeResult> {
        self.config.check_session_id(session_id)?;

        let held = self.acquire(session_id, ceiling).await?;
        let timestamp = self.clock.now();
        let (held, prior_holder) = read_holder(held).await?;
        let result = ProbeResult {
            lock_wait_ms: held.waited.as_millis() as u64,
            had_prior_holder: held.contended,
            timestamp,
            prior_holder,
        };
        held.release();

        tracing::debug!(
            session_id,
            lock_wait_ms = result.lock_wait_ms,
            contended = result.had_prior_holder,
            "session lock probed"
        );
        Ok(result)
    }

    async fn acquire(
        &self,
        session_id: &str,
        ceiling: Option<Duration>,
    ) -> PerfSimResult<HeldLock> {
        tokio::fs::create_dir_all(&self.lock_dir)
            .await
            .map_err(|e| lock_failed("create lock directory", e))?;
        let path = self
            .lock_dir
            .join(format!("{}.lock", file_stem(session_id)));
        let started = Instant::now();

        let (file, locked) = tokio::task::spawn_blocking(move || -> PerfSimResult<(File, bool)> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| lock_failed("open lock file", e))?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok((file, true)),
                Err(e) if is_contended(&e) => Ok((file, false)),
                Err(e) => Err(lock_failed("lock", e)),
            }
        })
        .await??;

        if locked {
            return Ok(HeldLock {
                file,
                waited: started.elapsed(),
                contended: false,
            });
        }

        // Queue behind the current holder in OS order. On timeout the waiting
        // thread keeps queuing; whatever it eventually acquires is dropped,
        // and dropping the handle releases the lock.
        let waiting = tokio::task::spawn_blocking(move || -> PerfSimResult<File> {
            file.lock_exclusive()
                .map_err(|e| lock_failed("lock", e))?;
            Ok(file)
        });
        let file = match ceiling {
            Some(limit) => {
                let remaining = limit.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, waiting).await {
                    Ok(joined) => joined??,
                    Err(_) => {
                        let waited_ms = started.elapsed().as_millis() as u64;
                        tracing::warn!(session_id, waited_ms, "session lock acquisition timed out");
                        return Err(PerfSimError::LockTimeout {
                            session_id: session_id.to_string(),
                            waited_ms,
                        });
                    }
                }
            }
            None => waiting.await??,
        };

        Ok(HeldLock {
            file,
            waited: started.elapsed(),
            contended: true,
        })
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_failed(action: &str, err: io::Error) -> PerfSimError {
    PerfSimError::LockFailed(format!("{}: {}", action, err))
}

async fn write_holder(held: HeldLock, holder: &HolderInfo) -> PerfSimResult<HeldLock> {
    let payload = serde_json::to_vec(holder).map_err(|e| PerfSimError::LockFailed(e.to_string()))?;
    tokio::task::spawn_blocking(move || -> PerfSimResult<HeldLock> {
        let mut file = &held.file;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&payload))
            .and_then(|_| file.sync_data())
            .map_err(|e| lock_failed("write holder metadata", e))?;
        Ok(held)
    })
    .await?
}

async fn read_holder(held: HeldLock) -> PerfSimResult<(HeldLock, Option<HolderInfo>)> {
    tokio::task::spawn_blocking(move || -> PerfSimResult<(HeldLock, Option<HolderInfo>)> {
        let mut contents = String::new();
        let mut file = &held.file;
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut contents))
            .map_err(|e| lock_failed("read holder metadata", e))?;
        // Empty or foreign content simply means no known prior holder.
        let holder = serde_json::from_str(&contents).ok();
        Ok((held, holder))
    })
    .await?
}
