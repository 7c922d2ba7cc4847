use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use bench_core::{BENCH_DEFAULT_SANDBOX_WORKDIR, BENCH_ENV_TASK_SETUP_LOG, BENCH_TASK_SETUP_LOG};

use crate::error::{InfraError, SandboxUnavailable};
use crate::http::{HttpCodeGateway, HttpObservationService};
use crate::protocol::{CodeGateway, ObservationService};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Ready,
    Busy,
    Degraded,
    Released,
}

/// Where a sandbox's two services listen; loaded from campaign config or CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxEndpoints {
    pub name: String,
    pub gateway_url: String,
    pub observation_url: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

fn default_workdir() -> String {
    BENCH_DEFAULT_SANDBOX_WORKDIR.to_string()
}

pub struct SandboxHandle {
    id: String,
    gateway: Arc<dyn CodeGateway>,
    observation: Arc<dyn ObservationService>,
    workdir: String,
    runtime_env: BTreeMap<String, String>,
    state: SandboxState,
    // Absolute paths outside the workdir that the current lease may have written.
    noted_paths: Mutex<BTreeSet<String>>,
}

impl SandboxHandle {
    pub fn new(
        id: impl Into<String>,
        gateway: Arc<dyn CodeGateway>,
        observation: Arc<dyn ObservationService>,
        workdir: impl Into<String>,
    ) -> Self {
        let workdir = workdir.into();
        let mut runtime_env = BTreeMap::new();
        runtime_env.insert(
            BENCH_ENV_TASK_SETUP_LOG.to_string(),
            join_remote(&workdir, BENCH_TASK_SETUP_LOG),
        );
        Self {
            id: id.into(),
            gateway,
            observation,
            workdir,
            runtime_env,
            state: SandboxState::Provisioning,
            noted_paths: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn connect_http(endpoints: &SandboxEndpoints, connect_timeout: Duration) -> Result<Self> {
        let gateway = HttpCodeGateway::new(&endpoints.gateway_url, connect_timeout)?;
        let observation = HttpObservationService::new(&endpoints.observation_url, connect_timeout)?;
        Ok(Self::new(
            endpoints.name.clone(),
            Arc::new(gateway),
            Arc::new(observation),
            endpoints.workdir.clone(),
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gateway(&self) -> &dyn CodeGateway {
        self.gateway.as_ref()
    }

    pub fn observation(&self) -> &dyn ObservationService {
        self.observation.as_ref()
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Environment every setup script runs with.
    pub fn runtime_env(&self) -> &BTreeMap<String, String> {
        &self.runtime_env
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Absolute sandbox paths pass through; relative ones land under the workdir.
    pub fn resolve_remote_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            join_remote(&self.workdir, path)
        }
    }

    fn is_under_workdir(&self, path: &str) -> bool {
        path.starts_with(&format!("{}/", self.workdir.trim_end_matches('/')))
    }

    /// Records a path written outside the workdir so the next reset removes it.
    pub fn note_remote_path(&self, path: &str) {
        let path = self.resolve_remote_path(path);
        if self.is_under_workdir(&path) {
            return;
        }
        self.noted_paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
    }

    pub fn noted_paths(&self) -> Vec<String> {
        self.noted_paths
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn probe(&self, timeout: Duration) -> std::result::Result<(), String> {
        self.gateway
            .health(timeout)
            .map_err(|err| format!("{}: gateway unhealthy: {}", self.id, err))?;
        self.observation
            .health(timeout)
            .map_err(|err| format!("{}: observation unhealthy: {}", self.id, err))?;
        Ok(())
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("workdir", &self.workdir)
            .field("state", &self.state)
            .finish()
    }
}

pub fn join_remote(dir: &str, name: &str) -> String {
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        name.trim_start_matches("./").trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Clean,
    TaskFailed,
    InfraFailure,
}

struct PoolSlot {
    id: String,
    // None while leased out.
    handle: Option<SandboxHandle>,
}

struct PoolState {
    slots: Vec<PoolSlot>,
}

/// Fixed set of single-tenant sandboxes shared by sequential pipelines.
pub struct SandboxPool {
    state: Mutex<PoolState>,
    available: Condvar,
    poll_interval: Duration,
    probe_timeout: Duration,
}

impl SandboxPool {
    pub fn new(handles: Vec<SandboxHandle>) -> Self {
        Self::with_intervals(handles, DEFAULT_POLL_INTERVAL, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_intervals(
        handles: Vec<SandboxHandle>,
        poll_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let slots = handles
            .into_iter()
            .map(|mut handle| {
                handle.state = SandboxState::Provisioning;
                PoolSlot {
                    id: handle.id.clone(),
                    handle: Some(handle),
                }
            })
            .collect();
        Self {
            state: Mutex::new(PoolState { slots }),
            available: Condvar::new(),
            poll_interval,
            probe_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn states(&self) -> Vec<(String, SandboxState)> {
        self.lock()
            .slots
            .iter()
            .map(|slot| {
                let state = slot
                    .handle
                    .as_ref()
                    .map(|h| h.state)
                    .unwrap_or(SandboxState::Busy);
                (slot.id.clone(), state)
            })
            .collect()
    }

    /// Blocks until an idle, non-degraded sandbox passes both health checks.
    pub fn acquire(&self, timeout: Duration) -> Result<SandboxLease<'_>, SandboxUnavailable> {
        let started = Instant::now();
        let mut last_failure = if self.is_empty() {
            "no sandboxes are configured".to_string()
        } else {
            "no idle sandbox".to_string()
        };
        loop {
            let candidates: Vec<usize> = {
                let state = self.lock();
                state
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| {
                        slot.handle
                            .as_ref()
                            .map(|h| h.state != SandboxState::Degraded)
                            .unwrap_or(false)
                    })
                    .map(|(idx, _)| idx)
                    .collect()
            };
            for idx in candidates {
                let Some(mut handle) = self.checkout(idx) else {
                    continue;
                };
                let remaining = timeout.saturating_sub(started.elapsed());
                let probe_timeout = self
                    .probe_timeout
                    .min(remaining)
                    .max(Duration::from_millis(50));
                match handle.probe(probe_timeout) {
                    Ok(()) => {
                        handle.state = SandboxState::Ready;
                        debug!(sandbox = handle.id(), "sandbox ready");
                        return Ok(self.hand_out(idx, handle));
                    }
                    Err(detail) => {
                        debug!(detail = %detail, "sandbox not ready yet");
                        last_failure = detail;
                        self.checkin(idx, handle, SandboxState::Provisioning);
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(waited = ?elapsed, detail = %last_failure, "sandbox acquisition timed out");
                return Err(SandboxUnavailable {
                    waited: elapsed,
                    detail: last_failure,
                });
            }
            let wait = self.poll_interval.min(timeout - elapsed);
            let guard = self.lock();
            let _ = self
                .available
                .wait_timeout(guard, wait)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn hand_out(&self, slot: usize, mut handle: SandboxHandle) -> SandboxLease<'_> {
        debug_assert_eq!(handle.state, SandboxState::Ready);
        handle.state = SandboxState::Busy;
        info!(sandbox = handle.id(), "sandbox acquired");
        SandboxLease {
            pool: self,
            slot,
            handle: Some(handle),
        }
    }

    fn checkout(&self, idx: usize) -> Option<SandboxHandle> {
        let mut state = self.lock();
        let slot = state.slots.get_mut(idx)?;
        match slot.handle.as_ref() {
            Some(handle) if handle.state != SandboxState::Degraded => {}
            _ => return None,
        }
        slot.handle.take()
    }

    /// Probes every idle sandbox once and marks the healthy ones `Ready`.
    /// Returns how many are ready.
    pub fn warm_up(&self) -> usize {
        let idle: Vec<usize> = {
            let state = self.lock();
            state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.handle.is_some())
                .map(|(idx, _)| idx)
                .collect()
        };
        let mut ready = 0;
        for idx in idle {
            let Some(handle) = self.checkout(idx) else {
                continue;
            };
            let next = match handle.probe(self.probe_timeout) {
                Ok(()) => {
                    ready += 1;
                    SandboxState::Ready
                }
                Err(detail) => {
                    debug!(detail = %detail, "sandbox not ready at warm-up");
                    SandboxState::Provisioning
                }
            };
            self.checkin(idx, handle, next);
        }
        info!(ready, total = self.len(), "sandbox pool warmed up");
        ready
    }

    fn checkin(&self, idx: usize, mut handle: SandboxHandle, next: SandboxState) {
        handle.state = next;
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(idx) {
            slot.handle = Some(handle);
        }
        drop(state);
        self.available.notify_all();
    }

    /// Restarts the interpreter session, empties the working directory and
    /// deletes files the previous lease wrote elsewhere. `task_paths` are the
    /// next task's remote targets; they are removed now and noted for the
    /// following reset.
    pub fn reset(
        &self,
        lease: &SandboxLease<'_>,
        task_paths: &[String],
        timeout: Duration,
    ) -> Result<(), InfraError> {
        let handle = lease.handle();
        handle
            .gateway()
            .restart(timeout)
            .map_err(|err| InfraError(format!("{}: restart failed: {}", handle.id(), err)))?;
        handle
            .gateway()
            .clear_dir(handle.workdir(), timeout)
            .map_err(|err| {
                InfraError(format!(
                    "{}: clearing {} failed: {}",
                    handle.id(),
                    handle.workdir(),
                    err
                ))
            })?;
        for path in task_paths {
            handle.note_remote_path(path);
        }
        let stale = handle.noted_paths();
        if !stale.is_empty() {
            handle
                .gateway()
                .remove_files(&stale, timeout)
                .map_err(|err| {
                    InfraError(format!("{}: removing stale files failed: {}", handle.id(), err))
                })?;
        }
        {
            let mut noted = handle
                .noted_paths
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            noted.clear();
            noted.extend(
                task_paths
                    .iter()
                    .map(|path| handle.resolve_remote_path(path))
                    .filter(|path| !handle.is_under_workdir(path)),
            );
        }
        debug!(sandbox = handle.id(), removed = stale.len(), "sandbox reset");
        Ok(())
    }

    pub fn release(&self, mut lease: SandboxLease<'_>, outcome: ReleaseOutcome) -> SandboxState {
        let next = match outcome {
            ReleaseOutcome::Clean | ReleaseOutcome::TaskFailed => SandboxState::Released,
            ReleaseOutcome::InfraFailure => SandboxState::Degraded,
        };
        if let Some(handle) = lease.handle.take() {
            if next == SandboxState::Degraded {
                warn!(sandbox = handle.id(), "sandbox degraded; excluded from acquisition");
            }
            self.checkin(lease.slot, handle, next);
        }
        next
    }

    /// Returns a degraded sandbox to rotation after external re-provisioning.
    pub fn reinstate(&self, id: &str) -> bool {
        let mut state = self.lock();
        let mut reinstated = false;
        for slot in state.slots.iter_mut().filter(|slot| slot.id == id) {
            if let Some(handle) = slot.handle.as_mut() {
                if handle.state == SandboxState::Degraded {
                    handle.state = SandboxState::Provisioning;
                    reinstated = true;
                }
            }
        }
        drop(state);
        if reinstated {
            info!(sandbox = id, "sandbox reinstated");
            self.available.notify_all();
        }
        reinstated
    }
}

/// Exclusive use of one sandbox; returned as `Released` when dropped.
pub struct SandboxLease<'a> {
    pool: &'a SandboxPool,
    slot: usize,
    handle: Option<SandboxHandle>,
}

impl SandboxLease<'_> {
    pub fn handle(&self) -> &SandboxHandle {
        match self.handle.as_ref() {
            Some(handle) => handle,
            None => unreachable!("lease handle is only taken on release or drop"),
        }
    }
}

impl Drop for SandboxLease<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool
                .checkin(self.slot, handle, SandboxState::Released);
        }
    }
}
