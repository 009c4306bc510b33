// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-only projection of the external tracking database.
//!
//! A reference-counted background loop refreshes every 10 seconds. SQLite
//! I/O runs on blocking workers, one fresh connection per fetch. Workspace
//! and plan rows are committed only if the project selection has not moved
//! since the refresh captured it; a stale fetch is discarded and the
//! coalesced follow-up refresh reloads for the new selection.

pub mod db;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Period of the background refresh loop.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Window during which a finished plan still shows as `recently_done`.
fn recently_done_window() -> chrono::Duration {
    chrono::Duration::days(7)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: i64,
    pub repository_id: Option<i64>,
    pub remote_url: Option<String>,
    pub last_git_root: Option<String>,
    pub remote_label: Option<String>,
}

impl Project {
    /// Label shown in the project picker.
    pub fn display_name(&self) -> String {
        self.remote_label
            .clone()
            .or_else(|| self.last_git_root.clone())
            .unwrap_or_else(|| format!("project {}", self.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    pub id: i64,
    pub project_id: i64,
    pub workspace_path: Option<String>,
    pub branch: Option<String>,
    pub name: Option<String>,
    pub plan_id: Option<i64>,
    pub plan_title: Option<String>,
    pub is_primary: bool,
    pub is_locked: bool,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub uuid: String,
    pub project_id: i64,
    pub plan_id: Option<i64>,
    pub title: Option<String>,
    pub goal: Option<String>,
    pub status: PlanStatus,
    pub priority: Option<i64>,
    pub parent_uuid: Option<String>,
    pub is_epic: bool,
    pub filename: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub branch: Option<String>,
}

/// Raw plan status as stored; unrecognized strings collapse to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
    Deferred,
}

impl PlanStatus {
    pub fn from_wire(status: &str) -> Self {
        match status {
            "in_progress" => Self::InProgress,
            "done" => Self::Done,
            "cancelled" => Self::Cancelled,
            "deferred" => Self::Deferred,
            _ => Self::Pending,
        }
    }
}

/// Derived status shown in the plan list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanDisplayStatus {
    Pending,
    InProgress,
    Blocked,
    RecentlyDone,
    Done,
    Cancelled,
    Deferred,
}

/// Statuses visible with no filter configured.
pub const DEFAULT_STATUS_FILTERS: [PlanDisplayStatus; 4] = [
    PlanDisplayStatus::Pending,
    PlanDisplayStatus::InProgress,
    PlanDisplayStatus::Blocked,
    PlanDisplayStatus::RecentlyDone,
];

/// Derive the display status from raw status, dependency state and age.
pub fn display_status(plan: &Plan, has_unresolved: bool, now: DateTime<Utc>) -> PlanDisplayStatus {
    match plan.status {
        PlanStatus::Pending => {
            if has_unresolved {
                PlanDisplayStatus::Blocked
            } else {
                PlanDisplayStatus::Pending
            }
        }
        PlanStatus::InProgress => PlanDisplayStatus::InProgress,
        PlanStatus::Done => match parse_db_time(plan.updated_at.as_deref()) {
            Some(updated) if now - updated <= recently_done_window() => {
                PlanDisplayStatus::RecentlyDone
            }
            _ => PlanDisplayStatus::Done,
        },
        PlanStatus::Cancelled => PlanDisplayStatus::Cancelled,
        PlanStatus::Deferred => PlanDisplayStatus::Deferred,
    }
}

/// Parse a timestamp column, accepting RFC 3339 and SQLite's
/// `YYYY-MM-DD HH:MM:SS` form.
pub fn parse_db_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok().map(|t| t.and_utc())
}

/// Load state of the projection as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded,
    Error(String),
}

/// In-memory snapshot the UI consumes.
#[derive(Debug, Clone)]
pub struct Projection {
    pub projects: Vec<Project>,
    pub workspaces: Vec<Workspace>,
    pub plans: Vec<Plan>,
    pub plan_dependency_status: HashMap<String, bool>,
    pub load_state: LoadState,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            workspaces: Vec::new(),
            plans: Vec::new(),
            plan_dependency_status: HashMap::new(),
            load_state: LoadState::Idle,
        }
    }
}

impl Projection {
    /// Plans surviving the given display-status filter, preserving order.
    pub fn filtered_plans(
        &self,
        filters: &[PlanDisplayStatus],
        now: DateTime<Utc>,
    ) -> Vec<&Plan> {
        self.plans
            .iter()
            .filter(|plan| {
                let unresolved =
                    self.plan_dependency_status.get(&plan.uuid).copied().unwrap_or(false);
                filters.contains(&display_status(plan, unresolved, now))
            })
            .collect()
    }
}

#[derive(Default)]
struct RefreshGate {
    in_flight: bool,
    needs_refresh: bool,
}

#[derive(Default)]
struct LoopHandle {
    refcount: u32,
    cancel: Option<CancellationToken>,
}

struct StoreInner {
    db_path: PathBuf,
    interval: Duration,
    projection: RwLock<Projection>,
    selected_project: RwLock<Option<i64>>,
    gate: Mutex<RefreshGate>,
    loop_handle: Mutex<LoopHandle>,
    change_tx: broadcast::Sender<()>,
}

/// Handle to the tracking projection. Cheap to clone.
#[derive(Clone)]
pub struct TrackingStore {
    inner: Arc<StoreInner>,
}

impl TrackingStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_interval(db_path, REFRESH_INTERVAL)
    }

    pub fn with_interval(db_path: PathBuf, interval: Duration) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(StoreInner {
                db_path,
                interval,
                projection: RwLock::new(Projection::default()),
                selected_project: RwLock::new(None),
                gate: Mutex::new(RefreshGate::default()),
                loop_handle: Mutex::new(LoopHandle::default()),
                change_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.change_tx.subscribe()
    }

    pub async fn projection(&self) -> Projection {
        self.inner.projection.read().await.clone()
    }

    pub async fn selected_project_id(&self) -> Option<i64> {
        *self.inner.selected_project.read().await
    }

    /// Change the selected project and reload its rows.
    pub async fn select_project(&self, project_id: Option<i64>) {
        *self.inner.selected_project.write().await = project_id;
        self.refresh().await;
    }

    /// Reference-counted start of the periodic refresh loop.
    pub async fn acquire(&self) {
        let mut handle = self.inner.loop_handle.lock().await;
        handle.refcount += 1;
        if handle.refcount == 1 {
            let cancel = CancellationToken::new();
            handle.cancel = Some(cancel.clone());
            let store = self.clone();
            tokio::spawn(async move {
                loop {
                    store.refresh().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(store.inner.interval) => {}
                    }
                }
            });
        }
    }

    /// Drop one reference; the loop stops when the last one goes.
    pub async fn release(&self) {
        let mut handle = self.inner.loop_handle.lock().await;
        handle.refcount = handle.refcount.saturating_sub(1);
        if handle.refcount == 0 {
            if let Some(cancel) = handle.cancel.take() {
                cancel.cancel();
            }
        }
    }

    /// Run one refresh pass. Never reentrant: a call arriving while a pass
    /// is in flight marks `needs_refresh` and the running pass loops once
    /// more after completing.
    pub async fn refresh(&self) {
        {
            let mut gate = self.inner.gate.lock().await;
            if gate.in_flight {
                gate.needs_refresh = true;
                return;
            }
            gate.in_flight = true;
        }
        loop {
            self.refresh_once().await;
            let again = {
                let mut gate = self.inner.gate.lock().await;
                if gate.needs_refresh {
                    gate.needs_refresh = false;
                    true
                } else {
                    gate.in_flight = false;
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    async fn refresh_once(&self) {
        {
            let mut projection = self.inner.projection.write().await;
            projection.load_state = LoadState::Loading;
        }
        self.changed();

        let captured = *self.inner.selected_project.read().await;

        let projects = match self.fetch(db::fetch_projects).await {
            Ok(projects) => projects,
            Err(message) => {
                self.fail(message).await;
                return;
            }
        };
        {
            let mut projection = self.inner.projection.write().await;
            projection.projects = projects;
        }

        if let Some(project_id) = captured {
            let workspaces =
                match self.fetch(move |conn| db::fetch_workspaces(conn, project_id)).await {
                    Ok(workspaces) => workspaces,
                    Err(message) => {
                        self.fail(message).await;
                        return;
                    }
                };
            if self.selection_still(captured).await {
                self.inner.projection.write().await.workspaces = workspaces;
            } else {
                debug!(project_id, "selection moved; discarding workspace rows");
            }

            let plans = match self
                .fetch(move |conn| {
                    let plans = db::fetch_plans(conn, project_id)?;
                    let deps = db::fetch_dependency_status(conn, project_id)?;
                    Ok((plans, deps))
                })
                .await
            {
                Ok(plans) => plans,
                Err(message) => {
                    self.fail(message).await;
                    return;
                }
            };
            if self.selection_still(captured).await {
                let mut projection = self.inner.projection.write().await;
                projection.plans = plans.0;
                projection.plan_dependency_status = plans.1;
            } else {
                debug!(project_id, "selection moved; discarding plan rows");
            }
        } else {
            let mut projection = self.inner.projection.write().await;
            projection.workspaces.clear();
            projection.plans.clear();
            projection.plan_dependency_status.clear();
        }

        {
            let mut projection = self.inner.projection.write().await;
            projection.load_state = LoadState::Loaded;
        }
        self.changed();
    }

    /// Run one fetch on a blocking worker with its own connection.
    async fn fetch<T, F>(&self, query: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.inner.db_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let conn = db::open(&path).map_err(|e| e.to_string())?;
            query(&conn).map_err(|e| e.to_string())
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(err) => Err(format!("tracking worker failed: {err}")),
        }
    }

    async fn selection_still(&self, captured: Option<i64>) -> bool {
        *self.inner.selected_project.read().await == captured
    }

    async fn fail(&self, message: String) {
        warn!(%message, "tracking refresh failed");
        self.inner.projection.write().await.load_state = LoadState::Error(message);
        self.changed();
    }

    fn changed(&self) {
        let _ = self.inner.change_tx.send(());
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
