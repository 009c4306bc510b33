// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-only SQLite access for the tracking projection.
//!
//! Connections are short-lived: each fetch opens one, runs its queries on a
//! blocking worker, and drops it. `query_only` keeps a buggy caller from
//! ever writing through this path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use super::{Plan, PlanStatus, Project, Workspace};

/// Default tracking database filename.
const DEFAULT_FILENAME: &str = "tim.db";

/// Open the tracking database for reading.
pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    conn.pragma_update(None, "locking_mode", "NORMAL")?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(conn)
}

pub fn fetch_projects(conn: &Connection) -> rusqlite::Result<Vec<Project>> {
    let mut stmt = conn.prepare(
        "SELECT id, repository_id, remote_url, last_git_root, remote_label \
         FROM project ORDER BY remote_label, last_git_root, id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Project {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            remote_url: row.get(2)?,
            last_git_root: row.get(3)?,
            remote_label: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn fetch_workspaces(conn: &Connection, project_id: i64) -> rusqlite::Result<Vec<Workspace>> {
    let mut stmt = conn.prepare(
        "SELECT w.id, w.project_id, w.workspace_path, w.branch, w.name, w.plan_id, \
                w.plan_title, w.is_primary, l.workspace_id IS NOT NULL AS is_locked, \
                w.updated_at \
         FROM workspace w \
         LEFT JOIN workspace_lock l ON l.workspace_id = w.id \
         WHERE w.project_id = ?1 \
         ORDER BY w.is_primary DESC, w.name, w.id",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        Ok(Workspace {
            id: row.get(0)?,
            project_id: row.get(1)?,
            workspace_path: row.get(2)?,
            branch: row.get(3)?,
            name: row.get(4)?,
            plan_id: row.get(5)?,
            plan_title: row.get(6)?,
            is_primary: row.get(7)?,
            is_locked: row.get(8)?,
            updated_at: row.get(9)?,
        })
    })?;
    rows.collect()
}

pub fn fetch_plans(conn: &Connection, project_id: i64) -> rusqlite::Result<Vec<Plan>> {
    let mut stmt = conn.prepare(
        "SELECT uuid, project_id, plan_id, title, goal, status, priority, parent_uuid, \
                epic, filename, created_at, updated_at, branch \
         FROM plan WHERE project_id = ?1 \
         ORDER BY plan_id DESC, updated_at DESC",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        let status: Option<String> = row.get(5)?;
        Ok(Plan {
            uuid: row.get(0)?,
            project_id: row.get(1)?,
            plan_id: row.get(2)?,
            title: row.get(3)?,
            goal: row.get(4)?,
            status: PlanStatus::from_wire(status.as_deref().unwrap_or_default()),
            priority: row.get(6)?,
            parent_uuid: row.get(7)?,
            is_epic: row.get(8)?,
            filename: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            branch: row.get(12)?,
        })
    })?;
    rows.collect()
}

/// Map of plan uuid → "has at least one unresolved dependency".
pub fn fetch_dependency_status(
    conn: &Connection,
    project_id: i64,
) -> rusqlite::Result<HashMap<String, bool>> {
    let mut stmt = conn.prepare(
        "SELECT pd.plan_uuid, MAX(CASE WHEN p2.status != 'done' THEN 1 ELSE 0 END) \
         FROM plan_dependency pd \
         JOIN plan p2 ON pd.depends_on_uuid = p2.uuid \
         WHERE pd.plan_uuid IN (SELECT uuid FROM plan WHERE project_id = ?1) \
         GROUP BY pd.plan_uuid",
    )?;
    let rows = stmt.query_map([project_id], |row| {
        let uuid: String = row.get(0)?;
        let unresolved: i64 = row.get(1)?;
        Ok((uuid, unresolved != 0))
    })?;
    rows.collect()
}

/// Resolve the tracking database location from the environment.
pub fn database_path() -> PathBuf {
    resolve_database_path(
        std::env::var("XDG_CONFIG_HOME").ok().as_deref(),
        std::env::var("APPDATA").ok().as_deref(),
        home_dir().as_deref(),
        std::env::var("TIM_DATABASE_FILENAME").ok().as_deref(),
    )
}

/// Pure resolution logic, split out so tests can drive the environment.
pub fn resolve_database_path(
    xdg_config_home: Option<&str>,
    appdata: Option<&str>,
    home: Option<&Path>,
    filename: Option<&str>,
) -> PathBuf {
    let filename = match filename.map(str::trim).filter(|f| !f.is_empty()) {
        Some(filename) => filename,
        None => DEFAULT_FILENAME,
    };
    config_root(xdg_config_home, appdata, home).join("tim").join(filename)
}

fn config_root(
    xdg_config_home: Option<&str>,
    appdata: Option<&str>,
    home: Option<&Path>,
) -> PathBuf {
    if let Some(xdg) = xdg_config_home.map(str::trim).filter(|s| !s.is_empty()) {
        return PathBuf::from(xdg);
    }
    let home = home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    if cfg!(windows) {
        if let Some(appdata) = appdata.map(str::trim).filter(|s| !s.is_empty()) {
            return PathBuf::from(appdata);
        }
        return home.join("AppData").join("Roaming");
    }
    home.join(".config")
}

fn home_dir() -> Option<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var(var).ok().map(PathBuf::from)
}

#[cfg(test)]
#[path = "db_tests.rs"]
pub mod tests;
