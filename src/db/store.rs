//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::DurableStore;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::init(Connection::open(path)?)
    }

    /// A private in-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, DbError> {
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Server CRUD ---

    /// Add a new server and return its ID.
    pub fn add_server(&self, server: &mut Server) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (name, protocol, host, port, path, check_interval, timeout, enabled, tags, failure_threshold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                server.name,
                server.protocol,
                server.host,
                server.port,
                server.path,
                server.check_interval,
                server.timeout,
                server.enabled,
                server.tags_csv(),
                server.failure_threshold,
            ],
        )?;
        server.id = conn.last_insert_rowid();
        Ok(server.id)
    }

    /// Update an existing server.
    pub fn update_server(&self, server: &Server) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE servers SET name=?1, protocol=?2, host=?3, port=?4, path=?5, check_interval=?6,
             timeout=?7, enabled=?8, tags=?9, failure_threshold=?10 WHERE id=?11",
            params![
                server.name,
                server.protocol,
                server.host,
                server.port,
                server.path,
                server.check_interval,
                server.timeout,
                server.enabled,
                server.tags_csv(),
                server.failure_threshold,
                server.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get a server by ID.
    pub fn get_server(&self, id: i64) -> Result<Server, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, protocol, host, port, path, check_interval, timeout, enabled, tags, failure_threshold
             FROM servers WHERE id = ?1",
            params![id],
            server_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a server together with its results and status.
    pub fn delete_server(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM ping_results WHERE server_id = ?1", params![id])?;
        tx.execute("DELETE FROM server_statuses WHERE server_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get a status by server ID.
    pub fn get_status(&self, server_id: i64) -> Result<Option<ServerStatus>, DbError> {
        let conn = self.conn()?;
        let status = conn
            .query_row(
                "SELECT server_id, status, uptime_percentage, last_check, last_up, last_down,
                 consecutive_failures, failure_threshold, message, updated_at
                 FROM server_statuses WHERE server_id = ?1",
                params![server_id],
                |row| status_from_row(row, 0),
            )
            .optional()?;
        Ok(status)
    }

    // --- Metrics ---

    /// Fleet-wide counts for the last 24 hours ending at `now`.
    pub fn overview(&self, now: DateTime<Utc>) -> Result<Overview, DbError> {
        let conn = self.conn()?;

        let (total, enabled): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM servers",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let mut servers = ServerCounts {
            total,
            enabled,
            disabled: total - enabled,
            ..Default::default()
        };
        let mut stmt = conn.prepare(
            "SELECT st.status, COUNT(*) FROM server_statuses st
             JOIN servers s ON s.id = st.server_id GROUP BY st.status",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            match status.parse::<StatusKind>() {
                Ok(StatusKind::Up) => servers.up = count,
                Ok(StatusKind::Degraded) => servers.degraded = count,
                Ok(StatusKind::Down) => servers.down = count,
                Err(_) => {}
            }
        }

        let since = fmt_time(now - ChronoDuration::hours(24));
        let (checks, successful, avg): (i64, i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN p.status = 'success' THEN 1 ELSE 0 END), 0),
                    AVG(CASE WHEN p.status = 'success' THEN p.response_time_ms END)
             FROM ping_results p JOIN servers s ON s.id = p.server_id
             WHERE p.checked_at >= ?1",
            params![since],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;

        let success_rate = percent(successful, checks);

        Ok(Overview {
            servers,
            checks_last_24h: CheckCounts {
                total: checks,
                successful,
                failed: checks - successful,
                success_rate,
            },
            avg_response_time_ms: avg.map(round2),
        })
    }

    /// Per-server uptime over the last [`UPTIME_REPORT_DAYS`], enabled servers only.
    pub fn uptime_report(&self, now: DateTime<Utc>) -> Result<UptimeReport, DbError> {
        let since = fmt_time(now - ChronoDuration::days(UPTIME_REPORT_DAYS));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.name, s.protocol, s.host, COUNT(p.id),
                    COALESCE(SUM(CASE WHEN p.status = 'success' THEN 1 ELSE 0 END), 0),
                    st.status, st.last_check
             FROM servers s
             LEFT JOIN ping_results p ON p.server_id = s.id AND p.checked_at >= ?1
             LEFT JOIN server_statuses st ON st.server_id = s.id
             WHERE s.enabled = 1
             GROUP BY s.id
             ORDER BY s.name",
        )?;
        let servers = stmt
            .query_map(params![since], |row| {
                let total: i64 = row.get(4)?;
                let successful: i64 = row.get(5)?;
                let status: Option<String> = row.get(6)?;
                let current_status = match status {
                    Some(s) => Some(s.parse::<StatusKind>().map_err(|e: String| conversion_error(6, e))?),
                    None => None,
                };
                Ok(ServerUptime {
                    server_id: row.get(0)?,
                    server_name: row.get(1)?,
                    protocol: row.get(2)?,
                    host: row.get(3)?,
                    uptime_percentage: percent(successful, total),
                    total_checks: total,
                    successful_checks: successful,
                    current_status,
                    last_check: optional_time_column(row, 7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(UptimeReport {
            period_days: UPTIME_REPORT_DAYS,
            servers,
        })
    }

    /// Response times of successful checks in the `hours` before `now`.
    pub fn response_times(&self, now: DateTime<Utc>, hours: u32) -> Result<ResponseTimeReport, DbError> {
        let since = fmt_time(now - ChronoDuration::hours(i64::from(hours)));
        let conn = self.conn()?;

        let overall = conn.query_row(
            "SELECT AVG(p.response_time_ms), MIN(p.response_time_ms), MAX(p.response_time_ms), COUNT(*)
             FROM ping_results p JOIN servers s ON s.id = p.server_id
             WHERE p.status = 'success' AND p.checked_at >= ?1",
            params![since],
            |r| {
                Ok(ResponseTimeStats {
                    avg_ms: r.get::<_, Option<f64>>(0)?.map(round2),
                    min_ms: r.get::<_, Option<f64>>(1)?.map(round2),
                    max_ms: r.get::<_, Option<f64>>(2)?.map(round2),
                    total_checks: r.get(3)?,
                })
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT s.id, s.name, s.host, AVG(p.response_time_ms) AS avg_ms,
                    MIN(p.response_time_ms), MAX(p.response_time_ms), COUNT(*)
             FROM ping_results p JOIN servers s ON s.id = p.server_id
             WHERE p.status = 'success' AND p.checked_at >= ?1
             GROUP BY s.id
             ORDER BY avg_ms DESC, s.name",
        )?;
        let by_server = stmt
            .query_map(params![since], |r| {
                Ok(ServerResponseTimes {
                    server_id: r.get(0)?,
                    server_name: r.get(1)?,
                    server_host: r.get(2)?,
                    avg_ms: round2(r.get(3)?),
                    min_ms: round2(r.get(4)?),
                    max_ms: round2(r.get(5)?),
                    check_count: r.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ResponseTimeReport {
            period_hours: hours,
            overall,
            by_server,
        })
    }

    /// Failed and timed-out checks over the last [`FAILURE_REPORT_DAYS`].
    pub fn failure_report(&self, now: DateTime<Utc>) -> Result<FailureReport, DbError> {
        let since = fmt_time(now - ChronoDuration::days(FAILURE_REPORT_DAYS));
        let conn = self.conn()?;
        let mut report = FailureReport {
            period_days: FAILURE_REPORT_DAYS,
            ..Default::default()
        };

        let mut stmt = conn.prepare(
            "SELECT p.status, COUNT(*)
             FROM ping_results p JOIN servers s ON s.id = p.server_id
             WHERE p.status != 'success' AND p.checked_at >= ?1
             GROUP BY p.status",
        )?;
        let rows = stmt.query_map(params![since], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            match status.parse::<CheckStatus>() {
                Ok(CheckStatus::Timeout) => report.by_type.timeout += count,
                Ok(CheckStatus::Failure) => report.by_type.failure += count,
                _ => continue,
            }
            report.total_failures += count;
        }

        let mut stmt = conn.prepare(
            "SELECT s.name, p.server_id, p.status, p.response_time_ms, p.status_code, p.error_message, p.checked_at
             FROM ping_results p JOIN servers s ON s.id = p.server_id
             WHERE p.status != 'success' AND p.checked_at >= ?1
             ORDER BY p.checked_at DESC, p.id DESC
             LIMIT ?2",
        )?;
        report.recent_failures = stmt
            .query_map(params![since, RECENT_FAILURES_LIMIT as i64], |row| {
                Ok(PingSnapshot {
                    name: row.get(0)?,
                    ping: ping_from_row(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT s.id, s.name, s.host, COUNT(*) AS failures
             FROM ping_results p JOIN servers s ON s.id = p.server_id
             WHERE p.status != 'success' AND p.checked_at >= ?1
             GROUP BY s.id
             ORDER BY failures DESC, s.name
             LIMIT ?2",
        )?;
        report.top_failing_servers = stmt
            .query_map(params![since, TOP_FAILING_LIMIT as i64], |r| {
                Ok(FailingServer {
                    server_id: r.get(0)?,
                    server_name: r.get(1)?,
                    server_host: r.get(2)?,
                    failure_count: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(report)
    }
}

impl DurableStore for Store {
    fn list_servers(&self) -> Result<Vec<Server>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, protocol, host, port, path, check_interval, timeout, enabled, tags, failure_threshold
             FROM servers ORDER BY name",
        )?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(servers)
    }

    fn save_ping_results(&self, results: &[PingResult]) -> Result<(), DbError> {
        if results.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ping_results (server_id, status, response_time_ms, status_code, error_message, checked_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6 WHERE EXISTS (SELECT 1 FROM servers WHERE id = ?1)",
            )?;
            for r in results {
                stmt.execute(params![
                    r.server_id,
                    r.status.as_str(),
                    r.response_time_ms,
                    r.status_code,
                    r.error_message,
                    fmt_time(r.checked_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_status(&self, status: &ServerStatus) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO server_statuses (server_id, status, uptime_percentage, last_check, last_up, last_down,
                 consecutive_failures, failure_threshold, message, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
             WHERE EXISTS (SELECT 1 FROM servers WHERE id = ?1)
             ON CONFLICT(server_id) DO UPDATE SET
                 status=excluded.status, uptime_percentage=excluded.uptime_percentage,
                 last_check=excluded.last_check, last_up=excluded.last_up, last_down=excluded.last_down,
                 consecutive_failures=excluded.consecutive_failures,
                 failure_threshold=excluded.failure_threshold, message=excluded.message,
                 updated_at=excluded.updated_at",
            params![
                status.server_id,
                status.status.as_str(),
                status.uptime_percentage,
                fmt_time(status.last_check),
                status.last_up.map(fmt_time),
                status.last_down.map(fmt_time),
                status.consecutive_failures,
                status.failure_threshold,
                status.message,
                fmt_time(status.updated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    fn query_statuses(&self, query: &StatusQuery) -> Result<Vec<StatusSnapshot>, DbError> {
        let mut sql = String::from(
            "SELECT s.name, st.server_id, st.status, st.uptime_percentage, st.last_check, st.last_up,
                    st.last_down, st.consecutive_failures, st.failure_threshold, st.message, st.updated_at
             FROM server_statuses st JOIN servers s ON s.id = st.server_id WHERE 1=1",
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(status) = query.status {
            sql.push_str(" AND st.status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(ids) = &query.server_ids {
            push_id_list(&mut sql, &mut args, "st.server_id", ids);
        }
        if let Some(since) = query.since {
            sql.push_str(" AND st.updated_at > ?");
            args.push(Value::Text(fmt_time(since)));
        }
        sql.push_str(" ORDER BY s.name");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(StatusSnapshot {
                    name: row.get(0)?,
                    status: status_from_row(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_pings(&self, query: &PingQuery) -> Result<Vec<PingSnapshot>, DbError> {
        let mut sql = String::from(
            "SELECT s.name, p.server_id, p.status, p.response_time_ms, p.status_code, p.error_message, p.checked_at
             FROM ping_results p JOIN servers s ON s.id = p.server_id WHERE 1=1",
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(ids) = &query.server_ids {
            push_id_list(&mut sql, &mut args, "p.server_id", ids);
        }
        if let Some(status) = query.status {
            sql.push_str(" AND p.status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND p.checked_at > ?");
            args.push(Value::Text(fmt_time(since)));
        }
        sql.push_str(" ORDER BY p.checked_at DESC, p.id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(limit as i64));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(PingSnapshot {
                    name: row.get(0)?,
                    ping: ping_from_row(row, 1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn push_id_list(sql: &mut String, args: &mut Vec<Value>, column: &str, ids: &[i64]) {
    if ids.is_empty() {
        sql.push_str(" AND 0");
        return;
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    sql.push_str(&format!(" AND {column} IN ({placeholders})"));
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    let tags: String = row.get(9)?;
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        protocol: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        path: row.get(5)?,
        check_interval: row.get(6)?,
        timeout: row.get(7)?,
        enabled: row.get(8)?,
        tags: Server::parse_tags(&tags),
        failure_threshold: row.get(10)?,
    })
}

fn status_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<ServerStatus> {
    let status: String = row.get(at + 1)?;
    Ok(ServerStatus {
        server_id: row.get(at)?,
        status: status.parse().map_err(|e: String| conversion_error(at + 1, e))?,
        uptime_percentage: row.get(at + 2)?,
        last_check: time_column(row, at + 3)?,
        last_up: optional_time_column(row, at + 4)?,
        last_down: optional_time_column(row, at + 5)?,
        consecutive_failures: row.get(at + 6)?,
        failure_threshold: row.get(at + 7)?,
        message: row.get(at + 8)?,
        updated_at: time_column(row, at + 9)?,
    })
}

fn ping_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<PingResult> {
    let status: String = row.get(at + 1)?;
    Ok(PingResult {
        server_id: row.get(at)?,
        status: status.parse().map_err(|e: String| conversion_error(at + 1, e))?,
        response_time_ms: row.get(at + 2)?,
        status_code: row.get(at + 3)?,
        error_message: row.get(at + 4)?,
        checked_at: time_column(row, at + 5)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {s}")))
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => parse_db_time(&s)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp: {s}"))),
        None => Ok(None),
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `part` as a percentage of `total`, zero when there is nothing to count.
fn percent(part: i64, total: i64) -> f64 {
    if total > 0 {
        round2(part as f64 / total as f64 * 100.0)
    } else {
        0.0
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
