use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use schedule::{
    Event, EventId, Interstitial, InterstitialId, InterstitialRepository, OrderSpan, OrderStats,
    Run, RunId, RunRepository, ScheduleError, ScheduleSnapshot, ScheduleStore, ScheduleTx,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| std::env::temp_dir());
    base.join("runsched")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("schedule.db")
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RUN_COLUMNS: &str =
    "id, event_id, name, ord, run_time_ms, setup_time_ms, start_ms, end_ms, anchor_ms";
const INTERSTITIAL_COLUMNS: &str = "id, event_id, anchor_id, ord, suborder, length_ms, kind_json";

/// SQLite-backed schedule store. Write transactions take the database write
/// lock up front, so concurrent movers serialize on it.
pub struct ScheduleDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl ScheduleDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        Self::prepare(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?, None)
    }

    fn prepare(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        apply_migrations(&conn)?;
        Ok(Self { conn, path })
    }

    /// How long a writer waits for the database lock before giving up with
    /// a lock timeout.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO events(id, name, start_ms, created_at) VALUES(?1, ?2, ?3, ?4)",
            params![
                event.id.to_string(),
                event.name,
                event.start_datetime.timestamp_millis(),
                now
            ],
        )?;
        Ok(())
    }

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn.execute(
            &format!("INSERT INTO runs({RUN_COLUMNS}, created_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                run.id.to_string(),
                run.event.to_string(),
                run.name,
                run.order,
                run.run_time,
                run.setup_time,
                run.start_time.map(|t| t.timestamp_millis()),
                run.end_time.map(|t| t.timestamp_millis()),
                run.anchor_time.map(|t| t.timestamp_millis()),
                now
            ],
        )?;
        Ok(())
    }

    pub fn insert_interstitial(&self, item: &Interstitial) -> Result<()> {
        match self.run(item.anchor)? {
            Some(anchor) if anchor.event == item.event => {}
            Some(_) => bail!("anchor run {} belongs to another event", item.anchor),
            None => bail!("anchor run {} does not exist", item.anchor),
        }
        let now = Utc::now().timestamp();
        self.conn.execute(
            &format!("INSERT INTO interstitials({INTERSTITIAL_COLUMNS}, created_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                item.id.to_string(),
                item.event.to_string(),
                item.anchor.to_string(),
                item.order,
                item.suborder,
                item.length,
                serde_json::to_string(&item.kind)?,
                now
            ],
        )?;
        Ok(())
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, start_ms FROM events ORDER BY start_ms, name")?;
        let rows = stmt.query_map([], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(select_event(&self.conn, id)?)
    }

    pub fn run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(select_runs_by_id(&self.conn, &[id])?.pop())
    }

    pub fn interstitial(&self, id: InterstitialId) -> Result<Option<Interstitial>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {INTERSTITIAL_COLUMNS} FROM interstitials WHERE id = ?1"),
                params![id.to_string()],
                interstitial_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Every run of the event: ordered runs by order, then the rest by name.
    pub fn runs(&self, event: EventId) -> Result<Vec<Run>> {
        Ok(select_event_runs(&self.conn, event)?)
    }

    pub fn interstitials(&self, event: EventId) -> Result<Vec<Interstitial>> {
        Ok(select_event_interstitials(&self.conn, event)?)
    }
}

impl ScheduleStore for ScheduleDb {
    type Tx<'a> = SqliteTx<'a>;

    fn begin(&self) -> Result<SqliteTx<'_>, ScheduleError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(db_err)?;
        Ok(SqliteTx { tx })
    }

    fn snapshot(&self, event: EventId) -> Result<ScheduleSnapshot, ScheduleError> {
        let found = select_event(&self.conn, event)
            .map_err(db_err)?
            .ok_or(ScheduleError::EventNotFound(event))?;
        Ok(ScheduleSnapshot {
            runs: select_event_runs(&self.conn, event).map_err(db_err)?,
            interstitials: select_event_interstitials(&self.conn, event).map_err(db_err)?,
            event: found,
        })
    }
}

/// An immediate SQLite transaction. Dropping it rolls back.
pub struct SqliteTx<'a> {
    tx: Transaction<'a>,
}

impl RunRepository for SqliteTx<'_> {
    fn event(&mut self, id: EventId) -> Result<Option<Event>, ScheduleError> {
        select_event(&self.tx, id).map_err(db_err)
    }

    fn order_stats(&mut self, event: EventId) -> Result<OrderStats, ScheduleError> {
        let (count, max): (u32, Option<u32>) = self
            .tx
            .query_row(
                "SELECT COUNT(ord), MAX(ord) FROM runs WHERE event_id = ?1 AND ord IS NOT NULL",
                params![event.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        Ok(OrderStats { count, max })
    }

    fn lock_by_id(&mut self, ids: &[RunId]) -> Result<Vec<Run>, ScheduleError> {
        select_runs_by_id(&self.tx, ids).map_err(db_err)
    }

    fn lock_range(&mut self, event: EventId, span: OrderSpan) -> Result<Vec<Run>, ScheduleError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE event_id = ?1 AND ord >= ?2 AND (?3 IS NULL OR ord <= ?3) ORDER BY ord"
        );
        let mut stmt = self.tx.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![event.to_string(), span.min, span.max], run_from_row)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        debug!(event = %event, min = span.min, max = ?span.max, rows = out.len(), "locked order range");
        Ok(out)
    }

    fn save_runs(&mut self, runs: &[Run]) -> Result<(), ScheduleError> {
        let mut stmt = self
            .tx
            .prepare_cached(
                "UPDATE runs SET name = ?2, ord = ?3, run_time_ms = ?4, setup_time_ms = ?5, start_ms = ?6, end_ms = ?7, anchor_ms = ?8 WHERE id = ?1 AND event_id = ?9",
            )
            .map_err(db_err)?;
        for run in runs {
            let changed = stmt
                .execute(params![
                    run.id.to_string(),
                    run.name,
                    run.order,
                    run.run_time,
                    run.setup_time,
                    run.start_time.map(|t| t.timestamp_millis()),
                    run.end_time.map(|t| t.timestamp_millis()),
                    run.anchor_time.map(|t| t.timestamp_millis()),
                    run.event.to_string()
                ])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(ScheduleError::Constraint(format!(
                    "run {} does not exist in event {}",
                    run.id, run.event
                )));
            }
        }
        Ok(())
    }
}

impl InterstitialRepository for SqliteTx<'_> {
    fn lock_by_anchor(&mut self, anchors: &[RunId]) -> Result<Vec<Interstitial>, ScheduleError> {
        let mut stmt = self
            .tx
            .prepare_cached(&format!(
                "SELECT {INTERSTITIAL_COLUMNS} FROM interstitials WHERE anchor_id = ?1 ORDER BY suborder"
            ))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for anchor in anchors {
            let rows = stmt
                .query_map(params![anchor.to_string()], interstitial_from_row)
                .map_err(db_err)?;
            for row in rows {
                out.push(row.map_err(db_err)?);
            }
        }
        Ok(out)
    }

    fn save_interstitials(&mut self, items: &[Interstitial]) -> Result<(), ScheduleError> {
        let mut stmt = self
            .tx
            .prepare_cached(
                "UPDATE interstitials SET anchor_id = ?2, ord = ?3, suborder = ?4, length_ms = ?5, kind_json = ?6 WHERE id = ?1 AND event_id = ?7",
            )
            .map_err(db_err)?;
        for item in items {
            let kind = serde_json::to_string(&item.kind).map_err(ScheduleError::storage)?;
            let changed = stmt
                .execute(params![
                    item.id.to_string(),
                    item.anchor.to_string(),
                    item.order,
                    item.suborder,
                    item.length,
                    kind,
                    item.event.to_string()
                ])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(ScheduleError::Constraint(format!(
                    "interstitial {} does not exist in event {}",
                    item.id, item.event
                )));
            }
        }
        Ok(())
    }
}

impl ScheduleTx for SqliteTx<'_> {
    fn commit(self) -> Result<(), ScheduleError> {
        self.tx.commit().map_err(db_err)
    }
}

/// Unique and check violations become constraint errors, lock contention a
/// lock timeout.
fn db_err(err: rusqlite::Error) -> ScheduleError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    };
    match code {
        Some(ErrorCode::ConstraintViolation) => ScheduleError::Constraint(err.to_string()),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ScheduleError::LockTimeout,
        _ => ScheduleError::storage(err),
    }
}

fn select_event(conn: &Connection, id: EventId) -> rusqlite::Result<Option<Event>> {
    conn.query_row(
        "SELECT id, name, start_ms FROM events WHERE id = ?1",
        params![id.to_string()],
        event_from_row,
    )
    .optional()
}

fn select_runs_by_id(conn: &Connection, ids: &[RunId]) -> rusqlite::Result<Vec<Run>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(run) = stmt
            .query_row(params![id.to_string()], run_from_row)
            .optional()?
        {
            out.push(run);
        }
    }
    Ok(out)
}

fn select_event_runs(conn: &Connection, event: EventId) -> rusqlite::Result<Vec<Run>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE event_id = ?1 ORDER BY ord IS NULL, ord, name"
    ))?;
    let rows = stmt.query_map(params![event.to_string()], run_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn select_event_interstitials(
    conn: &Connection,
    event: EventId,
) -> rusqlite::Result<Vec<Interstitial>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {INTERSTITIAL_COLUMNS} FROM interstitials WHERE event_id = ?1 ORDER BY ord IS NULL, ord, suborder"
    ))?;
    let rows = stmt.query_map(params![event.to_string()], interstitial_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: EventId(uuid_at(row, 0)?),
        name: row.get(1)?,
        start_datetime: required_instant_at(row, 2)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: RunId(uuid_at(row, 0)?),
        event: EventId(uuid_at(row, 1)?),
        name: row.get(2)?,
        order: row.get(3)?,
        run_time: row.get(4)?,
        setup_time: row.get(5)?,
        start_time: instant_at(row, 6)?,
        end_time: instant_at(row, 7)?,
        anchor_time: instant_at(row, 8)?,
    })
}

fn interstitial_from_row(row: &Row<'_>) -> rusqlite::Result<Interstitial> {
    let raw: String = row.get(6)?;
    let kind = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(Interstitial {
        id: InterstitialId(uuid_at(row, 0)?),
        event: EventId(uuid_at(row, 1)?),
        anchor: RunId(uuid_at(row, 2)?),
        order: row.get(3)?,
        suborder: row.get(4)?,
        length: row.get(5)?,
        kind,
    })
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn instant_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    })
    .transpose()
}

fn required_instant_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    Ok(())
}
