//! SQLite-backed persistence for schedules, credit overrides, instances and
//! the catalog tables the batch fetch joins against.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use pulse_core::error::{PulseError, Result};
use pulse_core::types::{AllocationMethod, CourseId, InstanceId, ScheduleId, UserId};

use crate::instance::AutomationInstance;
use crate::record::{
    ActionType, CreditOverride, ScheduleKey, ScheduleRecord, ScheduleStatus, SchedulePayload,
    UserCreditEdit,
};
use crate::recurrence::IntervalType;
use crate::store::{DeleteScope, DueQuery, InstanceRepository, ScheduleStore};

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

/// Columns shared by every schedule table, in row-mapper order.
const SCHEDULE_COLUMNS: [&str; 14] = [
    "id",
    "instance_id",
    "user_id",
    "related_user_id",
    "interval_type",
    "status",
    "schedule_time",
    "completed_time",
    "notify_count",
    "frequency_count",
    "suppress_reached",
    "time_created",
    "time_modified",
    "error_log",
];

const CREDIT_COLUMNS: [&str; 3] = ["credits", "allocation_method", "parent_schedule_id"];

const OVERRIDE_SELECT: &str = "SELECT id, schedule_id, user_id, override_credit, scheduled_credit, overridden_by, status, time_created, time_modified FROM pulse_credits_override";

/// Column list for `action`, optionally prefixed with a table alias.
fn schedule_columns(action: ActionType, alias: &str) -> String {
    let extra: &[&str] = match action {
        ActionType::Credits => &CREDIT_COLUMNS,
        ActionType::Notification => &[],
    };
    SCHEDULE_COLUMNS
        .iter()
        .chain(extra.iter())
        .map(|c| if alias.is_empty() { c.to_string() } else { format!("{alias}.{c}") })
        .collect::<Vec<_>>()
        .join(", ")
}

fn schedule_select(action: ActionType) -> String {
    format!("SELECT {} FROM {}", schedule_columns(action, ""), action.table_name())
}

fn out_of_range(col: usize, value: i64) -> rusqlite::Error {
    rusqlite::Error::IntegralValueOutOfRange(col, value)
}

fn row_to_schedule(row: &rusqlite::Row, action: ActionType) -> rusqlite::Result<ScheduleRecord> {
    let interval: i64 = row.get(4)?;
    let status: i64 = row.get(5)?;
    let payload = match action {
        ActionType::Credits => {
            let method: i64 = row.get(15)?;
            SchedulePayload::Credits {
                credits: row.get(14)?,
                allocation_method: AllocationMethod::from_code(method).ok_or_else(|| out_of_range(15, method))?,
                parent_schedule_id: row.get(16)?,
            }
        }
        ActionType::Notification => SchedulePayload::Notification,
    };
    Ok(ScheduleRecord {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        user_id: row.get(2)?,
        related_user_id: row.get(3)?,
        interval_type: IntervalType::from_code(interval).ok_or_else(|| out_of_range(4, interval))?,
        status: ScheduleStatus::from_code(status).ok_or_else(|| out_of_range(5, status))?,
        schedule_time: row.get(6)?,
        completed_time: row.get(7)?,
        notify_count: row.get(8)?,
        frequency_count: row.get(9)?,
        suppress_reached: row.get(10)?,
        time_created: row.get(11)?,
        time_modified: row.get(12)?,
        error_log: row.get(13)?,
        payload,
    })
}

fn row_to_override(row: &rusqlite::Row) -> rusqlite::Result<CreditOverride> {
    Ok(CreditOverride {
        id: row.get(0)?, schedule_id: row.get(1)?, user_id: row.get(2)?,
        override_credit: row.get(3)?, scheduled_credit: row.get(4)?,
        overridden_by: row.get(5)?, status: row.get(6)?,
        time_created: row.get(7)?, time_modified: row.get(8)?,
    })
}

/// Credit columns of a payload: (credits, allocation method code, parent id).
fn credit_values(record: &ScheduleRecord) -> (f64, i64, Option<ScheduleId>) {
    match &record.payload {
        SchedulePayload::Credits { credits, allocation_method, parent_schedule_id } => {
            (*credits, allocation_method.code(), *parent_schedule_id)
        }
        SchedulePayload::Notification => (0.0, AllocationMethod::Add.code(), None),
    }
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| PulseError::Storage(format!("DB open: {e}")))?;

        // WAL lets the sweep and lifecycle hooks read while another writes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| PulseError::Storage(format!("DB pragma: {e}")))?;

        Self::from_connection(conn)
    }

    /// In-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| PulseError::Storage(format!("DB open: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| PulseError::Storage(e.to_string()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Credit allocation schedules
            CREATE TABLE IF NOT EXISTS pulse_credits_sch (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                related_user_id INTEGER,
                interval_type INTEGER NOT NULL,
                status INTEGER NOT NULL,          -- 0 failed, 1 disabled, 2 queued, 3 completed
                schedule_time INTEGER NOT NULL,
                completed_time INTEGER,
                notify_count INTEGER NOT NULL DEFAULT 0,
                frequency_count INTEGER NOT NULL DEFAULT 0,
                suppress_reached INTEGER NOT NULL DEFAULT 0,
                time_created INTEGER NOT NULL,
                time_modified INTEGER NOT NULL,
                error_log TEXT,
                credits REAL NOT NULL DEFAULT 0,
                allocation_method INTEGER NOT NULL DEFAULT 1,  -- 1 add, 2 replace
                parent_schedule_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_credits_sch_due ON pulse_credits_sch (status, schedule_time);
            CREATE INDEX IF NOT EXISTS idx_credits_sch_user ON pulse_credits_sch (instance_id, user_id);

            -- Notification schedules
            CREATE TABLE IF NOT EXISTS pulse_notification_sch (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                related_user_id INTEGER,
                interval_type INTEGER NOT NULL,
                status INTEGER NOT NULL,
                schedule_time INTEGER NOT NULL,
                completed_time INTEGER,
                notify_count INTEGER NOT NULL DEFAULT 0,
                frequency_count INTEGER NOT NULL DEFAULT 0,
                suppress_reached INTEGER NOT NULL DEFAULT 0,
                time_created INTEGER NOT NULL,
                time_modified INTEGER NOT NULL,
                error_log TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notification_sch_due ON pulse_notification_sch (status, schedule_time);
            CREATE INDEX IF NOT EXISTS idx_notification_sch_user ON pulse_notification_sch (instance_id, user_id);

            -- One credit override per schedule
            CREATE TABLE IF NOT EXISTS pulse_credits_override (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id INTEGER NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                override_credit REAL NOT NULL,
                scheduled_credit REAL NOT NULL,
                overridden_by INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 1,
                time_created INTEGER NOT NULL,
                time_modified INTEGER NOT NULL
            );

            -- Direct balance edits
            CREATE TABLE IF NOT EXISTS pulse_credits_user_override (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                course_id INTEGER,
                old_credits REAL NOT NULL,
                new_credits REAL NOT NULL,
                overridden_by INTEGER NOT NULL,
                note TEXT,
                time_created INTEGER NOT NULL
            );

            -- Automation instances (JSON definition, decoded once on load)
            CREATE TABLE IF NOT EXISTS pulse_instances (
                id INTEGER PRIMARY KEY,
                course_id INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                definition TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_course ON pulse_instances (course_id);

            -- Catalog mirrored from the learning platform
            CREATE TABLE IF NOT EXISTS pulse_courses (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                visible INTEGER NOT NULL DEFAULT 1,
                start_date INTEGER NOT NULL DEFAULT 0,
                end_date INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS pulse_users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL DEFAULT '',
                deleted INTEGER NOT NULL DEFAULT 0,
                suspended INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_users_email ON pulse_users (email);

            CREATE TABLE IF NOT EXISTS pulse_enrolments (
                course_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                time_start INTEGER NOT NULL DEFAULT 0,
                time_end INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (course_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS pulse_roles (
                id INTEGER PRIMARY KEY,
                shortname TEXT NOT NULL,
                archetype TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS pulse_role_assignments (
                role_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                course_id INTEGER NOT NULL DEFAULT 0,       -- set for course-level roles
                child_user_id INTEGER NOT NULL DEFAULT 0,   -- set for user-context roles
                PRIMARY KEY (role_id, user_id, course_id, child_user_id)
            );

            CREATE TABLE IF NOT EXISTS pulse_groups (
                group_id INTEGER NOT NULL,
                course_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS pulse_condition_verdicts (
                instance_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                condition TEXT NOT NULL,
                eligible INTEGER NOT NULL,
                anchor_time INTEGER,
                PRIMARY KEY (instance_id, user_id, condition)
            );

            CREATE TABLE IF NOT EXISTS pulse_completions (
                user_id INTEGER NOT NULL,
                course_id INTEGER NOT NULL DEFAULT 0,
                module_id INTEGER NOT NULL DEFAULT 0,
                time_completed INTEGER NOT NULL,
                PRIMARY KEY (user_id, course_id, module_id)
            );

            CREATE TABLE IF NOT EXISTS pulse_user_credits (
                user_id INTEGER PRIMARY KEY,
                balance REAL NOT NULL DEFAULT 0
            );
         ",
            )
            .map_err(|e| PulseError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    fn query_schedules(&self, action: ActionType, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ScheduleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| PulseError::Storage(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(args, |row| row_to_schedule(row, action))
            .map_err(|e| PulseError::Storage(format!("Query schedules: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PulseError::Storage(format!("Read schedule: {e}")))
    }

    fn delete_ids(&self, action: ActionType, ids: &[ScheduleId]) -> Result<()> {
        let conn = self.conn()?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", action.table_name());
        for id in ids {
            conn.execute(&sql, params![id])
                .map_err(|e| PulseError::Storage(format!("Delete schedule: {e}")))?;
        }
        Ok(())
    }
}

impl ScheduleStore for SchedulerDb {
    fn get(&self, action: ActionType, id: ScheduleId) -> Result<Option<ScheduleRecord>> {
        let sql = format!("{} WHERE id = ?1", schedule_select(action));
        Ok(self.query_schedules(action, &sql, &[&id])?.into_iter().next())
    }

    fn find_active(&self, action: ActionType, key: &ScheduleKey) -> Result<Option<ScheduleRecord>> {
        let sql = format!(
            "{} WHERE instance_id = ?1 AND user_id = ?2 AND related_user_id IS ?3
               AND frequency_count = ?4 AND status IN (1, 2)
             ORDER BY id DESC LIMIT 1",
            schedule_select(action)
        );
        let rows = self.query_schedules(
            action,
            &sql,
            &[&key.instance_id, &key.user_id, &key.related_user_id, &key.frequency_count],
        )?;
        Ok(rows.into_iter().next())
    }

    fn latest_completed(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>> {
        let sql = format!(
            "{} WHERE instance_id = ?1 AND user_id = ?2 AND related_user_id IS ?3 AND status = 3
             ORDER BY COALESCE(completed_time, 0) DESC, id DESC LIMIT 1",
            schedule_select(action)
        );
        let rows = self.query_schedules(action, &sql, &[&instance_id, &user_id, &related_user_id])?;
        Ok(rows.into_iter().next())
    }

    fn latest_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
    ) -> Result<Option<ScheduleRecord>> {
        let sql = format!(
            "{} WHERE instance_id = ?1 AND user_id = ?2 AND related_user_id IS ?3 ORDER BY id DESC LIMIT 1",
            schedule_select(action)
        );
        let rows = self.query_schedules(action, &sql, &[&instance_id, &user_id, &related_user_id])?;
        Ok(rows.into_iter().next())
    }

    fn insert(&self, record: &ScheduleRecord) -> Result<ScheduleId> {
        let conn = self.conn()?;
        let interval = record.interval_type.code();
        let status = record.status.code();
        let (credits, method, parent) = credit_values(record);
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![
            &record.instance_id,
            &record.user_id,
            &record.related_user_id,
            &interval,
            &status,
            &record.schedule_time,
            &record.completed_time,
            &record.notify_count,
            &record.frequency_count,
            &record.suppress_reached,
            &record.time_created,
            &record.time_modified,
            &record.error_log,
        ];
        let result = match record.action_type() {
            ActionType::Credits => {
                values.push(&credits);
                values.push(&method);
                values.push(&parent);
                conn.execute(
                    "INSERT INTO pulse_credits_sch
                     (instance_id, user_id, related_user_id, interval_type, status, schedule_time,
                      completed_time, notify_count, frequency_count, suppress_reached, time_created,
                      time_modified, error_log, credits, allocation_method, parent_schedule_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    values.as_slice(),
                )
            }
            ActionType::Notification => conn.execute(
                "INSERT INTO pulse_notification_sch
                 (instance_id, user_id, related_user_id, interval_type, status, schedule_time,
                  completed_time, notify_count, frequency_count, suppress_reached, time_created,
                  time_modified, error_log)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                values.as_slice(),
            ),
        };
        result.map_err(|e| PulseError::Storage(format!("Save schedule: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    fn update(&self, record: &ScheduleRecord) -> Result<()> {
        let conn = self.conn()?;
        let (credits, method, parent) = credit_values(record);
        let changed = match record.action_type() {
            ActionType::Credits => conn.execute(
                "UPDATE pulse_credits_sch SET
                    instance_id = ?2, user_id = ?3, related_user_id = ?4, interval_type = ?5,
                    status = ?6, schedule_time = ?7, completed_time = ?8, notify_count = ?9,
                    frequency_count = ?10, suppress_reached = ?11, time_created = ?12,
                    time_modified = ?13, error_log = ?14, credits = ?15, allocation_method = ?16,
                    parent_schedule_id = ?17
                 WHERE id = ?1",
                params![
                    record.id, record.instance_id, record.user_id, record.related_user_id,
                    record.interval_type.code(), record.status.code(), record.schedule_time,
                    record.completed_time, record.notify_count, record.frequency_count,
                    record.suppress_reached, record.time_created, record.time_modified,
                    record.error_log, credits, method, parent,
                ],
            ),
            ActionType::Notification => conn.execute(
                "UPDATE pulse_notification_sch SET
                    instance_id = ?2, user_id = ?3, related_user_id = ?4, interval_type = ?5,
                    status = ?6, schedule_time = ?7, completed_time = ?8, notify_count = ?9,
                    frequency_count = ?10, suppress_reached = ?11, time_created = ?12,
                    time_modified = ?13, error_log = ?14
                 WHERE id = ?1",
                params![
                    record.id, record.instance_id, record.user_id, record.related_user_id,
                    record.interval_type.code(), record.status.code(), record.schedule_time,
                    record.completed_time, record.notify_count, record.frequency_count,
                    record.suppress_reached, record.time_created, record.time_modified,
                    record.error_log,
                ],
            ),
        }
        .map_err(|e| PulseError::Storage(format!("Update schedule: {e}")))?;
        if changed == 0 {
            return Err(PulseError::NotFound(format!("schedule {}", record.id)));
        }
        Ok(())
    }

    fn disable_for_user(
        &self,
        action: ActionType,
        instance_id: InstanceId,
        user_id: UserId,
        related_user_id: Option<UserId>,
        now: i64,
    ) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET status = 1, time_modified = ?4
             WHERE instance_id = ?1 AND user_id = ?2 AND related_user_id IS ?3 AND status = 2",
            action.table_name()
        );
        self.conn()?
            .execute(&sql, params![instance_id, user_id, related_user_id, now])
            .map_err(|e| PulseError::Storage(format!("Disable user schedule: {e}")))
    }

    fn disable_queued(&self, action: ActionType, instance_id: InstanceId, now: i64) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET status = 1, time_modified = ?2 WHERE instance_id = ?1 AND status = 2",
            action.table_name()
        );
        self.conn()?
            .execute(&sql, params![instance_id, now])
            .map_err(|e| PulseError::Storage(format!("Disable schedules: {e}")))
    }

    fn flag_suppressed(&self, action: ActionType, instance_id: InstanceId, user_id: UserId, now: i64) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET status = 1, suppress_reached = 1, time_modified = ?3
             WHERE instance_id = ?1 AND (user_id = ?2 OR related_user_id = ?2)
               AND status IN (1, 2) AND NOT (status = 1 AND suppress_reached = 1)",
            action.table_name()
        );
        self.conn()?
            .execute(&sql, params![instance_id, user_id, now])
            .map_err(|e| PulseError::Storage(format!("Flag suppressed: {e}")))
    }

    fn delete_for_instance(&self, action: ActionType, instance_id: InstanceId, scope: DeleteScope) -> Result<Vec<ScheduleId>> {
        let ids: Vec<ScheduleId> = self
            .list_for_instance(action, instance_id)?
            .into_iter()
            .filter(|r| scope.matches(r))
            .map(|r| r.id)
            .collect();
        self.delete_ids(action, &ids)?;
        Ok(ids)
    }

    fn delete_for_user(&self, action: ActionType, instance_id: InstanceId, user_id: UserId) -> Result<Vec<ScheduleId>> {
        let sql = format!(
            "{} WHERE instance_id = ?1 AND (user_id = ?2 OR related_user_id = ?2) AND status IN (1, 2)",
            schedule_select(action)
        );
        let ids: Vec<ScheduleId> = self
            .query_schedules(action, &sql, &[&instance_id, &user_id])?
            .into_iter()
            .map(|r| r.id)
            .collect();
        self.delete_ids(action, &ids)?;
        Ok(ids)
    }

    fn list_for_instance(&self, action: ActionType, instance_id: InstanceId) -> Result<Vec<ScheduleRecord>> {
        let sql = format!("{} WHERE instance_id = ?1 ORDER BY id", schedule_select(action));
        self.query_schedules(action, &sql, &[&instance_id])
    }

    fn fetch_due(&self, action: ActionType, query: &DueQuery) -> Result<Vec<ScheduleRecord>> {
        let sql = format!(
            "SELECT {cols} FROM {table} s
             JOIN pulse_instances i ON i.id = s.instance_id
             JOIN pulse_courses c ON c.id = i.course_id
             JOIN pulse_users u ON u.id = s.user_id
             JOIN pulse_enrolments e
               ON e.course_id = i.course_id AND e.user_id = COALESCE(s.related_user_id, s.user_id)
             WHERE s.status = 2 AND s.suppress_reached = 0 AND s.schedule_time <= ?1
               AND i.enabled = 1
               AND c.visible = 1 AND c.start_date <= ?1 AND (c.end_date = 0 OR c.end_date >= ?1)
               AND u.deleted = 0 AND u.suspended = 0
               AND e.active = 1 AND (e.time_start = 0 OR e.time_start <= ?1)
               AND (e.time_end = 0 OR e.time_end > ?1)
               AND (?2 IS NULL OR s.user_id = ?2)
             ORDER BY s.time_created ASC, s.id ASC
             LIMIT ?3",
            cols = schedule_columns(action, "s"),
            table = action.table_name(),
        );
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        self.query_schedules(action, &sql, &[&query.now, &query.user_id, &limit])
    }

    fn get_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        let conn = self.conn()?;
        conn.query_row(&format!("{OVERRIDE_SELECT} WHERE schedule_id = ?1"), params![schedule_id], row_to_override)
            .optional()
            .map_err(|e| PulseError::Storage(format!("Load override: {e}")))
    }

    fn apply_override(&self, ov: &CreditOverride) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| PulseError::Storage(format!("Begin: {e}")))?;

        let changed = tx
            .execute(
                "UPDATE pulse_credits_sch SET credits = ?2, time_modified = ?3 WHERE id = ?1",
                params![ov.schedule_id, ov.override_credit, ov.time_modified],
            )
            .map_err(|e| PulseError::Storage(format!("Override schedule credits: {e}")))?;
        if changed == 0 {
            return Err(PulseError::NotFound(format!("schedule {}", ov.schedule_id)));
        }

        tx.execute(
            "INSERT INTO pulse_credits_override
             (schedule_id, user_id, override_credit, scheduled_credit, overridden_by, status, time_created, time_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(schedule_id) DO UPDATE SET
                override_credit = excluded.override_credit,
                overridden_by = excluded.overridden_by,
                status = excluded.status,
                time_modified = excluded.time_modified",
            params![
                ov.schedule_id, ov.user_id, ov.override_credit, ov.scheduled_credit,
                ov.overridden_by, ov.status, ov.time_created, ov.time_modified,
            ],
        )
        .map_err(|e| PulseError::Storage(format!("Save override: {e}")))?;

        let id: i64 = tx
            .query_row(
                "SELECT id FROM pulse_credits_override WHERE schedule_id = ?1",
                params![ov.schedule_id],
                |r| r.get(0),
            )
            .map_err(|e| PulseError::Storage(format!("Load override: {e}")))?;
        tx.commit().map_err(|e| PulseError::Storage(format!("Commit: {e}")))?;
        Ok(id)
    }

    fn revert_override(&self, schedule_id: ScheduleId) -> Result<Option<CreditOverride>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| PulseError::Storage(format!("Begin: {e}")))?;

        let existing = tx
            .query_row(&format!("{OVERRIDE_SELECT} WHERE schedule_id = ?1"), params![schedule_id], row_to_override)
            .optional()
            .map_err(|e| PulseError::Storage(format!("Load override: {e}")))?;
        let Some(ov) = existing else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE pulse_credits_sch SET credits = ?2 WHERE id = ?1",
            params![schedule_id, ov.scheduled_credit],
        )
        .map_err(|e| PulseError::Storage(format!("Restore schedule credits: {e}")))?;
        tx.execute("DELETE FROM pulse_credits_override WHERE schedule_id = ?1", params![schedule_id])
            .map_err(|e| PulseError::Storage(format!("Delete override: {e}")))?;
        tx.commit().map_err(|e| PulseError::Storage(format!("Commit: {e}")))?;
        Ok(Some(ov))
    }

    fn delete_overrides(&self, schedule_ids: &[ScheduleId]) -> Result<usize> {
        let conn = self.conn()?;
        let mut removed = 0;
        for id in schedule_ids {
            removed += conn
                .execute("DELETE FROM pulse_credits_override WHERE schedule_id = ?1", params![id])
                .map_err(|e| PulseError::Storage(format!("Delete override: {e}")))?;
        }
        Ok(removed)
    }

    fn insert_user_credit_edit(&self, edit: &UserCreditEdit) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pulse_credits_user_override
             (user_id, course_id, old_credits, new_credits, overridden_by, note, time_created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edit.user_id, edit.course_id, edit.old_credits, edit.new_credits,
                edit.overridden_by, edit.note, edit.time_created,
            ],
        )
        .map_err(|e| PulseError::Storage(format!("Save credit edit: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    fn user_credit_edits(&self, user_id: UserId) -> Result<Vec<UserCreditEdit>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, course_id, old_credits, new_credits, overridden_by, note, time_created
                 FROM pulse_credits_user_override WHERE user_id = ?1 ORDER BY id",
            )
            .map_err(|e| PulseError::Storage(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(UserCreditEdit {
                    id: row.get(0)?, user_id: row.get(1)?, course_id: row.get(2)?,
                    old_credits: row.get(3)?, new_credits: row.get(4)?,
                    overridden_by: row.get(5)?, note: row.get(6)?, time_created: row.get(7)?,
                })
            })
            .map_err(|e| PulseError::Storage(format!("Query credit edits: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PulseError::Storage(format!("Read credit edit: {e}")))
    }
}

impl InstanceRepository for SchedulerDb {
    fn get_instance(&self, id: InstanceId) -> Result<Option<AutomationInstance>> {
        let conn = self.conn()?;
        let definition: Option<String> = conn
            .query_row("SELECT definition FROM pulse_instances WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(|e| PulseError::Storage(format!("Load instance: {e}")))?;
        definition.map(|json| serde_json::from_str(&json).map_err(PulseError::from)).transpose()
    }

    fn save_instance(&self, instance: &AutomationInstance) -> Result<()> {
        let definition = serde_json::to_string(instance)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO pulse_instances (id, course_id, enabled, definition)
                 VALUES (?1, ?2, ?3, ?4)",
                params![instance.id, instance.course_id, instance.enabled, definition],
            )
            .map_err(|e| PulseError::Storage(format!("Save instance: {e}")))?;
        Ok(())
    }

    fn delete_instance(&self, id: InstanceId) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM pulse_instances WHERE id = ?1", params![id])
            .map_err(|e| PulseError::Storage(format!("Delete instance: {e}")))?;
        Ok(())
    }

    fn instances_for_course(&self, course_id: CourseId) -> Result<Vec<AutomationInstance>> {
        self.load_instances("SELECT definition FROM pulse_instances WHERE course_id = ?1 ORDER BY id", &[&course_id])
    }

    fn list_instances(&self) -> Result<Vec<AutomationInstance>> {
        self.load_instances("SELECT definition FROM pulse_instances ORDER BY id", &[])
    }
}

impl SchedulerDb {
    fn load_instances(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<AutomationInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| PulseError::Storage(format!("Prepare: {e}")))?;
        let definitions = stmt
            .query_map(args, |r| r.get::<_, String>(0))
            .map_err(|e| PulseError::Storage(format!("Query instances: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PulseError::Storage(format!("Read instance: {e}")))?;
        definitions
            .iter()
            .map(|json| serde_json::from_str(json).map_err(PulseError::from))
            .collect()
    }
}
