//! Local attendance ledger on SQLite.
//!
//! One database holds enrollment (classrooms, students, account bindings)
//! and the attendance records. `(classroom, account)` is the primary key
//! of `attendance`, so a second write for the same pair is reported as
//! [`LedgerError::AlreadyExists`] without touching the first record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::registry::validate_label;
use rollcall_core::{
    Account, AttendanceLedger, Classroom, ClassroomId, ClassroomRegistry, DirectoryError,
    DirectoryService, LedgerError, MarkedStudent, RegistrationNumber, RegistryError, Student,
};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS classrooms (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS students (
    classroom_id INTEGER NOT NULL REFERENCES classrooms(id),
    reg_no       TEXT NOT NULL,
    name         TEXT NOT NULL,
    account      TEXT,
    PRIMARY KEY (classroom_id, reg_no),
    UNIQUE (classroom_id, account)
);

CREATE TABLE IF NOT EXISTS attendance (
    classroom_id INTEGER NOT NULL REFERENCES classrooms(id),
    account      TEXT NOT NULL,
    reg_no       TEXT NOT NULL,
    marked_at    TEXT NOT NULL,
    PRIMARY KEY (classroom_id, account)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

type CallResult<T, E> = Result<Result<T, E>, tokio_rusqlite::Error>;

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        tracing::debug!("ledger schema ready");
        Ok(Self { conn })
    }
}

/// Classroom ids are SQLite rowids rendered as text.
fn row_id(id: &ClassroomId) -> Option<i64> {
    id.as_str().parse().ok()
}

fn classroom_exists(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM classrooms WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn registry_db(e: tokio_rusqlite::Error) -> RegistryError {
    tracing::error!(error = %e, "registry query failed");
    RegistryError::Unavailable(e.to_string())
}

fn ledger_db(e: tokio_rusqlite::Error) -> LedgerError {
    tracing::error!(error = %e, "ledger query failed");
    LedgerError::Unavailable(e.to_string())
}

#[async_trait]
impl ClassroomRegistry for SqliteLedger {
    async fn create_classroom(&self, name: &str) -> Result<Classroom, RegistryError> {
        validate_label("classroom name", name)?;
        let name = name.to_string();
        let created = self
            .conn
            .call(move |conn| -> CallResult<Classroom, RegistryError> {
                let inserted =
                    conn.execute("INSERT OR IGNORE INTO classrooms (name) VALUES (?1)", params![name])?;
                if inserted == 0 {
                    return Ok(Err(RegistryError::DuplicateName(name)));
                }
                Ok(Ok(Classroom {
                    id: ClassroomId::new(conn.last_insert_rowid().to_string()),
                    name,
                }))
            })
            .await
            .map_err(registry_db)??;

        tracing::info!(classroom = %created.id, name = %created.name, "classroom created");
        Ok(created)
    }

    async fn classrooms(&self) -> Result<Vec<Classroom>, RegistryError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, name FROM classrooms ORDER BY id")?;
                let rows = stmt.query_map([], |row| {
                    Ok(Classroom {
                        id: ClassroomId::new(row.get::<_, i64>(0)?.to_string()),
                        name: row.get(1)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(registry_db)
    }

    async fn add_student(
        &self,
        classroom: &ClassroomId,
        name: &str,
        reg_no: &RegistrationNumber,
    ) -> Result<(), RegistryError> {
        validate_label("student name", name)?;
        validate_label("registration number", reg_no.as_str())?;
        let unknown = RegistryError::UnknownClassroom(classroom.clone());
        let Some(id) = row_id(classroom) else {
            return Err(unknown);
        };
        let (name, reg) = (name.to_string(), reg_no.clone());

        self.conn
            .call(move |conn| -> CallResult<(), RegistryError> {
                if !classroom_exists(conn, id)? {
                    return Ok(Err(unknown));
                }
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO students (classroom_id, reg_no, name) VALUES (?1, ?2, ?3)",
                    params![id, reg.as_str(), name],
                )?;
                if inserted == 0 {
                    return Ok(Err(RegistryError::DuplicateRegNo(reg)));
                }
                Ok(Ok(()))
            })
            .await
            .map_err(registry_db)??;

        tracing::info!(classroom = %classroom, reg_no = %reg_no, "student enrolled");
        Ok(())
    }

    async fn bind_account(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
        account: &Account,
    ) -> Result<(), RegistryError> {
        validate_label("account", account.as_str())?;
        let unknown = RegistryError::UnknownClassroom(classroom.clone());
        let Some(id) = row_id(classroom) else {
            return Err(unknown);
        };
        let (reg, acct) = (reg_no.clone(), account.clone());

        self.conn
            .call(move |conn| -> CallResult<(), RegistryError> {
                let tx = conn.transaction()?;
                if !classroom_exists(&tx, id)? {
                    return Ok(Err(unknown));
                }
                let holder: Option<String> = tx
                    .query_row(
                        "SELECT reg_no FROM students WHERE classroom_id = ?1 AND account = ?2",
                        params![id, acct.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if holder.is_some_and(|holder| holder != reg.as_str()) {
                    return Ok(Err(RegistryError::AccountInUse(acct)));
                }
                let updated = tx.execute(
                    "UPDATE students SET account = ?3 WHERE classroom_id = ?1 AND reg_no = ?2",
                    params![id, reg.as_str(), acct.as_str()],
                )?;
                if updated == 0 {
                    return Ok(Err(RegistryError::UnknownStudent(reg)));
                }
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(registry_db)??;

        tracing::info!(classroom = %classroom, reg_no = %reg_no, account = %account, "account bound");
        Ok(())
    }

    async fn students(&self, classroom: &ClassroomId) -> Result<Vec<Student>, RegistryError> {
        let unknown = RegistryError::UnknownClassroom(classroom.clone());
        let Some(id) = row_id(classroom) else {
            return Err(unknown);
        };

        self.conn
            .call(move |conn| -> CallResult<Vec<Student>, RegistryError> {
                if !classroom_exists(conn, id)? {
                    return Ok(Err(unknown));
                }
                let mut stmt = conn.prepare(
                    "SELECT reg_no, name, account FROM students WHERE classroom_id = ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    Ok(Student {
                        reg_no: RegistrationNumber::new(row.get::<_, String>(0)?),
                        name: row.get(1)?,
                        account: row.get::<_, Option<String>>(2)?.map(Account::new),
                    })
                })?;
                Ok(Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?))
            })
            .await
            .map_err(registry_db)?
    }
}

#[async_trait]
impl DirectoryService for SqliteLedger {
    async fn account_for(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
    ) -> Result<Option<Account>, DirectoryError> {
        let Some(id) = row_id(classroom) else {
            return Ok(None);
        };
        let reg = reg_no.clone();

        self.conn
            .call(move |conn| {
                let account: Option<Option<String>> = conn
                    .query_row(
                        "SELECT account FROM students WHERE classroom_id = ?1 AND reg_no = ?2",
                        params![id, reg.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(account.flatten().map(Account::new))
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "directory query failed");
                DirectoryError::Unavailable(e.to_string())
            })
    }
}

#[async_trait]
impl AttendanceLedger for SqliteLedger {
    async fn marked_students(
        &self,
        classroom: &ClassroomId,
    ) -> Result<Vec<MarkedStudent>, LedgerError> {
        let unknown = LedgerError::UnknownClassroom(classroom.clone());
        let Some(id) = row_id(classroom) else {
            return Err(unknown);
        };

        self.conn
            .call(move |conn| -> CallResult<Vec<MarkedStudent>, LedgerError> {
                if !classroom_exists(conn, id)? {
                    return Ok(Err(unknown));
                }
                let mut stmt = conn.prepare(
                    "SELECT account, reg_no, marked_at FROM attendance
                     WHERE classroom_id = ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    Ok(MarkedStudent {
                        account: Account::new(row.get::<_, String>(0)?),
                        reg_no: Some(RegistrationNumber::new(row.get::<_, String>(1)?)),
                        marked_at: parse_timestamp(&row.get::<_, String>(2)?),
                    })
                })?;
                Ok(Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?))
            })
            .await
            .map_err(ledger_db)?
    }

    async fn mark_attendance(
        &self,
        classroom: &ClassroomId,
        account: &Account,
    ) -> Result<(), LedgerError> {
        let unknown = LedgerError::UnknownClassroom(classroom.clone());
        let Some(id) = row_id(classroom) else {
            return Err(unknown);
        };
        let acct = account.clone();
        let marked_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| -> CallResult<(), LedgerError> {
                let tx = conn.transaction()?;
                if !classroom_exists(&tx, id)? {
                    return Ok(Err(unknown));
                }
                let reg_no: Option<String> = tx
                    .query_row(
                        "SELECT reg_no FROM students WHERE classroom_id = ?1 AND account = ?2",
                        params![id, acct.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(reg_no) = reg_no else {
                    return Ok(Err(LedgerError::Rejected(format!("{acct} is not enrolled"))));
                };
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO attendance (classroom_id, account, reg_no, marked_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, acct.as_str(), reg_no, marked_at],
                )?;
                tx.commit()?;
                if inserted == 0 {
                    return Ok(Err(LedgerError::AlreadyExists));
                }
                Ok(Ok(()))
            })
            .await
            .map_err(ledger_db)?
    }
}
