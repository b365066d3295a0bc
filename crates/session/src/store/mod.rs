//! SQLite store for sessions and everything they own.
//!
//! One connection behind a mutex, queries hopped onto the blocking pool.
//! Timestamps are RFC 3339 text, booleans are 0/1 integers, JSON columns
//! are text.

pub mod audit_repo;
pub mod binding_repo;
pub mod extras_repo;
pub mod identity_repo;
pub mod message_repo;
pub mod schema;
pub mod session_repo;

use berth_core::error::{PlatformError, PlatformResult};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use binding_repo::ChannelBinding;
pub use session_repo::SessionRecord;

/// Shared connection handle used by every repository.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Db {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn run<F, R>(&self, f: F) -> PlatformResult<R>
    where
        F: FnOnce(&mut Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn_arc = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn_arc.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| PlatformError::Store(format!("task execution failed: {e}")))?
        .map_err(|e| PlatformError::Store(e.to_string()))
    }
}

/// All repositories over one database.
#[derive(Clone)]
pub struct SessionStore {
    pub sessions: session_repo::SessionRepo,
    pub messages: message_repo::MessageRepo,
    pub bindings: binding_repo::BindingRepo,
    pub audit: audit_repo::AuditRepo,
    pub identity: identity_repo::IdentityRepo,
    pub extras: extras_repo::ExtrasRepo,
    db: Db,
}

impl SessionStore {
    pub fn open(path: &Path) -> PlatformResult<Self> {
        let mut conn = Connection::open(path)
            .map_err(|e| PlatformError::Store(format!("open {}: {e}", path.display())))?;
        schema::init_schema(&mut conn).map_err(|e| PlatformError::Store(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> PlatformResult<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| PlatformError::Store(e.to_string()))?;
        schema::init_schema(&mut conn).map_err(|e| PlatformError::Store(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let db = Db::new(conn);
        SessionStore {
            sessions: session_repo::SessionRepo::new(db.clone()),
            messages: message_repo::MessageRepo::new(db.clone()),
            bindings: binding_repo::BindingRepo::new(db.clone()),
            audit: audit_repo::AuditRepo::new(db.clone()),
            identity: identity_repo::IdentityRepo::new(db.clone()),
            extras: extras_repo::ExtrasRepo::new(db.clone()),
            db,
        }
    }

    /// The underlying handle, for sibling stores sharing this database.
    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

pub(crate) fn format_ts(ts: &OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub(crate) fn parse_ts(raw: &str) -> OffsetDateTime {
    OffsetDateTime::parse(raw, &Rfc3339).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
