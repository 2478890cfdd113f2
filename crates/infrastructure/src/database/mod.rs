use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use domain::DomainError;

pub mod schema;
pub use schema::*;

pub type SqlitePool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

const CREATE_PIECE_COMPLETION: &str = "CREATE TABLE IF NOT EXISTS piece_completion (
    info_hash TEXT NOT NULL,
    piece_index INTEGER NOT NULL,
    complete BOOLEAN NOT NULL,
    PRIMARY KEY (info_hash, piece_index)
)";

/// Verifier workers record completion concurrently; wait for the write lock
/// instead of failing with `database is locked`.
#[derive(Debug)]
struct BusyTimeout;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for BusyTimeout {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        diesel::sql_query("PRAGMA busy_timeout = 5000")
            .execute(conn)
            .map(|_| ())
            .map_err(r2d2::Error::QueryError)
    }
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the SQLite file at `database_path` and make
    /// sure the schema exists.
    pub fn new(database_path: &str) -> Result<Self, DomainError> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_path);
        let pool = r2d2::Pool::builder()
            .connection_customizer(Box::new(BusyTimeout))
            .build(manager)
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?;

        let mut conn = pool
            .get()
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?;
        diesel::sql_query(CREATE_PIECE_COMPLETION)
            .execute(&mut conn)
            .map_err(|e| DomainError::RepositoryError(e.to_string()))?;

        Ok(Database { pool })
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}
