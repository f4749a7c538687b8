use diesel::sql_types::Integer;
use diesel::{Connection, ConnectionError, RunQueryDsl};
use diesel_tracing::pg::InstrumentedPgConnection;
use mobc::{async_trait, Manager, Pool};
use tracing::{info_span, Instrument};

use crate::error::{Error, Result};

#[derive(QueryableByName)]
struct TestResult {
    #[sql_type = "Integer"]
    #[allow(dead_code)]
    _a: i32,
}

pub struct PgConnectionManager {
    database_url: String,
}

#[async_trait]
impl Manager for PgConnectionManager {
    type Connection = InstrumentedPgConnection;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        InstrumentedPgConnection::establish(&self.database_url)
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        match diesel::sql_query("SELECT 1 as _a").load::<TestResult>(&conn) {
            Ok(_) => Ok(conn),
            Err(_) => Err(ConnectionError::BadConnection(String::from(
                "Failed to select 1.",
            ))),
        }
    }
}

/// mobc pool over instrumented connections. Cloning shares the pool.
#[derive(Clone)]
pub struct DbPool(Pool<PgConnectionManager>);

impl DbPool {
    pub async fn conn(&self) -> Result<mobc::Connection<PgConnectionManager>> {
        self.0
            .get()
            .instrument(info_span!("Acquiring a DB connection."))
            .await
            .map_err(Error::from)
    }
}

pub fn establish_connection_pool(database_url: &str) -> DbPool {
    DbPool(
        Pool::builder().max_open(30).build(PgConnectionManager {
            database_url: database_url.to_string(),
        }),
    )
}
