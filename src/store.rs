use crate::telemetry::{InverterStatus, Reading};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const INSERT_READING: &str = r#"
    INSERT INTO iot_data (
        device, timestamp, pro_ver, minor_ver, sn, model,
        tyield, dyield, pf, pmax, pac, sac,
        uab, ubc, uca, ia, ib, ic, freq,
        tmod, tamb, mode, qac, bus_capacitance,
        ac_capacitance, pdc, pmax_lim, smax_lim
    ) VALUES (
        $1, $2, $3, $4, $5, $6,
        $7, $8, $9, $10, $11, $12,
        $13, $14, $15, $16, $17, $18, $19,
        $20, $21, $22, $23, $24,
        $25, $26, $27, $28
    )
"#;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("store connection lost: {0}")]
    ConnectionLost(String),
    #[error("store rejected row (sqlstate {code}): {message}")]
    ConstraintViolation { code: String, message: String },
    #[error("store error: {0}")]
    Store(String),
}

impl WriteError {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteError::ConnectionLost(_) => "connection_lost",
            WriteError::ConstraintViolation { .. } => "constraint_violation",
            WriteError::Store(_) => "store",
        }
    }
}

impl From<sqlx::Error> for WriteError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => WriteError::ConnectionLost(err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|code| code.into_owned()).unwrap_or_default();
                match code.get(..2) {
                    // integrity constraint, data exception, undefined/invalid schema object
                    Some("23") | Some("22") | Some("42") => WriteError::ConstraintViolation {
                        code,
                        message: db.message().to_string(),
                    },
                    // connection exception, operator intervention (server shutting down)
                    Some("08") | Some("57") => WriteError::ConnectionLost(err.to_string()),
                    _ => WriteError::Store(err.to_string()),
                }
            }
            _ => WriteError::Store(err.to_string()),
        }
    }
}

/// Destination for decoded readings.
///
/// Implementations must tolerate concurrent `insert` calls; the pipeline layers
/// no locking of its own on top of the store.
pub trait ReadingStore: Clone + Send + Sync + 'static {
    /// Persists one reading as exactly one row. Never retries.
    fn insert(&self, reading: Reading) -> impl Future<Output = Result<(), WriteError>> + Send;

    /// Single round trip used as the startup liveness check.
    fn ping(&self) -> impl Future<Output = Result<(), WriteError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens one direct connection first so an unreachable server fails with
    /// its own error rather than a pool acquire timeout.
    pub async fn connect(options: PgConnectOptions, max_connections: u32) -> Result<Self, WriteError> {
        PgConnection::connect_with(&options).await?.close().await?;
        let pool = build_pool(options, max_connections).await?;
        Ok(Self::new(pool))
    }
}

impl ReadingStore for PgReadingStore {
    async fn insert(&self, reading: Reading) -> Result<(), WriteError> {
        let Reading {
            device,
            timestamp,
            pro_ver,
            minor_ver,
            sn,
            model,
            status,
        } = reading;
        let InverterStatus {
            tyield,
            dyield,
            pf,
            pmax,
            pac,
            sac,
            uab,
            ubc,
            uca,
            ia,
            ib,
            ic,
            freq,
            tmod,
            tamb,
            mode,
            qac,
            bus_capacitance,
            ac_capacitance,
            pdc,
            pmax_lim,
            smax_lim,
        } = status;

        sqlx::query(INSERT_READING)
            .bind(device)
            .bind(timestamp)
            .bind(pro_ver)
            .bind(minor_ver)
            .bind(sn)
            .bind(model)
            .bind(tyield)
            .bind(dyield)
            .bind(pf)
            .bind(pmax)
            .bind(pac)
            .bind(sac)
            .bind(uab)
            .bind(ubc)
            .bind(uca)
            .bind(ia)
            .bind(ib)
            .bind(ic)
            .bind(freq)
            .bind(tmod)
            .bind(tamb)
            .bind(mode)
            .bind(qac)
            .bind(bus_capacitance)
            .bind(ac_capacitance)
            .bind(pdc)
            .bind(pmax_lim)
            .bind(smax_lim)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), WriteError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn build_pool(options: PgConnectOptions, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}
