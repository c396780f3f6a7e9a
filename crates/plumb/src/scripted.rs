//! An in-memory [`Connection`] for unit tests: records every statement and
//! fails the ones containing a configured marker.

use crate::traced::{BoxFuture, Connection};
use crate::{ConnectionProvider, Result};
use std::sync::{Arc, Mutex};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

/// Every catalog query returns this marker in the log.
pub(crate) const QUERY: &str = "<query>";

pub(crate) struct ScriptedConn {
    log: Log,
    fail_when: Vec<&'static str>,
}

impl ScriptedConn {
    pub(crate) fn new(fail_when: &[&'static str]) -> Self {
        Self {
            log: Log::default(),
            fail_when: fail_when.to_vec(),
        }
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// A server-side error stand-in; tokio-postgres has no public constructor.
pub(crate) fn postgres_error() -> tokio_postgres::Error {
    "port=notaport"
        .parse::<tokio_postgres::Config>()
        .unwrap_err()
}

impl Connection for ScriptedConn {
    fn batch_execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, ()> {
        self.log.lock().unwrap().push(sql.to_string());
        let fail = self.fail_when.iter().any(|marker| sql.contains(marker));
        Box::pin(async move { if fail { Err(postgres_error()) } else { Ok(()) } })
    }

    fn query<'a>(
        &'a self,
        _sql: &'a str,
        _params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Vec<Row>> {
        self.log.lock().unwrap().push(QUERY.to_string());
        Box::pin(async { Err(postgres_error()) })
    }

    fn query_one<'a>(
        &'a self,
        _sql: &'a str,
        _params: &'a [&'a (dyn ToSql + Sync)],
    ) -> BoxFuture<'a, Row> {
        self.log.lock().unwrap().push(QUERY.to_string());
        Box::pin(async { Err(postgres_error()) })
    }
}

/// Hands out [`ScriptedConn`]s that share one statement log.
pub(crate) struct ScriptedProvider {
    pub(crate) log: Log,
    pub(crate) fail_when: Vec<&'static str>,
    pub(crate) refuse: bool,
}

impl ScriptedProvider {
    pub(crate) fn new(fail_when: &[&'static str]) -> Self {
        Self {
            log: Log::default(),
            fail_when: fail_when.to_vec(),
            refuse: false,
        }
    }

    pub(crate) fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(&[])
        }
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ConnectionProvider for ScriptedProvider {
    type Conn = ScriptedConn;

    async fn connect(&self) -> Result<Self::Conn> {
        if self.refuse {
            return Err(crate::Error::Connect("connection refused".to_string()));
        }
        Ok(ScriptedConn {
            log: self.log.clone(),
            fail_when: self.fail_when.clone(),
        })
    }
}
