// Scripted in-memory connections for unit tests
// Every statement is recorded; replies come from a caller-supplied responder

use crate::db::connection::{Connection, ConnectionManager};
use crate::db::value::{Row, Value};
use crate::errors::DatabaseError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What a scripted statement returns
pub enum Reply {
    Affected(u64),
    Rows(Vec<Row>),
}

type Responder = dyn Fn(&str, &[Value]) -> Result<Reply, DatabaseError> + Send + Sync;

struct Shared {
    log: Mutex<Vec<(String, Vec<Value>)>>,
    responder: Mutex<Arc<Responder>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_connect: AtomicBool,
}

#[derive(Clone)]
pub struct ScriptedManager {
    shared: Arc<Shared>,
}

impl ScriptedManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                log: Mutex::new(Vec::new()),
                responder: Mutex::new(Arc::new(|_: &str, _: &[Value]| {
                    Ok::<_, DatabaseError>(Reply::Affected(0))
                })),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<Reply, DatabaseError> + Send + Sync + 'static,
    {
        *self.shared.responder.lock().unwrap() = Arc::new(responder);
        self
    }

    pub fn into_dyn(self) -> Arc<dyn ConnectionManager> {
        Arc::new(self)
    }

    pub fn statements(&self) -> Vec<String> {
        self.shared
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.shared.log.lock().unwrap().clear();
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionManager for ScriptedManager {
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(DatabaseError::connection("scripted handshake failure"));
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            shared: self.shared.clone(),
            broken: false,
        }))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

pub struct ScriptedConnection {
    shared: Arc<Shared>,
    broken: bool,
}

impl ScriptedConnection {
    fn run(&mut self, sql: &str, args: &[Value]) -> Result<Reply, DatabaseError> {
        self.shared
            .log
            .lock()
            .unwrap()
            .push((sql.to_string(), args.to_vec()));
        let responder = self.shared.responder.lock().unwrap().clone();
        let reply = (*responder)(sql, args);
        if let Err(e) = &reply {
            if e.is_connection_failure() {
                self.broken = true;
            }
        }
        reply
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DatabaseError> {
        match self.run(sql, args)? {
            Reply::Affected(n) => Ok(n),
            Reply::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    async fn fetch(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        match self.run(sql, args)? {
            Reply::Affected(_) => Ok(Vec::new()),
            Reply::Rows(rows) => Ok(rows),
        }
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), DatabaseError> {
        self.run(sql, &[]).map(|_| ())
    }

    async fn ping(&mut self) -> Result<(), DatabaseError> {
        self.run("<ping>", &[]).map(|_| ())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    async fn close(self: Box<Self>) -> Result<(), DatabaseError> {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Build a row from `(column, value)` pairs
pub fn row<const N: usize>(columns: [(&str, Value); N]) -> Row {
    Row::new(
        columns
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}
