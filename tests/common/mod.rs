//! Recording transport shared by the integration tests.
//!
//! Every statement a connection sends is appended to a shared log, so tests
//! can assert the exact sequence (`BEGIN`, the query, `COMMIT`, ...) that
//! reached the "server". Fetch results are scripted in advance.

#![allow(dead_code)]

use async_trait::async_trait;
use pgtemplate::db::{ConnectionSource, RawListener, RawRow, Transport};
use pgtemplate::models::{CommandStatus, QueryParam, RawNotification};
use pgtemplate::{DbError, DbResult};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct MockState {
    pub log: Vec<String>,
    pub args: Vec<Vec<QueryParam>>,
    pub timeouts: Vec<Option<Duration>>,
    pub responses: VecDeque<Vec<RawRow>>,
    pub rows_affected: u64,
    /// Statements starting with this prefix fail with a database error.
    pub fail_on: Option<String>,
    /// Fetches starting with this prefix never complete.
    pub hang_on: Option<String>,
    pub listeners: Vec<(String, Arc<dyn RawListener>)>,
    pub acquired: usize,
    pub released: usize,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<MockState>>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn args(&self) -> Vec<Vec<QueryParam>> {
        self.state.lock().unwrap().args.clone()
    }

    pub fn timeouts(&self) -> Vec<Option<Duration>> {
        self.state.lock().unwrap().timeouts.clone()
    }

    pub fn push_rows(&self, rows: Vec<JsonValue>) {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                JsonValue::Object(map) => map,
                other => panic!("row must be a JSON object, got {other}"),
            })
            .collect();
        self.state.lock().unwrap().responses.push_back(rows);
    }

    pub fn set_rows_affected(&self, n: u64) {
        self.state.lock().unwrap().rows_affected = n;
    }

    pub fn fail_on(&self, prefix: &str) {
        self.state.lock().unwrap().fail_on = Some(prefix.to_string());
    }

    pub fn hang_on(&self, prefix: &str) {
        self.state.lock().unwrap().hang_on = Some(prefix.to_string());
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().unwrap().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().unwrap().released
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Deliver a notification to every listener on `channel`, in registration order.
    pub async fn notify(&self, channel: &str, payload: &str) {
        let targets: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .listeners
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in targets {
            listener
                .notify(RawNotification {
                    process_id: 4242,
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .await;
        }
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport { mock: self.clone() }
    }

    pub fn source(&self) -> MockSource {
        MockSource { mock: self.clone() }
    }

    fn record(
        &self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());
        state.args.push(args.to_vec());
        state.timeouts.push(timeout);
        match &state.fail_on {
            Some(prefix) if sql.starts_with(prefix.as_str()) => Err(DbError::database(
                format!("mock failure on {sql}"),
                Some("XX000".to_string()),
                "",
            )),
            _ => Ok(()),
        }
    }

    async fn maybe_hang(&self, sql: &str) {
        let hangs = matches!(
            &self.state.lock().unwrap().hang_on,
            Some(prefix) if sql.starts_with(prefix.as_str())
        );
        if hangs {
            std::future::pending::<()>().await;
        }
    }

    fn next_rows(&self) -> Vec<RawRow> {
        self.state
            .lock()
            .unwrap()
            .responses
            .pop_front()
            .unwrap_or_default()
    }
}

pub struct MockTransport {
    mock: Mock,
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<CommandStatus> {
        self.mock.record(sql, args, timeout)?;
        let command = sql.split_whitespace().next().unwrap_or("").to_uppercase();
        let rows = self.mock.state.lock().unwrap().rows_affected;
        Ok(CommandStatus::new(command, rows))
    }

    async fn fetch(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<Vec<RawRow>> {
        self.mock.record(sql, args, timeout)?;
        self.mock.maybe_hang(sql).await;
        Ok(self.mock.next_rows())
    }

    async fn fetchrow(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        timeout: Option<Duration>,
    ) -> DbResult<Option<RawRow>> {
        self.mock.record(sql, args, timeout)?;
        self.mock.maybe_hang(sql).await;
        Ok(self.mock.next_rows().into_iter().next())
    }

    async fn fetchval(
        &mut self,
        sql: &str,
        args: &[QueryParam],
        column: usize,
        timeout: Option<Duration>,
    ) -> DbResult<JsonValue> {
        self.mock.record(sql, args, timeout)?;
        Ok(self
            .mock
            .next_rows()
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().nth(column).map(|(_, v)| v))
            .unwrap_or(JsonValue::Null))
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.mock.record("BEGIN", &[], None)
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.mock.record("COMMIT", &[], None)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.mock.record("ROLLBACK", &[], None)
    }

    async fn add_listener(
        &mut self,
        channel: &str,
        listener: Arc<dyn RawListener>,
    ) -> DbResult<()> {
        self.mock.record(&format!("LISTEN {channel}"), &[], None)?;
        self.mock
            .state
            .lock()
            .unwrap()
            .listeners
            .push((channel.to_string(), listener));
        Ok(())
    }

    async fn remove_listener(
        &mut self,
        channel: &str,
        listener: &Arc<dyn RawListener>,
    ) -> DbResult<()> {
        self.mock.record(&format!("UNLISTEN {channel}"), &[], None)?;
        self.mock
            .state
            .lock()
            .unwrap()
            .listeners
            .retain(|(c, l)| !(c == channel && Arc::ptr_eq(l, listener)));
        Ok(())
    }
}

pub struct MockSource {
    mock: Mock,
}

#[async_trait]
impl ConnectionSource for MockSource {
    type Transport = MockTransport;

    async fn acquire(&self) -> DbResult<MockTransport> {
        self.mock.state.lock().unwrap().acquired += 1;
        Ok(self.mock.transport())
    }

    async fn release(&self, _transport: MockTransport) {
        let mut state = self.mock.state.lock().unwrap();
        state.released += 1;
        state.log.push("RELEASE".to_string());
    }

    async fn close(&self) {
        self.mock.state.lock().unwrap().closed = true;
    }
}
