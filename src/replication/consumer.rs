//! The replication consumer: connects in replication mode, runs the
//! receive loop on a blocking thread (libpq is synchronous), decodes
//! tuples, and feeds `ChangeEvent`s into a bounded queue.

use crate::config::SourceConfig;
use crate::errors::{CdcError, CdcResult};
use crate::model::{ChangeEvent, Operation, Row, Value};
use crate::replication::checkpoint;
use crate::replication::connection::PGConnection;
use crate::replication::protocol::{
    self, KeepaliveMessage, LogicalMessage, Oid, RawColumn, RawTuple, StandbyStatusUpdate,
    XLogDataMessage,
};
use crate::replication::state::ReplicationState;
use chrono::{DateTime, NaiveDateTime};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const QUEUE_CAPACITY: usize = 100;
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub struct ReplicationConsumer {
    source: SourceConfig,
    checkpoint_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl ReplicationConsumer {
    pub fn new(source: SourceConfig, checkpoint_path: PathBuf) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self { source, checkpoint_path, shutdown_tx, shutdown_rx, worker: None }
    }

    /// Opens the replication connection, resumes from the persisted LSN,
    /// and returns a bounded receiver of change events. The worker runs
    /// on a blocking thread since libpq is synchronous.
    pub async fn start(&mut self) -> CdcResult<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let source = self.source.clone();
        let checkpoint_path = self.checkpoint_path.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = run_receive_loop(source, checkpoint_path, shutdown_rx, tx) {
                error!(error = %e, "replication consumer worker terminated with error");
            }
        });
        self.worker = Some(handle);

        Ok(rx)
    }

    /// Signals shutdown, waits for the worker to drain, and closes the
    /// upstream connection (dropped inside the worker).
    pub async fn stop(&mut self) -> CdcResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.take() {
            handle.await?;
        }
        Ok(())
    }
}

fn system_time_to_postgres_timestamp(time: SystemTime) -> i64 {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

fn run_receive_loop(
    source: SourceConfig,
    checkpoint_path: PathBuf,
    mut shutdown_rx: watch::Receiver<bool>,
    tx: mpsc::Sender<ChangeEvent>,
) -> CdcResult<()> {
    let connection = PGConnection::connect(&source.connection_string())?;

    let starting_lsn = checkpoint::read_checkpoint(&checkpoint_path)?;
    let start_replication_sql = format!(
        "START_REPLICATION SLOT \"{}\" LOGICAL {} (proto_version '1', publication_names '{}');",
        source.slot_name,
        checkpoint::format_lsn(starting_lsn),
        source.publication_name
    );

    info!(slot = %source.slot_name, publication = %source.publication_name, "starting replication");
    let result = connection.exec(&start_replication_sql)?;
    if !result.copy_both() {
        return Err(CdcError::connection(format!(
            "failed to start replication: {:?}",
            result.status()
        )));
    }

    let mut state = ReplicationState::new();
    state.received_lsn = starting_lsn;
    state.last_feedback_time = Instant::now();

    loop {
        if *shutdown_rx.borrow() {
            info!("shutdown signalled, exiting replication worker");
            break;
        }

        if state.last_feedback_time.elapsed() >= HEARTBEAT_INTERVAL {
            send_standby_status(&connection, &state, false)?;
            state.last_feedback_time = Instant::now();
        }

        match poll_copy_data_with_timeout(&connection, &mut shutdown_rx)? {
            None => continue, // receive timeout; not an error
            Some(None) => {
                info!("replication stream closed by server");
                break;
            }
            Some(Some(data)) => {
                if data.is_empty() {
                    continue;
                }
                match data[0] as char {
                    'w' => {
                        if let Err(e) = handle_xlog_data(&data, &connection, &mut state, &checkpoint_path, &tx) {
                            error!(error = %e, "failed to handle XLogData frame, skipping");
                        }
                    }
                    'k' => {
                        if let Err(e) = handle_keepalive(&data, &connection, &state) {
                            error!(error = %e, "failed to handle keepalive frame, skipping");
                        }
                    }
                    other => warn!(byte = %other, "unknown CopyData frame type, skipping"),
                }
            }
        }
    }

    Ok(())
}

/// Polls for the next `CopyData` frame, giving up (without error) after
/// roughly `RECEIVE_TIMEOUT` has elapsed so the loop can re-check the
/// heartbeat timer and the shutdown signal.
fn poll_copy_data_with_timeout(
    connection: &PGConnection,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> CdcResult<Option<Option<Vec<u8>>>> {
    let deadline = Instant::now() + RECEIVE_TIMEOUT;
    loop {
        if *shutdown_rx.borrow() {
            return Ok(Some(None));
        }
        match connection.poll_copy_data()? {
            Some(result) => return Ok(Some(result)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(RECEIVE_POLL_INTERVAL);
            }
        }
    }
}

fn handle_keepalive(data: &[u8], connection: &PGConnection, state: &ReplicationState) -> CdcResult<()> {
    let keepalive = KeepaliveMessage::parse(data)?;
    if keepalive.reply_requested {
        debug!("keepalive requested immediate reply");
        send_standby_status(connection, state, false)?;
    }
    Ok(())
}

fn send_standby_status(connection: &PGConnection, state: &ReplicationState, reply_requested: bool) -> CdcResult<()> {
    let update = StandbyStatusUpdate {
        write_lsn: state.received_lsn,
        flush_lsn: state.received_lsn,
        apply_lsn: state.applied_lsn,
        client_time: system_time_to_postgres_timestamp(SystemTime::now()),
        reply_requested,
    };
    let payload = update.encode()?;
    connection.put_copy_data(&payload)?;
    connection.flush()?;
    Ok(())
}

fn handle_xlog_data(
    data: &[u8],
    connection: &PGConnection,
    state: &mut ReplicationState,
    checkpoint_path: &std::path::Path,
    tx: &mpsc::Sender<ChangeEvent>,
) -> CdcResult<()> {
    let xlog = XLogDataMessage::parse(data)?;
    state.update_received_lsn(xlog.wal_start);

    let message = match protocol::parse_logical_message(&xlog.data) {
        Ok(message) => message,
        Err(e) => {
            // Per the error-handling design: log and skip, do not advance
            // past this frame's LSN semantics beyond what we already took.
            error!(error = %e, "failed to parse logical replication message, skipping");
            return Ok(());
        }
    };

    debug!(kind = message.kind(), lsn = %checkpoint::format_lsn(state.received_lsn), "dispatching logical message");

    match message {
        LogicalMessage::Relation(relation) => state.upsert_relation(relation),
        LogicalMessage::Insert { relation_id, new_tuple } => {
            emit_change(state, tx, relation_id, Operation::Insert, None, Some(new_tuple))?;
        }
        LogicalMessage::Update { relation_id, old_tuple, new_tuple } => {
            emit_change(state, tx, relation_id, Operation::Update, old_tuple, Some(new_tuple))?;
        }
        LogicalMessage::Delete { relation_id, old_tuple } => {
            emit_change(state, tx, relation_id, Operation::Delete, Some(old_tuple), None)?;
        }
        LogicalMessage::Commit { end_lsn, .. } => {
            state.update_received_lsn(end_lsn);
            if let Err(e) = checkpoint::write_checkpoint(checkpoint_path, state.received_lsn) {
                error!(error = %e, "failed to persist checkpoint, continuing");
            }
            state.applied_lsn = state.received_lsn;
        }
        LogicalMessage::Begin { .. }
        | LogicalMessage::Truncate
        | LogicalMessage::Origin
        | LogicalMessage::Type
        | LogicalMessage::StreamStart
        | LogicalMessage::StreamStop
        | LogicalMessage::StreamCommit { .. }
        | LogicalMessage::StreamAbort => {}
    }

    send_standby_status(connection, state, false)?;
    Ok(())
}

fn emit_change(
    state: &ReplicationState,
    tx: &mpsc::Sender<ChangeEvent>,
    relation_id: Oid,
    operation: Operation,
    before_tuple: Option<RawTuple>,
    after_tuple: Option<RawTuple>,
) -> CdcResult<()> {
    let relation = match state.get_relation(relation_id) {
        Some(r) => r,
        None => {
            error!(relation_id, "data message referenced unknown relation, dropping event");
            return Ok(());
        }
    };

    let before = before_tuple.map(|t| decode_row(&t, relation));
    let after = after_tuple.map(|t| decode_row(&t, relation));

    let event = ChangeEvent {
        operation,
        namespace: relation.namespace.clone(),
        table: relation.name.clone(),
        before,
        after,
        lsn: checkpoint::format_lsn(state.received_lsn),
        route: String::new(),
        pk: relation.key_columns(),
    };

    // Blocking offer: backpressure from downstream throttles the upstream
    // read loop, which is the whole point of the bounded queue.
    if tx.blocking_send(event).is_err() {
        warn!("output queue closed, dropping event");
    }
    Ok(())
}

/// Decodes a tuple into a column-name keyed row, per the OID-directed
/// table in the replication consumer's contract. Unchanged-TOAST columns
/// are omitted from the map entirely.
fn decode_row(tuple: &RawTuple, relation: &crate::model::RelationDescriptor) -> Row {
    let mut row = Row::new();
    for (column, raw) in relation.columns.iter().zip(tuple.columns.iter()) {
        match raw {
            RawColumn::Null => {
                row.insert(column.name.clone(), Value::Null);
            }
            RawColumn::UnchangedToast => {
                // policy: omit from the decoded map
            }
            RawColumn::Text(text) => {
                row.insert(column.name.clone(), decode_value(column.type_oid, text));
            }
        }
    }
    row
}

fn decode_value(type_oid: Oid, text: &str) -> Value {
    match type_oid {
        16 => Value::Bool(text == "t" || text == "true"),
        20 => text.parse::<i64>().map(Value::I64).unwrap_or_else(|_| Value::Text(text.to_string())),
        23 => text.parse::<i32>().map(Value::I32).unwrap_or_else(|_| Value::Text(text.to_string())),
        25 | 1043 => Value::Text(text.to_string()),
        701 => text.parse::<f64>().map(Value::F64).unwrap_or_else(|_| Value::Text(text.to_string())),
        1114 => parse_timestamp(text).unwrap_or_else(|| Value::Text(text.to_string())),
        1184 => parse_timestamptz(text).unwrap_or_else(|| Value::Text(text.to_string())),
        1700 => text.parse::<f64>().map(Value::F64).unwrap_or_else(|_| Value::Text(text.to_string())),
        _ => Value::Text(text.to_string()),
    }
}

/// Parses a `timestamp without time zone` text value, rendered the way
/// postgres's text output format emits it (`YYYY-MM-DD HH:MM:SS[.ffffff]`).
fn parse_timestamp(text: &str) -> Option<Value> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| Value::Text(dt.to_string()))
}

/// Parses a `timestamp with time zone` text value and normalizes it to
/// RFC3339.
fn parse_timestamptz(text: &str) -> Option<Value> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| Value::Text(dt.to_rfc3339()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnDescriptor, RelationDescriptor};

    fn sample_relation() -> RelationDescriptor {
        RelationDescriptor {
            relation_id: 1,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: 'd',
            columns: vec![
                ColumnDescriptor { name: "id".to_string(), type_oid: 23, is_key: true },
                ColumnDescriptor { name: "active".to_string(), type_oid: 16, is_key: false },
                ColumnDescriptor { name: "score".to_string(), type_oid: 701, is_key: false },
            ],
        }
    }

    #[test]
    fn decodes_typed_columns() {
        let relation = sample_relation();
        let tuple = RawTuple {
            columns: vec![
                RawColumn::Text("5".to_string()),
                RawColumn::Text("t".to_string()),
                RawColumn::Text("3.5".to_string()),
            ],
            consumed: 0,
        };
        let row = decode_row(&tuple, &relation);
        assert_eq!(row.get("id"), Some(&Value::I32(5)));
        assert_eq!(row.get("active"), Some(&Value::Bool(true)));
        assert_eq!(row.get("score"), Some(&Value::F64(3.5)));
    }

    #[test]
    fn null_column_decodes_to_null_value() {
        let relation = sample_relation();
        let tuple = RawTuple {
            columns: vec![RawColumn::Null, RawColumn::Text("t".to_string()), RawColumn::Text("1.0".to_string())],
            consumed: 0,
        };
        let row = decode_row(&tuple, &relation);
        assert_eq!(row.get("id"), Some(&Value::Null));
    }

    #[test]
    fn unchanged_toast_column_is_omitted() {
        let relation = sample_relation();
        let tuple = RawTuple {
            columns: vec![
                RawColumn::Text("5".to_string()),
                RawColumn::UnchangedToast,
                RawColumn::Text("1.0".to_string()),
            ],
            consumed: 0,
        };
        let row = decode_row(&tuple, &relation);
        assert!(!row.contains_key("active"));
    }

    #[test]
    fn malformed_int_degrades_to_raw_string_not_error() {
        assert_eq!(decode_value(23, "not-a-number"), Value::Text("not-a-number".to_string()));
    }

    #[test]
    fn unknown_oid_passes_through_as_string() {
        assert_eq!(decode_value(9999, "anything"), Value::Text("anything".to_string()));
    }

    #[test]
    fn timestamp_parses_via_chrono() {
        match decode_value(1114, "2024-03-01 12:30:00") {
            Value::Text(s) => assert_eq!(s, "2024-03-01 12:30:00"),
            other => panic!("expected Text, got {:?}", other),
        }
    }

    #[test]
    fn timestamptz_normalizes_to_rfc3339() {
        match decode_value(1184, "2024-03-01 12:30:00+00") {
            Value::Text(s) => assert!(s.starts_with("2024-03-01T12:30:00")),
            other => panic!("expected Text, got {:?}", other),
        }
    }

    #[test]
    fn malformed_timestamp_degrades_to_raw_string() {
        assert_eq!(decode_value(1114, "not-a-timestamp"), Value::Text("not-a-timestamp".to_string()));
        assert_eq!(decode_value(1184, "not-a-timestamp"), Value::Text("not-a-timestamp".to_string()));
    }
}
