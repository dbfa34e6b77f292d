//! Logical replication wire protocol: `CopyData` frame headers and the
//! pgoutput-shaped logical messages they carry.
//!
//! https://www.postgresql.org/docs/current/protocol-replication.html
//! https://www.postgresql.org/docs/current/protocol-logical-replication.html

use crate::errors::{CdcError, CdcResult};
use crate::replication::buffer::{BufferReader, BufferWriter};
use tracing::debug;

pub type Oid = u32;
pub type Xid = u32;

/// XLogData (B): `'w'` + wal_start + wal_end + send_time + payload.
pub struct XLogDataMessage {
    pub wal_start: u64,
    pub wal_end: u64,
    pub send_time: u64,
    pub data: Vec<u8>,
}

impl XLogDataMessage {
    pub fn parse(frame: &[u8]) -> CdcResult<Self> {
        if frame.len() < 25 {
            return Err(CdcError::protocol("XLogData frame too short"));
        }
        let mut reader = BufferReader::new(frame);
        let _type = reader.read_char()?;
        let wal_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_u64()?;
        let data = reader.read_bytes(reader.remaining())?;
        Ok(Self { wal_start, wal_end, send_time, data })
    }
}

/// Primary keepalive message (B): `'k'` + end_lsn + send_time + reply_requested.
pub struct KeepaliveMessage {
    pub end_lsn: u64,
    pub send_time: u64,
    pub reply_requested: bool,
}

impl KeepaliveMessage {
    pub fn parse(frame: &[u8]) -> CdcResult<Self> {
        if frame.len() < 18 {
            return Err(CdcError::protocol("keepalive frame too short"));
        }
        let mut reader = BufferReader::new(frame);
        let _type = reader.read_char()?;
        let end_lsn = reader.read_u64()?;
        let send_time = reader.read_u64()?;
        let reply_requested = reader.read_u8()? != 0;
        Ok(Self { end_lsn, send_time, reply_requested })
    }
}

/// Standby status update (F): `'r'` + write + flush + apply + client_time + reply_requested.
pub struct StandbyStatusUpdate {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub client_time: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Serializes into a 34-byte `CopyData` payload ready for `put_copy_data`.
    pub fn encode(&self) -> CdcResult<[u8; 34]> {
        let mut buf = [0u8; 34];
        {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u8(b'r')?;
            writer.write_u64(self.write_lsn)?;
            writer.write_u64(self.flush_lsn)?;
            writer.write_u64(self.apply_lsn)?;
            writer.write_i64(self.client_time)?;
            writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
            if writer.bytes_written() != buf.len() {
                return Err(CdcError::protocol("short write encoding standby status update"));
            }
        }
        Ok(buf)
    }
}

/// Per-column wire representation inside a tuple: NULL, unchanged TOAST,
/// or textual data.
#[derive(Debug, Clone)]
pub enum RawColumn {
    Null,
    UnchangedToast,
    Text(String),
}

#[derive(Debug, Clone)]
pub struct RawTuple {
    pub columns: Vec<RawColumn>,
    /// Bytes consumed parsing this tuple; callers can use it to advance
    /// past this tuple when another one follows in the same message.
    pub consumed: usize,
}

#[derive(Debug, Clone)]
pub struct RawColumnInfo {
    pub is_key: bool,
    pub name: String,
    pub type_oid: Oid,
    pub atttypmod: i32,
}

#[derive(Debug, Clone)]
pub struct RawRelation {
    pub oid: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: char,
    pub columns: Vec<RawColumnInfo>,
}

/// A decoded pgoutput logical message. Streaming variants are recognized
/// but carry no tuple data the pipeline cares about.
#[derive(Debug)]
pub enum LogicalMessage {
    Begin { final_lsn: u64, timestamp: i64, xid: Xid },
    Commit { commit_lsn: u64, end_lsn: u64 },
    Relation(RawRelation),
    Insert { relation_id: Oid, new_tuple: RawTuple },
    Update { relation_id: Oid, old_tuple: Option<RawTuple>, new_tuple: RawTuple },
    Delete { relation_id: Oid, old_tuple: RawTuple },
    Truncate,
    Origin,
    Type,
    StreamStart,
    StreamStop,
    StreamCommit { commit_lsn: u64, end_lsn: u64 },
    StreamAbort,
}

impl LogicalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalMessage::Begin { .. } => "Begin",
            LogicalMessage::Commit { .. } => "Commit",
            LogicalMessage::Relation(_) => "Relation",
            LogicalMessage::Insert { .. } => "Insert",
            LogicalMessage::Update { .. } => "Update",
            LogicalMessage::Delete { .. } => "Delete",
            LogicalMessage::Truncate => "Truncate",
            LogicalMessage::Origin => "Origin",
            LogicalMessage::Type => "Type",
            LogicalMessage::StreamStart => "StreamStart",
            LogicalMessage::StreamStop => "StreamStop",
            LogicalMessage::StreamCommit { .. } => "StreamCommit",
            LogicalMessage::StreamAbort => "StreamAbort",
        }
    }
}

/// Parses a single logical-replication message from the payload carried
/// by an XLogData frame.
pub fn parse_logical_message(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.is_empty() {
        return Err(CdcError::protocol("empty logical message buffer"));
    }

    let message_type = buffer[0] as char;
    debug!(message_type, "parsing logical replication message");

    match message_type {
        'B' => parse_begin(buffer),
        'C' => parse_commit(buffer),
        'R' => parse_relation(buffer),
        'I' => parse_insert(buffer),
        'U' => parse_update(buffer),
        'D' => parse_delete(buffer),
        'T' => Ok(LogicalMessage::Truncate),
        'O' => Ok(LogicalMessage::Origin),
        'Y' => Ok(LogicalMessage::Type),
        'S' => Ok(LogicalMessage::StreamStart),
        'E' => Ok(LogicalMessage::StreamStop),
        'c' => parse_stream_commit(buffer),
        'A' => Ok(LogicalMessage::StreamAbort),
        other => Err(CdcError::protocol(format!("unknown logical message type: {}", other))),
    }
}

fn parse_begin(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 21 {
        return Err(CdcError::protocol("Begin message too short"));
    }
    let mut reader = BufferReader::new(&buffer[1..]);
    let final_lsn = reader.read_u64()?;
    let timestamp = reader.read_i64()?;
    let xid = reader.read_u32()?;
    Ok(LogicalMessage::Begin { final_lsn, timestamp, xid })
}

fn parse_commit(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 26 {
        return Err(CdcError::protocol("Commit message too short"));
    }
    let mut reader = BufferReader::new(&buffer[1..]);
    let _flags = reader.read_u8()?;
    let commit_lsn = reader.read_u64()?;
    let end_lsn = reader.read_u64()?;
    Ok(LogicalMessage::Commit { commit_lsn, end_lsn })
}

fn parse_relation(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 7 {
        return Err(CdcError::protocol("Relation message too short"));
    }
    let mut reader = BufferReader::new(&buffer[1..]);
    let oid = reader.read_u32()?;
    let namespace = reader.read_cstr()?;
    let name = reader.read_cstr()?;
    let replica_identity = reader.read_char()?;
    let column_count = reader.read_i16()?;

    let mut columns = Vec::with_capacity(column_count.max(0) as usize);
    for _ in 0..column_count {
        let key_flag = reader.read_u8()?;
        let col_name = reader.read_cstr()?;
        let type_oid = reader.read_u32()?;
        let atttypmod = reader.read_i32()?;
        columns.push(RawColumnInfo { is_key: key_flag == 1, name: col_name, type_oid, atttypmod });
    }

    Ok(LogicalMessage::Relation(RawRelation { oid, namespace, name, replica_identity, columns }))
}

fn parse_insert(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 6 {
        return Err(CdcError::protocol("Insert message too short"));
    }
    let mut reader = BufferReader::new(&buffer[1..]);
    let relation_id = reader.read_u32()?;
    let marker = reader.read_char()?;
    if marker != 'N' {
        return Err(CdcError::protocol("expected 'N' marker in Insert message"));
    }
    let new_tuple = parse_tuple(&buffer[1 + reader.position()..])?;
    Ok(LogicalMessage::Insert { relation_id, new_tuple })
}

fn parse_update(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 6 {
        return Err(CdcError::protocol("Update message too short"));
    }
    // Manual offset tracking (rather than a single shared BufferReader)
    // because the old-tuple's length isn't known until it's parsed.
    let mut offset = 1usize; // skip 'U'
    if buffer.len() < offset + 4 {
        return Err(CdcError::protocol("Update message truncated"));
    }
    let relation_id = u32::from_be_bytes(buffer[offset..offset + 4].try_into().unwrap());
    offset += 4;

    if offset >= buffer.len() {
        return Err(CdcError::protocol("Update message truncated"));
    }
    let marker = buffer[offset] as char;
    offset += 1;

    let old_tuple = match marker {
        'K' | 'O' => {
            let old = parse_tuple(&buffer[offset..])?;
            offset += old.consumed;
            if offset >= buffer.len() || buffer[offset] != b'N' {
                return Err(CdcError::protocol("expected 'N' marker after old tuple in Update"));
            }
            offset += 1;
            Some(old)
        }
        'N' => None,
        other => return Err(CdcError::protocol(format!("invalid marker in Update message: {}", other))),
    };

    let new_tuple = parse_tuple(&buffer[offset..])?;
    Ok(LogicalMessage::Update { relation_id, old_tuple, new_tuple })
}

fn parse_delete(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 6 {
        return Err(CdcError::protocol("Delete message too short"));
    }
    let mut reader = BufferReader::new(&buffer[1..]);
    let relation_id = reader.read_u32()?;
    let marker = reader.read_char()?;
    if marker != 'K' && marker != 'O' {
        return Err(CdcError::protocol("invalid marker in Delete message"));
    }
    let old_tuple = parse_tuple(&buffer[1 + reader.position()..])?;
    Ok(LogicalMessage::Delete { relation_id, old_tuple })
}

fn parse_stream_commit(buffer: &[u8]) -> CdcResult<LogicalMessage> {
    if buffer.len() < 26 {
        return Err(CdcError::protocol("StreamCommit message too short"));
    }
    let mut reader = BufferReader::new(&buffer[1..]);
    let _xid = reader.read_u32()?;
    let _flags = reader.read_u8()?;
    let commit_lsn = reader.read_u64()?;
    let end_lsn = reader.read_u64()?;
    Ok(LogicalMessage::StreamCommit { commit_lsn, end_lsn })
}

fn parse_tuple(buffer: &[u8]) -> CdcResult<RawTuple> {
    if buffer.len() < 2 {
        return Err(CdcError::protocol("tuple data too short"));
    }
    let mut reader = BufferReader::new(buffer);
    let column_count = reader.read_i16()?;

    let mut columns = Vec::with_capacity(column_count.max(0) as usize);
    for _ in 0..column_count {
        let kind = reader.read_char()?;
        let column = match kind {
            'n' => RawColumn::Null,
            'u' => RawColumn::UnchangedToast,
            't' => {
                let len = reader.read_i32()?;
                if len < 0 {
                    return Err(CdcError::protocol("negative text column length"));
                }
                let bytes = reader.read_bytes(len as usize)?;
                RawColumn::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            other => return Err(CdcError::protocol(format!("unknown tuple column kind: {}", other))),
        };
        columns.push(column);
    }

    Ok(RawTuple { columns, consumed: reader.position() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation_bytes() -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&1u32.to_be_bytes()); // oid
        buf.extend_from_slice(b"public\0");
        buf.extend_from_slice(b"users\0");
        buf.push(b'd'); // replica_identity
        buf.extend_from_slice(&1i16.to_be_bytes()); // column_count
        buf.push(1); // key_flag
        buf.extend_from_slice(b"id\0");
        buf.extend_from_slice(&23u32.to_be_bytes()); // type_oid int4
        buf.extend_from_slice(&(-1i32).to_be_bytes()); // atttypmod
        buf
    }

    #[test]
    fn parses_relation_message() {
        let bytes = relation_bytes();
        let msg = parse_logical_message(&bytes).unwrap();
        match msg {
            LogicalMessage::Relation(rel) => {
                assert_eq!(rel.oid, 1);
                assert_eq!(rel.namespace, "public");
                assert_eq!(rel.name, "users");
                assert_eq!(rel.columns.len(), 1);
                assert!(rel.columns[0].is_key);
            }
            _ => panic!("expected Relation"),
        }
    }

    #[test]
    fn parses_insert_message() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&1i16.to_be_bytes());
        buf.push(b't');
        buf.extend_from_slice(&1i32.to_be_bytes());
        buf.push(b'5');

        let msg = parse_logical_message(&buf).unwrap();
        match msg {
            LogicalMessage::Insert { relation_id, new_tuple } => {
                assert_eq!(relation_id, 1);
                assert_eq!(new_tuple.columns.len(), 1);
                match &new_tuple.columns[0] {
                    RawColumn::Text(s) => assert_eq!(s, "5"),
                    _ => panic!("expected text column"),
                }
            }
            _ => panic!("expected Insert"),
        }
    }

    #[test]
    fn keepalive_round_trips_through_standby_status() {
        let mut frame = vec![b'k'];
        frame.extend_from_slice(&100u64.to_be_bytes());
        frame.extend_from_slice(&200u64.to_be_bytes());
        frame.push(1);
        let keepalive = KeepaliveMessage::parse(&frame).unwrap();
        assert!(keepalive.reply_requested);
        assert_eq!(keepalive.end_lsn, 100);

        let update = StandbyStatusUpdate {
            write_lsn: 100,
            flush_lsn: 100,
            apply_lsn: 100,
            client_time: 0,
            reply_requested: false,
        };
        let encoded = update.encode().unwrap();
        assert_eq!(encoded[0], b'r');
        assert_eq!(encoded.len(), 34);
    }
}
