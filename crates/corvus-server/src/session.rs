//! The per-connection session state machine.
//!
//! Drives startup, the simple-query flow, and the extended-query flow over
//! one blocking stream. Message processing is strictly sequential: the next
//! inbound packet is read only after the full response of the previous one
//! has been flushed. Every turn ends with ReadyForQuery carrying the
//! session's transaction status byte.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use corvus_core::error::Error;
use corvus_core::plan::FieldInfo;
use corvus_core::planner::query_kind;
use corvus_core::tcop::{ExecOutcome, TrafficCop};
use corvus_core::txn::TransactionRecord;
use corvus_core::value::{Value, ValueType};

use crate::codec::{self, OutputPacket, Packet, ResponseBuffer};
use crate::error::ProtocolError;
use crate::portal::{Portal, PortalTable, PreparedStatement, StatementCache};

/// Parameter-status pairs sent after authentication, in this order.
const PARAMETER_STATUS: &[(&str, &str)] = &[
    ("application_name", "psql"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
    ("IntervalStyle", "postgres"),
    ("is_superuser", "on"),
    ("server_encoding", "UTF8"),
    ("server_version", "9.5devel"),
    ("session_authorization", "postgres"),
    ("standard_conforming_strings", "on"),
    ("TimeZone", "US/Eastern"),
];

/// Transaction status reported in every ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Idle,
    InBlock,
    Failed,
}

impl TxnStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TxnStatus::Idle => b'I',
            TxnStatus::InBlock => b'T',
            TxnStatus::Failed => b'E',
        }
    }
}

/// One client session. Owns its stream, statement cache, portal table, and
/// transaction handle exclusively.
pub struct Session<S> {
    stream: S,
    tcop: Arc<TrafficCop>,
    database: String,
    user: String,
    cmdline_options: HashMap<String, String>,
    txn_status: TxnStatus,
    txn: Option<TransactionRecord>,
    cache: StatementCache,
    portals: PortalTable,
    /// Query kind of a statement the skip filter suppressed, consumed by
    /// the next Execute.
    skipped: Option<String>,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, tcop: Arc<TrafficCop>) -> Self {
        Self {
            stream,
            tcop,
            database: String::new(),
            user: String::new(),
            cmdline_options: HashMap::new(),
            txn_status: TxnStatus::Idle,
            txn: None,
            cache: StatementCache::new(),
            portals: PortalTable::new(),
            skipped: None,
        }
    }

    /// Run the session to completion. Always leaves the transaction aborted
    /// and the stream dropped.
    pub fn run(mut self) {
        if let Err(err) = self.serve() {
            debug!(error = %err, "session ended abnormally");
        }
        if let Some(mut txn) = self.txn.take() {
            self.tcop.abort(&mut txn);
        }
        debug!(user = %self.user, database = %self.database, "session closed");
    }

    fn serve(&mut self) -> Result<(), ProtocolError> {
        let mut responses = ResponseBuffer::new();

        let Some(mut startup) = codec::read_startup_packet(&mut self.stream)? else {
            return Ok(());
        };
        if !self.process_startup_packet(&mut startup, &mut responses)? {
            // Unsupported protocol: close with no further packets.
            return Ok(());
        }
        responses.flush(&mut self.stream)?;

        loop {
            let Some(mut packet) = codec::read_packet(&mut self.stream)? else {
                return Ok(());
            };
            let proceed = self.process_packet(&mut packet, &mut responses)?;
            responses.flush(&mut self.stream)?;
            if !proceed {
                return Ok(());
            }
        }
    }

    /// Handle the startup packet. Returns false when the session must be
    /// terminated (unsupported protocol major version).
    fn process_startup_packet(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<bool, ProtocolError> {
        let version = packet.get_i32()?;
        if version >> 16 != 3 {
            warn!(version, "unsupported protocol version, closing session");
            return Ok(false);
        }

        // Key/value options until end of packet. `database` and `user` are
        // recognized; everything else is preserved verbatim.
        while packet.remaining() > 1 {
            let key = packet.get_cstring()?;
            if key.is_empty() || packet.remaining() == 0 {
                break;
            }
            let value = packet.get_cstring()?;
            match key.as_str() {
                "database" => self.database = value,
                "user" => self.user = value,
                _ => {
                    self.cmdline_options.insert(key, value);
                }
            }
        }
        debug!(user = %self.user, database = %self.database, "startup");

        let mut auth = OutputPacket::new(b'R');
        auth.put_i32(0);
        responses.push(auth);

        for (key, value) in PARAMETER_STATUS {
            let mut status = OutputPacket::new(b'S');
            status.put_cstring(key);
            status.put_cstring(value);
            responses.push(status);
        }

        self.send_ready_for_query(responses);
        Ok(true)
    }

    /// Main dispatch. Returns false when the session should close.
    fn process_packet(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<bool, ProtocolError> {
        match packet.msg_type {
            b'Q' => self.exec_query_message(packet, responses)?,
            b'P' => self.exec_parse_message(packet, responses)?,
            b'B' => self.exec_bind_message(packet, responses)?,
            b'D' => self.exec_describe_message(packet, responses)?,
            b'E' => self.exec_execute_message(packet, responses)?,
            b'C' => self.exec_close_message(packet, responses)?,
            b'S' => self.send_ready_for_query(responses),
            b'X' => {
                debug!("terminate requested");
                return Ok(false);
            }
            other => {
                debug!(msg_type = other, "unsupported packet type ignored");
            }
        }
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Simple query
    // -----------------------------------------------------------------

    fn exec_query_message(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<(), ProtocolError> {
        let query = packet.get_cstring()?;
        debug!(query = %query, "simple query");

        let statements: Vec<&str> = query
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if statements.is_empty() {
            self.send_empty_query_response(responses);
            self.send_ready_for_query(responses);
            return Ok(());
        }

        for sql in statements {
            let kind = query_kind(sql);

            if self.txn_status == TxnStatus::Failed && kind != "ROLLBACK" {
                self.send_error_response(
                    "current transaction is aborted, commands ignored until end of transaction block",
                    responses,
                );
                break;
            }

            if !self.execute_filter(&kind) {
                self.complete_command(&kind, 0, responses);
                continue;
            }

            let mut txn = self.txn.take();
            let result = self.tcop.portal_exec(&mut txn, sql);
            self.txn = txn;
            match result {
                Ok(outcome) => {
                    self.put_row_desc(&outcome.row_desc, responses);
                    let rows = Self::send_data_rows(&outcome, responses);
                    self.complete_command(&outcome.kind, rows, responses);
                }
                Err(err) => {
                    self.statement_failed();
                    self.send_error_response(&err.to_string(), responses);
                    break;
                }
            }
        }

        self.send_ready_for_query(responses);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Extended query
    // -----------------------------------------------------------------

    fn exec_parse_message(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<(), ProtocolError> {
        let name = packet.get_cstring()?;
        let sql = packet.get_cstring()?;
        let num_param_types = packet.get_i16()?.max(0);
        let mut param_types = Vec::with_capacity(num_param_types as usize);
        for _ in 0..num_param_types {
            param_types.push(packet.get_i32()?);
        }
        debug!(statement = %name, sql = %sql, "parse");

        let kind = query_kind(&sql);
        self.skipped = None;

        let plan = if self.execute_filter(&kind) {
            match self.tcop.prepare(&sql) {
                Ok(plan) => Some(plan),
                Err(err) => {
                    self.send_error_response(&err.to_string(), responses);
                    self.send_ready_for_query(responses);
                    return Ok(());
                }
            }
        } else {
            debug!(kind = %kind, "statement suppressed by skip filter");
            self.skipped = Some(kind.clone());
            None
        };

        let statement = Arc::new(PreparedStatement {
            name: name.clone(),
            sql,
            kind,
            plan,
            param_types,
        });
        if let Err(message) = self.cache.insert(statement) {
            self.send_error_response(&message, responses);
            self.send_ready_for_query(responses);
            return Ok(());
        }

        responses.push(OutputPacket::new(b'1'));
        Ok(())
    }

    fn exec_bind_message(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<(), ProtocolError> {
        let portal_name = packet.get_cstring()?;
        let statement_name = packet.get_cstring()?;
        debug!(portal = %portal_name, statement = %statement_name, "bind");

        let num_formats = packet.get_i16()?.max(0);
        let mut formats = Vec::with_capacity(num_formats as usize);
        for _ in 0..num_formats {
            formats.push(packet.get_i16()?);
        }

        let num_params = packet.get_i16()?.max(0);
        if num_formats != num_params {
            self.send_error_response(
                "Malformed request: num_params_format is not equal to num_params",
                responses,
            );
            return Ok(());
        }

        let Some(statement) = self.cache.get(&statement_name) else {
            self.send_error_response(
                &format!("prepared statement not found: \"{statement_name}\""),
                responses,
            );
            return Ok(());
        };

        // Re-evaluate the filter against the current transaction state;
        // a statement parsed as skippable may be skippable no longer, and
        // vice versa.
        self.skipped = None;
        if !self.execute_filter(&statement.kind) {
            debug!(kind = %statement.kind, "bound statement suppressed by skip filter");
            self.skipped = Some(statement.kind.clone());
            responses.push(OutputPacket::new(b'2'));
            return Ok(());
        }

        let plan = match &statement.plan {
            Some(plan) => Arc::clone(plan),
            // Parsed while the filter applied; plan it now.
            None => match self.tcop.prepare(&statement.sql) {
                Ok(plan) => plan,
                Err(err) => {
                    self.send_error_response(&err.to_string(), responses);
                    return Ok(());
                }
            },
        };

        let mut params = Vec::with_capacity(num_params as usize);
        for index in 0..num_params as usize {
            let length = packet.get_i32()?;
            let raw = if length < 0 {
                None
            } else {
                Some(packet.get_bytes(length as usize, "parameter value")?.to_vec())
            };
            let type_oid = statement.param_types.get(index).copied().unwrap_or(0);
            match decode_parameter(raw, formats[index], type_oid) {
                Ok(value) => params.push(value),
                Err(err) => {
                    self.send_error_response(&err.to_string(), responses);
                    return Ok(());
                }
            }
        }

        let row_desc = self.tcop.row_desc(&plan);
        let bound = match self.tcop.bind(&plan, params) {
            Ok(bound) => bound,
            Err(err) => {
                self.send_error_response(&err.to_string(), responses);
                return Ok(());
            }
        };
        self.portals.put(Portal {
            name: portal_name,
            statement,
            bound,
            row_desc,
        });
        responses.push(OutputPacket::new(b'2'));
        Ok(())
    }

    fn exec_describe_message(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<(), ProtocolError> {
        let mode = packet.get_u8()?;
        let name = packet.get_cstring()?;
        debug!(mode = %(mode as char), name = %name, "describe");

        match mode {
            b'P' => {
                // Missing portals get an empty row descriptor.
                let row_desc = self
                    .portals
                    .get(&name)
                    .map(|portal| portal.row_desc.clone())
                    .unwrap_or_default();
                self.put_row_desc_always(&row_desc, responses);
            }
            _ => {
                responses.push(OutputPacket::new(b'n'));
            }
        }
        Ok(())
    }

    fn exec_execute_message(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<(), ProtocolError> {
        let portal_name = packet.get_cstring()?;
        debug!(portal = %portal_name, "execute");

        // A statement suppressed at Bind gets a synthesized completion.
        if let Some(kind) = self.skipped.take() {
            self.complete_command(&kind, 0, responses);
            return Ok(());
        }

        let Some(portal) = self.portals.get(&portal_name) else {
            self.send_error_response(
                &format!("portal not found: \"{portal_name}\""),
                responses,
            );
            self.send_ready_for_query(responses);
            return Ok(());
        };

        let kind = portal.bound.plan.kind.clone();
        if self.txn_status == TxnStatus::Failed && kind != "ROLLBACK" {
            self.send_error_response(
                "current transaction is aborted, commands ignored until end of transaction block",
                responses,
            );
            self.send_ready_for_query(responses);
            return Ok(());
        }

        let bound = portal.bound.clone();
        let mut txn = self.txn.take();
        let result = self.tcop.exec_prepared(&mut txn, &bound);
        self.txn = txn;
        match result {
            Ok(outcome) => {
                let rows = Self::send_data_rows(&outcome, responses);
                self.complete_command(&outcome.kind, rows, responses);
            }
            Err(err) => {
                self.statement_failed();
                self.send_error_response(&err.to_string(), responses);
                self.send_ready_for_query(responses);
            }
        }
        Ok(())
    }

    fn exec_close_message(
        &mut self,
        packet: &mut Packet,
        responses: &mut ResponseBuffer,
    ) -> Result<(), ProtocolError> {
        let mode = packet.get_u8()?;
        let name = packet.get_cstring()?;
        match mode {
            b'S' => self.cache.remove(&name),
            b'P' => self.portals.remove(&name),
            other => debug!(mode = %(other as char), "unknown close mode"),
        }
        responses.push(OutputPacket::new(b'3'));
        Ok(())
    }

    // -----------------------------------------------------------------
    // Skip filter and transaction status
    // -----------------------------------------------------------------

    /// False when the statement must be acknowledged but not executed:
    /// SET/SHOW always; BEGIN inside a block; COMMIT/ROLLBACK outside one.
    fn execute_filter(&self, kind: &str) -> bool {
        if kind == "SET" || kind == "SHOW" {
            return false;
        }
        if kind == "BEGIN" && self.txn_status == TxnStatus::InBlock {
            return false;
        }
        if (kind == "COMMIT" || kind == "ROLLBACK") && self.txn_status == TxnStatus::Idle {
            return false;
        }
        true
    }

    /// A statement failed. Inside an explicit block the session enters
    /// Failed until ROLLBACK; implicit transactions were already rolled
    /// back by the traffic cop and leave the session Idle.
    fn statement_failed(&mut self) {
        if self.txn_status == TxnStatus::InBlock {
            self.txn_status = TxnStatus::Failed;
        }
    }

    /// Emit CommandComplete and apply the transaction-state transitions
    /// BEGIN/COMMIT/ROLLBACK drive.
    fn complete_command(&mut self, kind: &str, rows: u64, responses: &mut ResponseBuffer) {
        let tag = match kind {
            "BEGIN" => {
                self.txn_status = TxnStatus::InBlock;
                kind.to_string()
            }
            "COMMIT" | "ROLLBACK" => {
                self.txn_status = TxnStatus::Idle;
                kind.to_string()
            }
            "INSERT" => format!("INSERT 0 {rows}"),
            _ => format!("{kind} {rows}"),
        };
        let mut packet = OutputPacket::new(b'C');
        packet.put_cstring(&tag);
        responses.push(packet);
    }

    // -----------------------------------------------------------------
    // Response packets
    // -----------------------------------------------------------------

    fn send_ready_for_query(&self, responses: &mut ResponseBuffer) {
        let mut packet = OutputPacket::new(b'Z');
        packet.put_u8(self.txn_status.as_byte());
        responses.push(packet);
    }

    fn send_empty_query_response(&self, responses: &mut ResponseBuffer) {
        responses.push(OutputPacket::new(b'I'));
    }

    fn send_error_response(&self, message: &str, responses: &mut ResponseBuffer) {
        let mut packet = OutputPacket::new(b'E');
        packet.put_u8(b'M');
        packet.put_cstring(message);
        packet.put_u8(0);
        responses.push(packet);
    }

    /// RowDescription, skipped entirely for row-less statements.
    fn put_row_desc(&self, row_desc: &[FieldInfo], responses: &mut ResponseBuffer) {
        if row_desc.is_empty() {
            return;
        }
        self.put_row_desc_always(row_desc, responses);
    }

    fn put_row_desc_always(&self, row_desc: &[FieldInfo], responses: &mut ResponseBuffer) {
        let mut packet = OutputPacket::new(b'T');
        packet.put_i16(row_desc.len() as i16);
        for field in row_desc {
            packet.put_cstring(&field.name);
            // Table OID and attribute number are not tracked.
            packet.put_i32(0);
            packet.put_i16(0);
            packet.put_i32(field.type_oid);
            packet.put_i16(field.type_size);
            packet.put_i32(-1);
            packet.put_i16(0);
        }
        responses.push(packet);
    }

    /// One DataRow per row, text format; returns the row count.
    fn send_data_rows(outcome: &ExecOutcome, responses: &mut ResponseBuffer) -> u64 {
        for row in &outcome.rows {
            let mut packet = OutputPacket::new(b'D');
            packet.put_i16(row.len() as i16);
            for value in row {
                match value.to_text() {
                    None => {
                        packet.put_i32(-1);
                    }
                    Some(text) => {
                        packet.put_i32(text.len() as i32);
                        packet.put_bytes(text.as_bytes());
                    }
                }
            }
            responses.push(packet);
        }
        outcome.rows_affected
    }
}

/// Decode one bound parameter per its format code and declared type OID.
/// Length -1 (`raw = None`) denotes SQL NULL.
fn decode_parameter(
    raw: Option<Vec<u8>>,
    format: i16,
    type_oid: i32,
) -> Result<Value, Error> {
    let Some(bytes) = raw else {
        return Ok(Value::Null);
    };
    let declared = ValueType::from_type_oid(type_oid);
    match format {
        0 => {
            let text = String::from_utf8(bytes).map_err(|_| {
                corvus_core::error::ExecError::MalformedBinary("utf-8 text parameter")
            })?;
            match declared {
                Some(ty) => Ok(Value::parse_text(&text, ty)?),
                None => Ok(Value::Varchar(text)),
            }
        }
        1 => {
            let ty = declared.unwrap_or(ValueType::Varchar);
            Ok(Value::decode_binary(&bytes, ty)?)
        }
        other => Err(corvus_core::error::PlanError::Unsupported(format!(
            "parameter format code {other}"
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use byteorder::{BigEndian, ByteOrder};

    use corvus_core::catalog::Catalog;
    use corvus_core::storage::TupleStore;
    use corvus_core::types::{CcConfig, CcStrategy};
    use corvus_core::txn::TransactionManager;

    use super::*;

    /// In-memory stream: the session reads scripted bytes and its replies
    /// are captured for inspection.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_tcop() -> Arc<TrafficCop> {
        let catalog = Arc::new(Catalog::new());
        let store = Arc::new(TupleStore::new());
        let config = CcConfig {
            strategy: CcStrategy::Occ,
            occ_serializable: false,
            lock_wait_timeout: Duration::from_millis(1000),
        };
        let tm = Arc::new(TransactionManager::new(&config, Arc::clone(&store)));
        Arc::new(TrafficCop::new(catalog, store, tm))
    }

    fn startup_packet(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&196608i32.to_be_bytes()); // version 3.0
        for (key, value) in pairs {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        frame_untyped(&body)
    }

    fn frame_untyped(body: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        wire.extend_from_slice(body);
        wire
    }

    fn frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut wire = vec![msg_type];
        wire.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        wire.extend_from_slice(body);
        wire
    }

    fn query(sql: &str) -> Vec<u8> {
        let mut body = sql.as_bytes().to_vec();
        body.push(0);
        frame(b'Q', &body)
    }

    fn terminate() -> Vec<u8> {
        frame(b'X', &[])
    }

    /// Run a scripted session and parse the response packets.
    fn run_script(messages: &[Vec<u8>]) -> Vec<(u8, Vec<u8>)> {
        let mut input = startup_packet(&[("user", "postgres"), ("database", "test")]);
        for message in messages {
            input.extend_from_slice(message);
        }
        input.extend_from_slice(&terminate());

        let stream = ScriptedStream {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        let tcop = test_tcop();
        let mut session = Session::new(stream, tcop);
        session.serve().unwrap();
        parse_packets(&session.stream.output)
    }

    fn parse_packets(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut packets = Vec::new();
        while !bytes.is_empty() {
            let msg_type = bytes[0];
            let length = BigEndian::read_u32(&bytes[1..5]) as usize;
            packets.push((msg_type, bytes[5..1 + length].to_vec()));
            bytes = &bytes[1 + length..];
        }
        packets
    }

    fn cstring_at(body: &[u8]) -> String {
        let nul = body.iter().position(|b| *b == 0).unwrap();
        String::from_utf8(body[..nul].to_vec()).unwrap()
    }

    #[test]
    fn test_startup_handshake_sequence() {
        let packets = run_script(&[]);
        assert_eq!(packets[0].0, b'R');
        assert_eq!(BigEndian::read_i32(&packets[0].1), 0);

        for (index, (key, value)) in PARAMETER_STATUS.iter().enumerate() {
            let (msg_type, body) = &packets[1 + index];
            assert_eq!(*msg_type, b'S');
            let nul = body.iter().position(|b| *b == 0).unwrap();
            assert_eq!(&body[..nul], key.as_bytes());
            assert_eq!(cstring_at(&body[nul + 1..]), *value);
        }

        let (msg_type, body) = &packets[1 + PARAMETER_STATUS.len()];
        assert_eq!(*msg_type, b'Z');
        assert_eq!(body, &[b'I']);
    }

    #[test]
    fn test_protocol_version_two_is_rejected_silently() {
        let mut body = Vec::new();
        body.extend_from_slice(&(2i32 << 16).to_be_bytes());
        body.push(0);
        let input = frame_untyped(&body);

        let stream = ScriptedStream {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        let mut session = Session::new(stream, test_tcop());
        session.serve().unwrap();
        assert!(session.stream.output.is_empty(), "no packets on bad version");
    }

    #[test]
    fn test_empty_query_response() {
        let packets = run_script(&[query("")]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        assert_eq!(tail[0].0, b'I');
        assert_eq!(tail[1].0, b'Z');
    }

    #[test]
    fn test_skip_filter_set_and_show() {
        let packets = run_script(&[query("SET client_encoding TO 'UTF8'"), query("SHOW all")]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        assert_eq!(tail[0].0, b'C');
        assert_eq!(cstring_at(&tail[0].1), "SET 0");
        assert_eq!(tail[1], (b'Z', vec![b'I']));
        assert_eq!(cstring_at(&tail[2].1), "SHOW 0");
        assert_eq!(tail[3], (b'Z', vec![b'I']));
    }

    #[test]
    fn test_duplicate_begin_is_filtered() {
        let packets = run_script(&[query("BEGIN"), query("BEGIN")]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        assert_eq!(cstring_at(&tail[0].1), "BEGIN");
        assert_eq!(tail[1], (b'Z', vec![b'T']));
        // Second BEGIN: acknowledged, still in block, no error.
        assert_eq!(cstring_at(&tail[2].1), "BEGIN");
        assert_eq!(tail[3], (b'Z', vec![b'T']));
    }

    #[test]
    fn test_commit_while_idle_is_filtered() {
        let packets = run_script(&[query("COMMIT")]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        assert_eq!(cstring_at(&tail[0].1), "COMMIT");
        assert_eq!(tail[1], (b'Z', vec![b'I']));
    }

    #[test]
    fn test_simple_select_row_flow() {
        let packets = run_script(&[
            query("CREATE TABLE t (a int)"),
            query("INSERT INTO t VALUES (0)"),
            query("SELECT a FROM t"),
        ]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        assert_eq!(cstring_at(&tail[0].1), "CREATE 0");
        assert_eq!(cstring_at(&tail[2].1), "INSERT 0 1");

        // SELECT: T, D, C, Z.
        let select = &tail[4..];
        assert_eq!(select[0].0, b'T');
        assert_eq!(BigEndian::read_i16(&select[0].1), 1);
        assert_eq!(cstring_at(&select[0].1[2..]), "a");
        assert_eq!(select[1].0, b'D');
        assert_eq!(BigEndian::read_i16(&select[1].1), 1);
        assert_eq!(BigEndian::read_i32(&select[1].1[2..6]), 1);
        assert_eq!(&select[1].1[6..7], b"0");
        assert_eq!(cstring_at(&select[2].1), "SELECT 1");
        assert_eq!(select[3], (b'Z', vec![b'I']));
    }

    #[test]
    fn test_failed_block_until_rollback() {
        let packets = run_script(&[
            query("CREATE TABLE t (a int)"),
            query("INSERT INTO t VALUES (1)"),
            query("BEGIN"),
            query("SELECT a / 0 FROM t; SELECT 1"),
            query("INSERT INTO t VALUES (2)"),
            query("ROLLBACK"),
        ]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        // CREATE C/Z, INSERT C/Z, BEGIN C/Z, then the failing batch:
        // the error stops it before the second statement.
        assert_eq!(tail[6].0, b'E');
        assert_eq!(tail[7], (b'Z', vec![b'E']));
        // Further statements are rejected while failed.
        assert_eq!(tail[8].0, b'E');
        assert_eq!(tail[9], (b'Z', vec![b'E']));
        // ROLLBACK clears the state.
        assert_eq!(cstring_at(&tail[10].1), "ROLLBACK");
        assert_eq!(tail[11], (b'Z', vec![b'I']));
    }

    #[test]
    fn test_bind_format_count_mismatch_message() {
        // Parse an unnamed statement, then Bind with 1 format and 0 values.
        let mut parse_body = Vec::new();
        parse_body.push(0); // unnamed
        parse_body.extend_from_slice(b"SELECT $1::int\0");
        parse_body.extend_from_slice(&0i16.to_be_bytes());

        let mut bind_body = Vec::new();
        bind_body.push(0); // unnamed portal
        bind_body.push(0); // unnamed statement
        bind_body.extend_from_slice(&1i16.to_be_bytes()); // one format code
        bind_body.extend_from_slice(&0i16.to_be_bytes()); // format 0 (text)
        bind_body.extend_from_slice(&0i16.to_be_bytes()); // zero parameters

        let sync = frame(b'S', &[]);
        let packets = run_script(&[
            frame(b'P', &parse_body),
            frame(b'B', &bind_body),
            sync,
        ]);
        let tail = &packets[PARAMETER_STATUS.len() + 2..];
        assert_eq!(tail[0].0, b'1');
        assert_eq!(tail[1].0, b'E');
        assert_eq!(tail[1].1[0], b'M');
        assert_eq!(
            cstring_at(&tail[1].1[1..]),
            "Malformed request: num_params_format is not equal to num_params"
        );
        assert_eq!(tail[2], (b'Z', vec![b'I']));
    }

    #[test]
    fn test_decode_parameter_null_and_binary() {
        assert_eq!(decode_parameter(None, 0, 23).unwrap(), Value::Null);
        assert_eq!(
            decode_parameter(Some(vec![0, 0, 0, 42]), 1, 23).unwrap(),
            Value::Integer(42)
        );
        let mut buf = vec![0u8; 8];
        BigEndian::write_f64(&mut buf, 1.25);
        assert_eq!(
            decode_parameter(Some(buf), 1, 701).unwrap(),
            Value::Double(1.25)
        );
        assert_eq!(
            decode_parameter(Some(b"42".to_vec()), 0, 23).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            decode_parameter(Some(b"abc".to_vec()), 0, 0).unwrap(),
            Value::Varchar("abc".to_string())
        );
        assert!(decode_parameter(Some(vec![1]), 2, 23).is_err());
    }
}
