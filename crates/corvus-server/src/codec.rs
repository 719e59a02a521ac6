//! Packet framing and typed field access.
//!
//! Frame: `[type: u8][length: u32 big-endian, including itself][body]`.
//! The startup packet is special and carries no type byte. All integers
//! are big-endian; strings are NUL-terminated.
//!
//! Outbound packets are queued in a [`ResponseBuffer`] and written as a
//! single flush at each turn of the session loop.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};

use crate::error::ProtocolError;

/// Refuse absurd frames before allocating.
const MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// An inbound packet with a read cursor.
#[derive(Debug)]
pub struct Packet {
    pub msg_type: u8,
    body: Vec<u8>,
    cursor: usize,
}

impl Packet {
    pub fn new(msg_type: u8, body: Vec<u8>) -> Self {
        Self {
            msg_type,
            body,
            cursor: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.body.len() - self.cursor
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        let bytes = self.get_bytes(1, "u8")?;
        Ok(bytes[0])
    }

    pub fn get_i16(&mut self) -> Result<i16, ProtocolError> {
        let bytes = self.get_bytes(2, "i16")?;
        Ok(BigEndian::read_i16(bytes))
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        let bytes = self.get_bytes(4, "i32")?;
        Ok(BigEndian::read_i32(bytes))
    }

    /// Read a NUL-terminated UTF-8 string.
    pub fn get_cstring(&mut self) -> Result<String, ProtocolError> {
        let start = self.cursor;
        let rest = &self.body[start..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::Truncated("cstring"))?;
        self.cursor = start + nul + 1;
        String::from_utf8(rest[..nul].to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn get_bytes(&mut self, len: usize, what: &'static str) -> Result<&[u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated(what));
        }
        let start = self.cursor;
        self.cursor = start + len;
        Ok(&self.body[start..self.cursor])
    }
}

/// Read the startup packet: `[length][body]`, no type byte.
/// `Ok(None)` on clean EOF before any byte arrives.
pub fn read_startup_packet(reader: &mut impl Read) -> Result<Option<Packet>, ProtocolError> {
    let mut header = [0u8; 4];
    if read_or_eof(reader, &mut header)? {
        return Ok(None);
    }
    let length = BigEndian::read_u32(&header);
    Ok(Some(Packet::new(0, read_body(reader, length)?)))
}

/// Read a typed packet. `Ok(None)` on clean EOF before the type byte.
pub fn read_packet(reader: &mut impl Read) -> Result<Option<Packet>, ProtocolError> {
    let mut tag = [0u8; 1];
    if read_or_eof(reader, &mut tag)? {
        return Ok(None);
    }
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let length = BigEndian::read_u32(&header);
    Ok(Some(Packet::new(tag[0], read_body(reader, length)?)))
}

/// Fill `buf`, reporting a clean EOF on the very first byte as `true`.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, ProtocolError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(true),
        Err(err) => Err(err.into()),
    }
}

fn read_body(reader: &mut impl Read, length: u32) -> Result<Vec<u8>, ProtocolError> {
    if !(4..=MAX_PACKET_SIZE).contains(&length) {
        return Err(ProtocolError::InvalidLength(length));
    }
    let mut body = vec![0u8; length as usize - 4];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// An outbound packet under construction.
#[derive(Debug)]
pub struct OutputPacket {
    msg_type: u8,
    body: Vec<u8>,
}

impl OutputPacket {
    pub fn new(msg_type: u8) -> Self {
        Self {
            msg_type,
            body: Vec::new(),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.body.push(value);
        self
    }

    pub fn put_i16(&mut self, value: i16) -> &mut Self {
        let mut buf = [0u8; 2];
        BigEndian::write_i16(&mut buf, value);
        self.body.extend_from_slice(&buf);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        self.body.extend_from_slice(&buf);
        self
    }

    pub fn put_cstring(&mut self, value: &str) -> &mut Self {
        self.body.extend_from_slice(value.as_bytes());
        self.body.push(0);
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.body.extend_from_slice(value);
        self
    }
}

/// Ordered queue of outbound packets, flushed once per session-loop turn.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    packets: Vec<OutputPacket>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: OutputPacket) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Write every queued packet and flush the stream.
    pub fn flush(&mut self, writer: &mut impl Write) -> Result<(), ProtocolError> {
        for packet in self.packets.drain(..) {
            let mut frame = Vec::with_capacity(packet.body.len() + 5);
            frame.push(packet.msg_type);
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, packet.body.len() as u32 + 4);
            frame.extend_from_slice(&len);
            frame.extend_from_slice(&packet.body);
            writer.write_all(&frame)?;
        }
        writer.flush()?;
        Ok(())
    }
}
