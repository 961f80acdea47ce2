// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! pgproto decodes PostgreSQL frontend wire protocol v3 messages out of an
//! opaque byte stream for transcript logging. It never inspects the
//! backend->frontend direction and never mutates the bytes it is handed;
//! its only job is to turn frame boundaries into human readable lines.

use std::{
    collections::HashMap,
    io::{self, Write},
    sync::Mutex,
};

const MAX_DATA_SIZE: usize = 1024 * 1024;

const STARTUP_MESSAGE: u32 = (3 << 16) | 0;
const SSL_REQUEST: u32 = (1234 << 16) | 5679;
const GSS_ENC_REQUEST: u32 = (1234 << 16) | 5680;
const CANCEL_REQUEST: u32 = (1234 << 16) | 5678;

const BIND: u8 = b'B';
const CLOSE: u8 = b'C';
const COPY_DATA: u8 = b'd';
const COPY_DONE: u8 = b'c';
const COPY_FAIL: u8 = b'f';
const DESCRIBE: u8 = b'D';
const EXECUTE: u8 = b'E';
const FLUSH: u8 = b'H';
const FUNCTION_CALL: u8 = b'F';
const PARSE: u8 = b'P';
const QUERY: u8 = b'Q';
const SYNC: u8 = b'S';
const TERMINATE: u8 = b'X';
const PASSWORD: u8 = b'p';

/// Payload buffering strategy for a given message type. CopyData and
/// password/GSS/SASL payloads are never buffered, even if they exceed
/// [`MAX_DATA_SIZE`]; their content is opaque and only their length is
/// logged.
fn buffers_payload(typed: bool, type_byte: u8) -> bool {
    !typed || !matches!(type_byte, COPY_DATA | PASSWORD)
}

/// Whether a message with an empty-payload requirement actually carries
/// zero bytes, and whether the type byte is one this decoder understands
/// at all.
fn check_type(typed: bool, type_byte: u8, payload_len: usize) -> bool {
    if !typed {
        return true;
    }
    match type_byte {
        BIND | CLOSE | COPY_FAIL | DESCRIBE | EXECUTE | FUNCTION_CALL | COPY_DATA | PARSE
        | QUERY | PASSWORD => true,
        COPY_DONE | FLUSH | SYNC | TERMINATE => payload_len == 0,
        _ => false,
    }
}

#[derive(Debug)]
struct DecodeError;

type DecodeResult<T> = Result<T, DecodeError>;

struct PayloadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        PayloadCursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn get_u8(&mut self) -> DecodeResult<u8> {
        if self.remaining() == 0 {
            return Err(DecodeError);
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn get_u16(&mut self) -> DecodeResult<u16> {
        let hi = self.get_u8()? as u16;
        let lo = self.get_u8()? as u16;
        Ok((hi << 8) | lo)
    }

    fn get_i32(&mut self) -> DecodeResult<i32> {
        let mut v: u32 = 0;
        for _ in 0..4 {
            v = (v << 8) | self.get_u8()? as u32;
        }
        Ok(v as i32)
    }

    fn get_u32(&mut self) -> DecodeResult<u32> {
        Ok(self.get_i32()? as u32)
    }

    /// Reads bytes up to and including a NUL terminator, writing the
    /// pre-NUL bytes to `out` verbatim (the wire format does not promise
    /// valid UTF-8, so callers get raw bytes, not a `String`).
    fn write_cstr(&mut self, out: &mut dyn Write) -> DecodeResult<()> {
        loop {
            let b = self.get_u8()?;
            if b == 0 {
                return Ok(());
            }
            out.write_all(&[b]).map_err(|_| DecodeError)?;
        }
    }
}

enum Stage {
    /// Accumulating the 1-byte type tag (typed messages only) and the
    /// 4-byte big-endian length. `header` holds bytes seen so far.
    Header { header: Vec<u8> },
    /// Accumulating payload bytes. `buffer` is `None` for message types
    /// that never buffer (CopyData, password messages); `payload_len` is
    /// the declared total so the no-buffer path can still log a byte
    /// count once `remaining` reaches zero.
    Payload { typed: bool, type_byte: u8, payload_len: usize, remaining: usize, buffer: Option<Vec<u8>>, reported_oversize: bool },
}

/// Per-descriptor frame decoder. Mirrors a single PostgreSQL frontend
/// connection's message boundary state; survives across multiple calls to
/// [`FrameDecoder::add_data`] as bytes trickle in a page at a time.
pub struct FrameDecoder {
    stage: Stage,
    out_of_sync: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder { stage: Stage::Header { header: Vec::with_capacity(5) }, out_of_sync: false }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` (a contiguous chunk that arrived on the wire) into the
    /// decoder, writing zero or more `preamble`-prefixed log lines to
    /// `out`. A single call may emit several lines if `data` spans
    /// multiple complete messages.
    pub fn add_data(&mut self, data: &[u8], preamble: &str, out: &mut dyn Write) -> io::Result<()> {
        if self.out_of_sync {
            writeln!(out, "{}logger is out of sync. {} bytes transferred", preamble, data.len())?;
            return Ok(());
        }
        let mut cursor = data;
        while !cursor.is_empty() {
            match self.step(&mut cursor, preamble, out) {
                Ok(()) => {}
                Err(DecodeError) => {
                    self.out_of_sync = true;
                    writeln!(out, "{}! logger error !", preamble)?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn step(&mut self, cursor: &mut &[u8], preamble: &str, out: &mut dyn Write) -> DecodeResult<()> {
        match &mut self.stage {
            Stage::Header { header } => {
                let typed = !header.is_empty() || cursor[0] != 0;
                let needed = if typed { 5 } else { 4 };
                // For typeless messages the leading zero byte belongs to
                // the 4-byte length field and is not consumed separately.
                while header.len() < needed && !cursor.is_empty() {
                    header.push(cursor[0]);
                    *cursor = &cursor[1..];
                }
                if header.len() < needed {
                    return Ok(());
                }
                let (type_byte, len_bytes) = if typed {
                    (header[0], &header[1..5])
                } else {
                    (0, &header[0..4])
                };
                let total_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
                if total_len < 4 {
                    return Err(DecodeError);
                }
                let payload_len = (total_len - 4) as usize;
                if !check_type(typed, type_byte, payload_len) {
                    return Err(DecodeError);
                }
                let buffer = if buffers_payload(typed, type_byte) { Some(Vec::new()) } else { None };
                self.stage =
                    Stage::Payload { typed, type_byte, payload_len, remaining: payload_len, buffer, reported_oversize: false };
                Ok(())
            }
            Stage::Payload { typed, type_byte, payload_len, remaining, buffer, reported_oversize } => {
                let typed = *typed;
                let type_byte = *type_byte;
                let payload_len = *payload_len;
                let take = (*remaining).min(cursor.len());
                match buffer {
                    Some(buf) => {
                        if !*reported_oversize && buf.len() + take > MAX_DATA_SIZE {
                            writeln!(out, "{}! Query was too big: {} bytes !", preamble, payload_len)
                                .map_err(|_| DecodeError)?;
                            *reported_oversize = true;
                        }
                        if !*reported_oversize || buf.len() < MAX_DATA_SIZE {
                            let room = MAX_DATA_SIZE.saturating_sub(buf.len());
                            buf.extend_from_slice(&cursor[..take.min(room)]);
                        }
                    }
                    None => {}
                }
                *cursor = &cursor[take..];
                *remaining -= take;
                if *remaining > 0 {
                    return Ok(());
                }
                let oversize = *reported_oversize;
                let owned_buffer = buffer.take();
                self.stage = Stage::Header { header: Vec::with_capacity(5) };
                if oversize {
                    return Ok(());
                }
                match owned_buffer {
                    Some(payload) => process_buffered(typed, type_byte, &payload, preamble, out),
                    None => {
                        let label = if type_byte == COPY_DATA {
                            "[COPY data]"
                        } else {
                            "[password message | gss response | sasl response]"
                        };
                        writeln!(out, "{}{} {} bytes", preamble, label, payload_len).ok();
                        Ok(())
                    }
                }
            }
        }
    }
}

fn process_buffered(typed: bool, type_byte: u8, payload: &[u8], preamble: &str, out: &mut dyn Write) -> DecodeResult<()> {
    write!(out, "{}", preamble).map_err(|_| DecodeError)?;
    let mut cur = PayloadCursor::new(payload);
    if !typed {
        let id = cur.get_u32()?;
        match id {
            STARTUP_MESSAGE => {
                write!(out, "[Startup Message]").map_err(|_| DecodeError)?;
                while cur.remaining() > 1 {
                    write!(out, " ").map_err(|_| DecodeError)?;
                    cur.write_cstr(out)?;
                    write!(out, "=").map_err(|_| DecodeError)?;
                    cur.write_cstr(out)?;
                }
                if cur.get_u8()? != 0 {
                    return Err(DecodeError);
                }
            }
            SSL_REQUEST => {
                write!(out, "[SSL request]").map_err(|_| DecodeError)?;
            }
            GSS_ENC_REQUEST => {
                write!(out, "[GSS Encryption request]").map_err(|_| DecodeError)?;
            }
            CANCEL_REQUEST => {
                write!(out, "[Cancel request]").map_err(|_| DecodeError)?;
                let pid = cur.get_i32()?;
                let key = cur.get_i32()?;
                write!(out, " PID={} key={}", pid, key).map_err(|_| DecodeError)?;
            }
            _ => return Err(DecodeError),
        }
    } else {
        match type_byte {
            BIND => {
                write!(out, "[Bind command]").map_err(|_| DecodeError)?;
                write!(out, " dest_portal=").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
                write!(out, " prep_statement=").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
                log_params(&mut cur, out)?;
                let rsl = cur.get_u16()?;
                if rsl != 0 {
                    write!(out, " res_fmt_codes=").map_err(|_| DecodeError)?;
                    let mut remaining = rsl;
                    while remaining > 0 {
                        let v = cur.get_u16()?;
                        remaining -= 1;
                        write!(out, "{}", v).map_err(|_| DecodeError)?;
                        if remaining != 0 {
                            write!(out, ",").map_err(|_| DecodeError)?;
                        }
                    }
                }
            }
            CLOSE => {
                write!(out, "[Close command]").map_err(|_| DecodeError)?;
                match cur.get_u8()? {
                    b'S' => write!(out, " prep_statement=").map_err(|_| DecodeError)?,
                    b'P' => write!(out, " portal=").map_err(|_| DecodeError)?,
                    _ => return Err(DecodeError),
                }
                cur.write_cstr(out)?;
            }
            COPY_FAIL => {
                write!(out, "[COPY failure]").map_err(|_| DecodeError)?;
                write!(out, " error_mgs=").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
            }
            DESCRIBE => {
                write!(out, "[Describe command]").map_err(|_| DecodeError)?;
                match cur.get_u8()? {
                    b'S' => write!(out, " prep_statement=").map_err(|_| DecodeError)?,
                    b'P' => write!(out, " portal=").map_err(|_| DecodeError)?,
                    _ => return Err(DecodeError),
                }
                cur.write_cstr(out)?;
            }
            EXECUTE => {
                write!(out, "[Execute command]").map_err(|_| DecodeError)?;
                write!(out, " portal=").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
                let rows = cur.get_i32()?;
                write!(out, " max_rows={}", rows).map_err(|_| DecodeError)?;
            }
            FUNCTION_CALL => {
                write!(out, "[function call]").map_err(|_| DecodeError)?;
                let fid = cur.get_u32()?;
                write!(out, " function_id={}", fid).map_err(|_| DecodeError)?;
                log_params(&mut cur, out)?;
                let r = cur.get_u16()?;
                write!(out, " result_fmt={}", r).map_err(|_| DecodeError)?;
            }
            PARSE => {
                write!(out, "[Parse command]").map_err(|_| DecodeError)?;
                write!(out, " prep_statement=").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
                write!(out, " query=").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
                let prm = cur.get_u16()?;
                if prm != 0 {
                    write!(out, " param_types=").map_err(|_| DecodeError)?;
                    let mut remaining = prm;
                    while remaining > 0 {
                        let id = cur.get_u32()?;
                        remaining -= 1;
                        write!(out, "{}", id).map_err(|_| DecodeError)?;
                        if remaining != 0 {
                            write!(out, ",").map_err(|_| DecodeError)?;
                        }
                    }
                }
            }
            QUERY => {
                write!(out, "[simple query] ").map_err(|_| DecodeError)?;
                cur.write_cstr(out)?;
            }
            COPY_DONE => {
                write!(out, "[COPY complete]").map_err(|_| DecodeError)?;
            }
            FLUSH => {
                write!(out, "[Flush command]").map_err(|_| DecodeError)?;
            }
            SYNC => {
                write!(out, "[Sync command]").map_err(|_| DecodeError)?;
            }
            TERMINATE => {
                write!(out, "[Termination]").map_err(|_| DecodeError)?;
            }
            _ => return Err(DecodeError),
        }
    }
    writeln!(out).map_err(|_| DecodeError)?;
    if cur.remaining() != 0 {
        return Err(DecodeError);
    }
    Ok(())
}

fn log_params(cur: &mut PayloadCursor, out: &mut dyn Write) -> DecodeResult<()> {
    let fmt_count = cur.get_u16()?;
    let mut formats: Vec<bool> = Vec::new();
    if fmt_count != 0 {
        write!(out, " fmt_codes=").map_err(|_| DecodeError)?;
        formats.reserve(fmt_count as usize);
        let mut remaining = fmt_count;
        while remaining > 0 {
            let v = cur.get_u16()?;
            formats.push(v != 0);
            remaining -= 1;
            write!(out, "{}", v).map_err(|_| DecodeError)?;
            if remaining != 0 {
                write!(out, ",").map_err(|_| DecodeError)?;
            }
        }
    }
    let prm_count = cur.get_u16()?;
    if prm_count != 0 {
        write!(out, " params=").map_err(|_| DecodeError)?;
        let default_fmt = if formats.len() == 1 { formats[0] } else { false };
        let mut prm = prm_count;
        loop {
            if prm == 0 {
                break;
            }
            prm -= 1;
            let v = cur.get_i32()?;
            if v == -1 {
                write!(out, "NULL").map_err(|_| DecodeError)?;
            } else if v == 0 {
                write!(out, "EMPTY").map_err(|_| DecodeError)?;
            } else {
                let binary = if (prm as usize) < formats.len() { formats[prm as usize] } else { default_fmt };
                let mut remaining_bytes = v as usize;
                while remaining_bytes > 0 {
                    let b = cur.get_u8()?;
                    remaining_bytes -= 1;
                    if binary {
                        write!(out, "{:x}", b).map_err(|_| DecodeError)?;
                    } else {
                        out.write_all(&[b]).map_err(|_| DecodeError)?;
                    }
                }
            }
            if prm != 0 {
                write!(out, ",").map_err(|_| DecodeError)?;
            }
        }
    }
    Ok(())
}

/// Owns one [`FrameDecoder`] per socket descriptor. Survives a brief
/// disconnect/reconnect on the same descriptor by design: only
/// [`DecoderTable::clear_from`] purges an entry, and that is called from
/// the supervisor's peer-drop path, never from the decode path itself.
#[derive(Default)]
pub struct DecoderTable {
    inner: Mutex<HashMap<i32, FrameDecoder>>,
}

impl DecoderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&self, descriptor: i32, data: &[u8], preamble: &str, out: &mut dyn Write) -> io::Result<()> {
        let mut map = self.inner.lock().unwrap();
        let decoder = map.entry(descriptor).or_default();
        decoder.add_data(data, preamble, out)
    }

    pub fn clear_from(&self, descriptor: i32) {
        self.inner.lock().unwrap().remove(&descriptor);
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_once(data: &[u8]) -> String {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        decoder.add_data(data, "peer : ", &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn simple_query() {
        let msg = [0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00];
        let out = decode_once(&msg);
        assert!(out.trim_end().ends_with("[simple query]  SELECT 1;"), "{out:?}");
    }

    #[test]
    fn bind_with_null_parameter() {
        let msg = [
            0x42, 0x00, 0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00,
        ];
        let out = decode_once(&msg);
        assert!(
            out.contains("[Bind command] dest_portal= prep_statement= params=NULL"),
            "{out:?}"
        );
    }

    #[test]
    fn oversize_query_is_skipped_not_buffered() {
        let mut msg = Vec::new();
        msg.push(b'Q');
        let len: u32 = 4 + MAX_DATA_SIZE as u32 + 1;
        msg.extend_from_slice(&len.to_be_bytes());
        msg.extend(std::iter::repeat(b'x').take((len - 4) as usize));
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        decoder.add_data(&msg, "peer : ", &mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("! Query was too big:"), "{s:?}");
        assert!(!decoder.out_of_sync);
    }

    #[test]
    fn split_across_multiple_chunks() {
        let msg = [0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00];
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for chunk in msg.chunks(3) {
            decoder.add_data(chunk, "peer : ", &mut out).unwrap();
        }
        let s = String::from_utf8(out).unwrap();
        assert!(s.trim_end().ends_with("[simple query]  SELECT 1;"), "{s:?}");
    }

    #[test]
    fn startup_message() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"user\0alice\0");
        payload.push(0);
        let mut msg = Vec::new();
        let total_len: u32 = 4 + 4 + payload.len() as u32;
        msg.extend_from_slice(&total_len.to_be_bytes());
        msg.extend_from_slice(&3u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&payload);
        let out = decode_once(&msg);
        assert!(out.contains("[Startup Message] user=alice"), "{out:?}");
    }

    #[test]
    fn unknown_typed_message_marks_out_of_sync() {
        let msg = [b'Z', 0x00, 0x00, 0x00, 0x04];
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        decoder.add_data(&msg, "peer : ", &mut out).unwrap();
        assert!(decoder.out_of_sync);
        let mut out2 = Vec::new();
        decoder.add_data(b"abc", "peer : ", &mut out2).unwrap();
        assert!(String::from_utf8(out2).unwrap().contains("out of sync"));
    }

    #[test]
    fn decoder_table_clear_from_resets_state() {
        let table = DecoderTable::new();
        let msg = [0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00];
        let mut out = Vec::new();
        table.add_data(7, &msg, "", &mut out).unwrap();
        table.clear_from(7);
        let mut out2 = Vec::new();
        table.add_data(7, &msg[..5], "", &mut out2).unwrap();
        assert!(out2.is_empty());
    }
}
