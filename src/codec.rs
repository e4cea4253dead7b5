//! Binary encoding of a [`VisitorCookie`].
//!
//! Little-endian throughout. Layout:
//!
//! ```text
//! [writer version: u8][min reader version: u8][flags: u8][relvar offset: u32]
//! fixed section: repeated [tag: u8][value], tags strictly ascending, 0 ends it
//!    1 first hit time gmt      i64   (omitted when 0)
//!    2 last hit time gmt       i64   (omitted when 0 or excluded by the caller)
//!    3 last hit time local     i64
//!    4 last visit num          u32
//!    5 last purchase time gmt  i64
//!    6 first hit referrer      str
//!    7 first hit url           str
//!    8 first hit pagename      str
//!    9 last purchase num       u32
//!   10 merchandising           str
//!   11 purchase ids            [count: u8][count x str]
//! relvar section (starts exactly at relvar offset):
//!    repeated [relation id: u16][count: u8][count x (str, i64 timestamp, u8 revision)]
//!    terminated by relation id 0xFFFF
//! ```
//!
//! Strings are NUL-terminated. Zero/empty values are omitted; the reader keeps
//! an expected tag and treats any field whose tag it doesn't see as absent.
//! Writers may append new tags after 11; older readers skip them by jumping to
//! the relvar offset.

use crate::cookie::{AllocationPolicy, RelationId, VisitorCookie, INVALID_RELATION_ID};
use crate::errors::DecodeError;

/// Version written by this encoder.
pub const SERIAL_VERSION: u8 = 0;
/// Oldest reader able to decode what this encoder writes.
pub const MIN_READER_VERSION: u8 = 0;
/// Newest `min reader version` this decoder accepts.
pub const SUPPORTED_READER_VERSION: u8 = 0;

const HEADER_LEN: usize = 7;
const OFFSET_POS: usize = 3;
const MAX_ELEMENTS_PER_VAR: usize = u8::MAX as usize;

mod tag {
    pub const END: u8 = 0;
    pub const FIRST_HIT_TIME_GMT: u8 = 1;
    pub const LAST_HIT_TIME_GMT: u8 = 2;
    pub const LAST_HIT_TIME_VISITOR_LOCAL: u8 = 3;
    pub const LAST_VISIT_NUM: u8 = 4;
    pub const LAST_PURCHASE_TIME_GMT: u8 = 5;
    pub const FIRST_HIT_REFERRER: u8 = 6;
    pub const FIRST_HIT_URL: u8 = 7;
    pub const FIRST_HIT_PAGENAME: u8 = 8;
    pub const LAST_PURCHASE_NUM: u8 = 9;
    pub const MERCHANDISING: u8 = 10;
    pub const PURCHASE_IDS: u8 = 11;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Write the last hit time into the blob. Backends that keep it in a
    /// separate column (to expire records without decoding) turn this off.
    pub include_last_hit_time: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            include_last_hit_time: true,
        }
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let end = match bytes.iter().position(|&b| b == 0) {
            Some(nul) => {
                log::warn!("Truncating string at interior NUL (byte {nul} of {})", bytes.len());
                nul
            }
            None => bytes.len(),
        };
        self.buf.extend_from_slice(&bytes[..end]);
        self.buf.push(0);
    }

    fn i64_field(&mut self, tag: u8, v: i64) {
        if v != 0 {
            self.u8(tag);
            self.i64(v);
        }
    }

    fn u32_field(&mut self, tag: u8, v: u32) {
        if v != 0 {
            self.u8(tag);
            self.u32(v);
        }
    }

    fn str_field(&mut self, tag: u8, s: &str) {
        if !s.is_empty() {
            self.u8(tag);
            self.str(s);
        }
    }
}

/// Encodes `cookie`. Cleared relation variables are not written.
pub fn encode(cookie: &VisitorCookie<'_>, options: EncodeOptions) -> Vec<u8> {
    let mut w = Writer {
        buf: Vec::with_capacity(512),
    };

    w.u8(SERIAL_VERSION);
    w.u8(MIN_READER_VERSION);
    w.u8(0); // flags
    w.u32(0); // patched below

    w.i64_field(tag::FIRST_HIT_TIME_GMT, cookie.first_hit_time_gmt());
    if options.include_last_hit_time {
        w.i64_field(tag::LAST_HIT_TIME_GMT, cookie.last_hit_time_gmt());
    }
    w.i64_field(tag::LAST_HIT_TIME_VISITOR_LOCAL, cookie.last_hit_time_visitor_local());
    w.u32_field(tag::LAST_VISIT_NUM, cookie.last_visit_num());
    w.i64_field(tag::LAST_PURCHASE_TIME_GMT, cookie.last_purchase_time_gmt());
    w.str_field(tag::FIRST_HIT_REFERRER, cookie.first_hit_referrer());
    w.str_field(tag::FIRST_HIT_URL, cookie.first_hit_url());
    w.str_field(tag::FIRST_HIT_PAGENAME, cookie.first_hit_pagename());
    w.u32_field(tag::LAST_PURCHASE_NUM, cookie.last_purchase_num());
    w.str_field(tag::MERCHANDISING, cookie.merchandising());

    let purchase_ids = cookie.purchase_ids();
    if !purchase_ids.is_empty() {
        // Ring capacity keeps this far below u8::MAX.
        let count = purchase_ids.len().min(u8::MAX as usize);
        w.u8(tag::PURCHASE_IDS);
        w.u8(count as u8);
        for id in purchase_ids.iter().skip(purchase_ids.len() - count) {
            w.str(id);
        }
    }
    w.u8(tag::END);

    let relvar_offset = w.buf.len() as u32;
    w.buf[OFFSET_POS..HEADER_LEN].copy_from_slice(&relvar_offset.to_le_bytes());

    let vars = cookie.relation_vars();
    for rid in vars.set_ids() {
        let total = vars.element_count(rid);
        let skip = total.saturating_sub(MAX_ELEMENTS_PER_VAR);
        if skip > 0 {
            log::warn!(
                "Relation variable {rid} holds {total} elements; only the newest {MAX_ELEMENTS_PER_VAR} are encoded"
            );
        }
        w.u16(rid);
        w.u8((total - skip) as u8);
        for rv in vars.elements(rid).skip(skip) {
            w.str(&rv.value);
            w.i64(rv.timestamp);
            w.u8(rv.revision);
        }
    }
    w.u16(INVALID_RELATION_ID);

    w.buf
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_le_bytes)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.array().map(i64::from_le_bytes)
    }

    fn str(&mut self) -> Result<&'a str, DecodeError> {
        let start = self.pos;
        let rest = &self.buf[start.min(self.buf.len())..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::Truncated {
                offset: start,
                needed: rest.len() + 1,
            })?;
        let bytes = self.take(len + 1)?;
        std::str::from_utf8(&bytes[..len]).map_err(|_| DecodeError::InvalidUtf8 { offset: start })
    }
}

/// Decodes `buf` into `cookie` through its public mutators.
///
/// Fields already set on `cookie` are overwritten only where the stream has a
/// value; callers normally start from a blank cookie. Relation variables with
/// more than one element come back as linear slots, single values as `Last`.
pub fn decode_into(cookie: &mut VisitorCookie<'_>, buf: &[u8]) -> Result<(), DecodeError> {
    let mut r = Reader { buf, pos: 0 };

    let _writer_version = r.u8()?;
    let min_reader_version = r.u8()?;
    if min_reader_version > SUPPORTED_READER_VERSION {
        return Err(DecodeError::VersionIncompatible {
            found: min_reader_version,
            supported: SUPPORTED_READER_VERSION,
        });
    }
    let _flags = r.u8()?;
    let relvar_offset = r.u32()? as usize;
    if relvar_offset > buf.len() {
        return Err(DecodeError::Truncated {
            offset: buf.len(),
            needed: relvar_offset - buf.len(),
        });
    }

    let mut next = r.u8()?;

    if next == tag::FIRST_HIT_TIME_GMT {
        cookie.set_first_hit_time_gmt(r.i64()?);
        next = r.u8()?;
    }
    if next == tag::LAST_HIT_TIME_GMT {
        cookie.set_last_hit_time_gmt(r.i64()?);
        next = r.u8()?;
    }
    if next == tag::LAST_HIT_TIME_VISITOR_LOCAL {
        cookie.set_last_hit_time_visitor_local(r.i64()?);
        next = r.u8()?;
    }
    if next == tag::LAST_VISIT_NUM {
        cookie.set_last_visit_num(r.u32()?);
        next = r.u8()?;
    }
    if next == tag::LAST_PURCHASE_TIME_GMT {
        cookie.set_last_purchase_time_gmt(r.i64()?);
        next = r.u8()?;
    }
    if next == tag::FIRST_HIT_REFERRER {
        cookie.set_first_hit_referrer(r.str()?);
        next = r.u8()?;
    }
    if next == tag::FIRST_HIT_URL {
        cookie.set_first_hit_url(r.str()?);
        next = r.u8()?;
    }
    if next == tag::FIRST_HIT_PAGENAME {
        cookie.set_first_hit_pagename(r.str()?);
        next = r.u8()?;
    }
    if next == tag::LAST_PURCHASE_NUM {
        cookie.set_last_purchase_num(r.u32()?);
        next = r.u8()?;
    }
    if next == tag::MERCHANDISING {
        cookie.set_merchandising(r.str()?);
        next = r.u8()?;
    }
    if next == tag::PURCHASE_IDS {
        let count = r.u8()?;
        for _ in 0..count {
            cookie.set_purchase_id(r.str()?);
        }
        next = r.u8()?;
    }
    if next != tag::END {
        log::debug!("Skipping unknown cookie fields starting at tag {next}");
    }

    if r.pos > relvar_offset {
        return Err(DecodeError::Malformed(format!(
            "fixed section ends at {} past relation variable offset {relvar_offset}",
            r.pos
        )));
    }
    r.pos = relvar_offset;

    loop {
        let rid: RelationId = r.u16()?;
        if rid == INVALID_RELATION_ID {
            break;
        }
        let count = r.u8()? as usize;
        let policy = if count > 1 {
            AllocationPolicy::Linear(count)
        } else {
            AllocationPolicy::Last
        };

        let mut handle = None;
        for _ in 0..count {
            let value = r.str()?;
            let timestamp = r.i64()?;
            let revision = r.u8()?;
            match handle {
                Some(h) => {
                    cookie.add_linear_element(h, value, timestamp, revision);
                }
                None => handle = cookie.set_var(rid, value, timestamp, revision, policy),
            }
        }
    }

    Ok(())
}
