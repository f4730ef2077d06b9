//! Resumable parser for the length-prefixed array wire protocol:
//!
//! ```text
//! request = "*" count CRLF 1*bulk
//! bulk    = "$" len  CRLF len-bytes CRLF
//! ```

use crate::buffer::DynBuf;
use crate::error::{Result, VecsError};

/// Implementation ceiling on the array count; guards against a hostile or
/// corrupt length field driving an unbounded allocation.
const MAX_ARGC: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Init,
    ExpectArrayCount,
    ExpectBulkLen,
    ExpectBulkData,
    Error,
}

/// One fully-parsed command: an owned vector of argument byte strings.
pub type Command = Vec<Vec<u8>>;

/// A resumable state machine over a [`DynBuf`]. `parse_next` consumes a
/// single complete command per call; callers loop it to drain everything
/// currently buffered.
#[derive(Debug)]
pub struct Parser {
    state: ParserState,
    argc: usize,
    argv: Vec<Vec<u8>>,
    bulk_len: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self { state: ParserState::Init, argc: 0, argv: Vec::new(), bulk_len: 0 }
    }

    pub fn is_errored(&self) -> bool {
        self.state == ParserState::Error
    }

    fn fail(&mut self) -> Result<Option<Command>> {
        self.argv.clear();
        self.state = ParserState::Error;
        Err(VecsError::Protocol)
    }

    /// Attempts to parse one complete command from the front of `buf`.
    ///
    /// Returns `Ok(None)` ("need more") and leaves `buf` untouched past
    /// whatever was already consumed on a prior call; returns
    /// `Ok(Some(argv))` once a full command has arrived, having consumed
    /// exactly its bytes; returns `Err` on a malformed request, after which
    /// the parser is permanently in the `Error` state.
    pub fn parse_next(&mut self, buf: &mut DynBuf) -> Result<Option<Command>> {
        loop {
            match self.state {
                ParserState::Error => return Err(VecsError::Protocol),

                ParserState::Init => {
                    if buf.as_slice().is_empty() {
                        return Ok(None);
                    }
                    if buf.as_slice()[0] != b'*' {
                        return self.fail();
                    }
                    buf.consume(1);
                    self.state = ParserState::ExpectArrayCount;
                }

                ParserState::ExpectArrayCount => {
                    let Some(line) = take_line(buf) else { return Ok(None) };
                    let Some(count) = parse_ascii_i64(&line) else { return self.fail() };
                    if count <= 0 || count > MAX_ARGC {
                        return self.fail();
                    }
                    self.argc = count as usize;
                    self.argv = Vec::with_capacity(self.argc);
                    self.state = ParserState::ExpectBulkLen;
                }

                ParserState::ExpectBulkLen => {
                    if buf.as_slice().is_empty() {
                        return Ok(None);
                    }
                    if buf.as_slice()[0] != b'$' {
                        return self.fail();
                    }
                    let Some(line) = take_line_after(buf, 1) else { return Ok(None) };
                    let Some(len) = parse_ascii_i64(&line) else { return self.fail() };
                    if len < 0 {
                        return self.fail();
                    }
                    self.bulk_len = len as usize;
                    self.state = ParserState::ExpectBulkData;
                }

                ParserState::ExpectBulkData => {
                    let needed = self.bulk_len + 2;
                    if buf.as_slice().len() < needed {
                        return Ok(None);
                    }
                    let data = buf.as_slice()[..self.bulk_len].to_vec();
                    let trailer = &buf.as_slice()[self.bulk_len..needed];
                    if trailer != b"\r\n" {
                        return self.fail();
                    }
                    buf.consume(needed);
                    self.argv.push(data);

                    if self.argv.len() == self.argc {
                        let argv = std::mem::take(&mut self.argv);
                        self.state = ParserState::Init;
                        self.argc = 0;
                        self.bulk_len = 0;
                        return Ok(Some(argv));
                    }
                    self.state = ParserState::ExpectBulkLen;
                }
            }
        }
    }
}

/// If a CRLF-terminated line is available starting at `skip` bytes into
/// `buf`, consumes the line plus its CRLF (skip bytes included) and returns
/// the line's content (excluding `skip` bytes and the CRLF).
fn take_line_after(buf: &mut DynBuf, skip: usize) -> Option<Vec<u8>> {
    let slice = buf.as_slice();
    let rel = find_crlf(&slice[skip..])?;
    let line = slice[skip..skip + rel].to_vec();
    buf.consume(skip + rel + 2);
    Some(line)
}

fn take_line(buf: &mut DynBuf) -> Option<Vec<u8>> {
    take_line_after(buf, 0)
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(2).position(|w| w == b"\r\n")
}

fn parse_ascii_i64(bytes: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let s = s.strip_prefix('-').unwrap_or(s);
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
