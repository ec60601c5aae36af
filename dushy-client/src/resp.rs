//! # RESP Encoding and Decoding
//!
//! Purpose: Encode client commands into RESP arrays and decode server frames
//! into typed replies. No I/O happens here.
//!
//! ## Design Principles
//! 1. **Resumable Decoding**: A partial frame yields `None` and leaves the
//!    buffer untouched, so decoding picks up after the next socket read.
//! 2. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 3. **Fail Fast**: Invalid framing returns a protocol error carrying the
//!    offending byte offset.
//! 4. **RESP3 Tolerant**: RESP3 frame kinds fold into the same `Reply` model
//!    so push frames stay distinguishable from command replies.
//! 5. **Bounded Nesting**: Aggregates nested deeper than `MAX_DEPTH` are a
//!    protocol error rather than unbounded recursion.

use bytes::{Buf, BytesMut};

use crate::error::{ClientError, ClientResult};

/// Decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK or +PONG style replies.
    Simple(String),
    /// -ERR ... replies (and RESP3 blob errors).
    Error(String),
    /// :123 replies (and RESP3 booleans as 0/1).
    Integer(i64),
    /// $... bulk strings (and RESP3 verbatim, double, big number).
    Bulk(Vec<u8>),
    /// *... arrays (and RESP3 sets).
    Array(Vec<Reply>),
    /// RESP3 %... maps.
    Map(Vec<(Reply, Reply)>),
    /// RESP3 >... out-of-band push frames.
    Push(Vec<Reply>),
    /// Null bulk, null array or RESP3 null.
    Nil,
}

impl Reply {
    /// Returns the textual or binary content of a string-like reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Simple(text) => Some(text.as_bytes()),
            Reply::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Returns true for error replies.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Converts a value into one command argument.
pub trait ToArg {
    /// Appends the wire form of the argument to `out`.
    fn write_arg(&self, out: &mut Vec<u8>);
}

impl ToArg for str {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for String {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for [u8] {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToArg for Vec<u8> {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToArg for bool {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.push(if *self { b'1' } else { b'0' });
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn write_arg(&self, out: &mut Vec<u8>) {
        (**self).write_arg(out);
    }
}

macro_rules! display_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn write_arg(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(self.to_string().as_bytes());
                }
            }
        )*
    };
}

display_arg!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

/// One command: name followed by its arguments.
///
/// Immutable once built; the builder methods consume and return `self`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: &str) -> Self {
        Command {
            args: vec![name.as_bytes().to_vec()],
        }
    }

    /// Appends one argument.
    pub fn arg<A: ToArg + ?Sized>(mut self, arg: &A) -> Self {
        let mut buf = Vec::new();
        arg.write_arg(&mut buf);
        self.args.push(buf);
        self
    }

    /// Appends every element of `args` as its own argument.
    pub fn args<A: ToArg>(mut self, args: &[A]) -> Self {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Command name as sent on the wire.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// All arguments, the name included.
    pub fn parts(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Encodes the command as a RESP array into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(b'*');
        push_usize(out, self.args.len());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.push(b'$');
            push_usize(out, arg.len());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Decodes one reply from the front of `buf`.
///
/// Returns the reply with the number of bytes it occupied, or `None` when
/// `buf` holds only part of a frame.
pub fn decode(buf: &[u8]) -> ClientResult<Option<(Reply, usize)>> {
    let mut parser = Parser::new(buf);
    match parser.value() {
        Ok(Some(reply)) => Ok(Some((reply, parser.pos))),
        Ok(None) => Ok(None),
        Err(err) => Err(ClientError::Protocol {
            position: err.offset as u64,
            reason: err.reason,
        }),
    }
}

/// Incremental decoder fed from socket reads.
///
/// Frame boundaries are found by a resumable scan that never revisits
/// elements it has already walked; replies are only built once a whole
/// frame is buffered.
pub struct Decoder {
    buf: BytesMut,
    scanner: FrameScanner,
    // Bytes already consumed, so errors report stream offsets.
    consumed: u64,
}

impl Decoder {
    /// Creates a decoder with the given initial buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Decoder {
            buf: BytesMut::with_capacity(capacity),
            scanner: FrameScanner::default(),
            consumed: 0,
        }
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete reply, if any.
    pub fn next_reply(&mut self) -> ClientResult<Option<Reply>> {
        let frame_len = match self.scanner.advance(&self.buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(err) => return Err(self.protocol_error(err)),
        };

        let mut parser = Parser::new(&self.buf[..frame_len]);
        let reply = match parser.value() {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return Err(self.protocol_error(DecodeError {
                    offset: frame_len,
                    reason: "truncated frame",
                }))
            }
            Err(err) => return Err(self.protocol_error(err)),
        };
        self.buf.advance(frame_len);
        self.consumed += frame_len as u64;
        Ok(Some(reply))
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn protocol_error(&self, err: DecodeError) -> ClientError {
        ClientError::Protocol {
            position: self.consumed + err.offset as u64,
            reason: err.reason,
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::with_capacity(8 * 1024)
    }
}

/// Aggregate whose elements are still being scanned.
struct OpenFrame {
    remaining: u64,
    // Attributes decorate the value after them instead of counting as one.
    attribute: bool,
}

/// Walks the frame at the front of the buffer one element at a time,
/// keeping its place between calls.
#[derive(Default)]
struct FrameScanner {
    pos: usize,
    open: Vec<OpenFrame>,
}

impl FrameScanner {
    /// Returns the length of the leading frame once all of it is buffered.
    fn advance(&mut self, buf: &[u8]) -> Step<usize> {
        loop {
            let start = self.pos;
            let tag = match buf.get(start) {
                Some(tag) => *tag,
                None => return Ok(None),
            };
            let line_start = start + 1;
            let line_len = match find_crlf(&buf[line_start..]) {
                Some(len) => len,
                None => return Ok(None),
            };
            let line = &buf[line_start..line_start + line_len];
            let mut next = line_start + line_len + 2;
            let mut children = None;

            match tag {
                b'+' | b'-' | b':' | b'_' | b'#' | b',' | b'(' => {}
                b'$' | b'!' | b'=' => {
                    let len = parse_i64(line, line_start)?;
                    if len >= 0 {
                        let len = len as usize;
                        if buf.len() - next < len.saturating_add(2) {
                            return Ok(None);
                        }
                        if &buf[next + len..next + len + 2] != b"\r\n" {
                            return Err(DecodeError {
                                offset: next + len,
                                reason: "missing CRLF after bulk payload",
                            });
                        }
                        next += len + 2;
                    }
                }
                b'*' | b'~' | b'>' | b'%' | b'|' => {
                    if self.open.len() >= MAX_DEPTH {
                        return Err(DecodeError {
                            offset: start,
                            reason: "nesting too deep",
                        });
                    }
                    let count = parse_i64(line, line_start)?;
                    if count > 0 {
                        let count = count as u64;
                        let remaining = match tag {
                            b'%' | b'|' => count.saturating_mul(2),
                            _ => count,
                        };
                        children = Some(OpenFrame {
                            remaining,
                            attribute: tag == b'|',
                        });
                    } else if tag == b'|' {
                        // An empty attribute still precedes its value.
                        self.pos = next;
                        continue;
                    }
                }
                _ => {
                    return Err(DecodeError {
                        offset: start,
                        reason: "unknown reply type",
                    })
                }
            }

            self.pos = next;
            if let Some(frame) = children {
                self.open.push(frame);
                continue;
            }
            if let Some(len) = self.complete_element() {
                return Ok(Some(len));
            }
        }
    }

    /// Records one finished element. Returns the frame length when it was
    /// the last one.
    fn complete_element(&mut self) -> Option<usize> {
        loop {
            let frame = match self.open.last_mut() {
                Some(frame) => frame,
                None => {
                    let len = self.pos;
                    self.pos = 0;
                    return Some(len);
                }
            };
            frame.remaining -= 1;
            if frame.remaining > 0 {
                return None;
            }
            let attribute = frame.attribute;
            self.open.pop();
            if attribute {
                return None;
            }
        }
    }
}

struct DecodeError {
    offset: usize,
    reason: &'static str,
}

type Step<T> = Result<Option<T>, DecodeError>;

/// Deepest aggregate nesting accepted from the server.
const MAX_DEPTH: usize = 512;

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    // Aggregates currently open around `pos`.
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Parser { buf, pos: 0, depth: 0 }
    }

    fn value(&mut self) -> Step<Reply> {
        let start = self.pos;
        let tag = match self.buf.get(self.pos) {
            Some(tag) => *tag,
            None => return Ok(None),
        };
        self.pos += 1;
        let line_start = self.pos;
        let line = match self.line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        if is_aggregate(tag) && self.depth >= MAX_DEPTH {
            return Err(DecodeError {
                offset: start,
                reason: "nesting too deep",
            });
        }

        match tag {
            b'+' => Ok(Some(Reply::Simple(lossy(line)))),
            b'-' => Ok(Some(Reply::Error(lossy(line)))),
            b':' => Ok(Some(Reply::Integer(parse_i64(line, line_start)?))),
            b'$' => self.blob(line, line_start, Reply::Bulk),
            b'!' => self.blob(line, line_start, |data| Reply::Error(lossy(&data))),
            b'=' => self.blob(line, line_start, |data| {
                // Verbatim strings carry a "txt:" style format prefix.
                if data.len() >= 4 && data[3] == b':' {
                    Reply::Bulk(data[4..].to_vec())
                } else {
                    Reply::Bulk(data)
                }
            }),
            b'*' | b'~' => self.aggregate(line, line_start, Reply::Array),
            b'>' => self.aggregate(line, line_start, Reply::Push),
            b'%' => self.map(line, line_start),
            b'|' => {
                // Attributes decorate the next value; skip them.
                if self.map(line, line_start)?.is_none() {
                    return Ok(None);
                }
                self.value()
            }
            b'_' => {
                if !line.is_empty() {
                    return Err(DecodeError {
                        offset: line_start,
                        reason: "null frame with payload",
                    });
                }
                Ok(Some(Reply::Nil))
            }
            b'#' => match line {
                b"t" => Ok(Some(Reply::Integer(1))),
                b"f" => Ok(Some(Reply::Integer(0))),
                _ => Err(DecodeError {
                    offset: line_start,
                    reason: "invalid boolean",
                }),
            },
            b',' | b'(' => Ok(Some(Reply::Bulk(line.to_vec()))),
            _ => Err(DecodeError {
                offset: start,
                reason: "unknown reply type",
            }),
        }
    }

    fn line(&mut self) -> Step<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match find_crlf(rest) {
            Some(idx) => {
                self.pos += idx + 2;
                Ok(Some(&rest[..idx]))
            }
            None => Ok(None),
        }
    }

    fn blob(
        &mut self,
        header: &[u8],
        header_start: usize,
        wrap: impl FnOnce(Vec<u8>) -> Reply,
    ) -> Step<Reply> {
        let len = parse_i64(header, header_start)?;
        if len < 0 {
            return Ok(Some(Reply::Nil));
        }
        let len = len as usize;
        let available = self.buf.len() - self.pos;
        if available < len.saturating_add(2) {
            return Ok(None);
        }
        let data = &self.buf[self.pos..self.pos + len];
        if &self.buf[self.pos + len..self.pos + len + 2] != b"\r\n" {
            return Err(DecodeError {
                offset: self.pos + len,
                reason: "missing CRLF after bulk payload",
            });
        }
        self.pos += len + 2;
        Ok(Some(wrap(data.to_vec())))
    }

    fn aggregate(
        &mut self,
        header: &[u8],
        header_start: usize,
        wrap: fn(Vec<Reply>) -> Reply,
    ) -> Step<Reply> {
        let count = parse_i64(header, header_start)?;
        if count < 0 {
            return Ok(Some(Reply::Nil));
        }
        // The count is untrusted; cap the up-front allocation.
        let mut items = Vec::with_capacity((count as usize).min(1024));
        self.depth += 1;
        for _ in 0..count {
            match self.value()? {
                Some(item) => items.push(item),
                None => return Ok(None),
            }
        }
        self.depth -= 1;
        Ok(Some(wrap(items)))
    }

    fn map(&mut self, header: &[u8], header_start: usize) -> Step<Reply> {
        let count = parse_i64(header, header_start)?;
        if count < 0 {
            return Ok(Some(Reply::Nil));
        }
        let mut entries = Vec::with_capacity((count as usize).min(512));
        self.depth += 1;
        for _ in 0..count {
            let key = match self.value()? {
                Some(key) => key,
                None => return Ok(None),
            };
            let value = match self.value()? {
                Some(value) => value,
                None => return Ok(None),
            };
            entries.push((key, value));
        }
        self.depth -= 1;
        Ok(Some(Reply::Map(entries)))
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|pair| pair == b"\r\n")
}

fn is_aggregate(tag: u8) -> bool {
    matches!(tag, b'*' | b'~' | b'>' | b'%' | b'|')
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8], offset: usize) -> Result<i64, DecodeError> {
    let invalid = DecodeError {
        offset,
        reason: "invalid integer",
    };
    if data.is_empty() {
        return Err(invalid);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        b'+' => (false, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(invalid);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(invalid);
        }
        value = match value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
        {
            Some(v) => v,
            None => return Err(invalid),
        };
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
