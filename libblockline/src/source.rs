//! Byte-accurate line reading over any `Read`, plus bounded re-reads over
//! `Read + Seek` sources.

use log::trace;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::error::{Error, ParseContext, Result, StructuralFault};
use crate::scanner::Span;

/// One physical line with its position in the stream.
#[derive(Debug, Clone)]
pub struct RawLine {
    /// Line text without `\n` or a trailing `\r`.
    pub text: String,
    /// One-based line number.
    pub number: usize,
    /// Byte offset of the first byte of the line.
    pub offset: u64,
}

/// Forward-only line reader that keeps track of byte offsets.
pub struct LineReader<R> {
    reader: BufReader<R>,
    offset: u64,
    number: usize,
    buf: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            offset: 0,
            number: 0,
            buf: Vec::new(),
        }
    }

    /// Byte offset just past the last line returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_line(&mut self, ctx: &ParseContext) -> Result<Option<RawLine>> {
        self.buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.buf)?;
        if read == 0 {
            return Ok(None);
        }
        let start = self.offset;
        self.offset += read as u64;
        self.number += 1;

        let mut bytes = &self.buf[..];
        if let Some(rest) = bytes.strip_suffix(b"\n") {
            bytes = rest;
        }
        if let Some(rest) = bytes.strip_suffix(b"\r") {
            bytes = rest;
        }
        let text = std::str::from_utf8(bytes).map_err(|_| {
            Error::structural(StructuralFault::InvalidUtf8, ctx, self.number, start)
        })?;
        Ok(Some(RawLine {
            text: text.to_string(),
            number: self.number,
            offset: start,
        }))
    }
}

/// A bounded slice of the source, read once and sliced many times.
#[derive(Debug, Clone)]
pub struct Window {
    span: Span,
    bytes: Vec<u8>,
}

impl Window {
    /// Seek to `span.start` and read exactly `span.len()` bytes.
    pub fn read<R: Read + Seek>(source: &Mutex<R>, span: Span) -> Result<Self> {
        let mut guard = source.lock().map_err(|_| Error::LockPoisoned)?;
        guard.seek(SeekFrom::Start(span.start))?;
        let mut bytes = vec![0u8; span.len() as usize];
        guard.read_exact(&mut bytes)?;
        trace!("Re-read {} bytes at offset {}", bytes.len(), span.start);
        Ok(Self { span, bytes })
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn covers(&self, span: Span) -> bool {
        self.span.contains(span)
    }

    /// Text of a sub-span, if it lies inside this window and is valid UTF-8.
    pub fn text(&self, span: Span) -> Option<&str> {
        if !self.covers(span) {
            return None;
        }
        let from = (span.start - self.span.start) as usize;
        let to = (span.end - self.span.start) as usize;
        std::str::from_utf8(&self.bytes[from..to]).ok()
    }
}
