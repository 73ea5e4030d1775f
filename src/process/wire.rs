//! Framing for the engine pipes.
//!
//! | Pipe    | Direction      | Framing                                          |
//! |---------|----------------|--------------------------------------------------|
//! | command | host -> engine | one line per command, tab-separated fields       |
//! | input   | host -> engine | length-encoded records                           |
//! | persist | engine -> host | opaque records, each terminated by a NUL byte    |
//! | output  | engine -> host | a JSON array of result objects                   |
//! | log     | engine -> host | one JSON object per line                         |
//!
//! A length-encoded record is a big-endian `i32` field count followed, for
//! each field, by a big-endian `i32` byte length and the UTF-8 bytes.

use super::{ProcessError, StreamError};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde_json::Value;
use std::cell::Cell;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::rc::Rc;

/// Name of the trailing field that carries control messages.
pub const CONTROL_FIELD_NAME: &str = ".";

/// Control message prefix requesting a flush; the flush id follows.
pub const FLUSH_MESSAGE_PREFIX: &str = "f";

/// Build one command line: `verb<TAB>arg<TAB>...\n`.
pub fn encode_command<S: AsRef<str>>(verb: &str, args: &[S]) -> Result<String, ProcessError> {
    let mut line = String::new();
    for field in std::iter::once(verb).chain(args.iter().map(AsRef::as_ref)) {
        if field.contains(|c: char| c == '\t' || c == '\n') {
            return Err(ProcessError::InvalidCommandField(field.to_string()));
        }
        if !line.is_empty() {
            line.push('\t');
        }
        line.push_str(field);
    }
    line.push('\n');
    Ok(line)
}

/// Writes length-encoded records.
pub struct LengthEncodedWriter<W: Write> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> LengthEncodedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// Write one record. The record is assembled in memory first so a
    /// failure never leaves half a length prefix on the pipe.
    pub fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        let mut record = Vec::with_capacity(4 + fields.len() * 8);
        record.extend_from_slice(&encode_len(fields.len())?);
        for field in fields {
            let bytes = field.as_ref().as_bytes();
            record.extend_from_slice(&encode_len(bytes.len())?);
            record.extend_from_slice(bytes);
        }
        self.inner.write_all(&record)?;
        self.bytes_written += record.len() as u64;
        Ok(())
    }

    /// Write a control record of `num_fields` fields: all empty except the
    /// trailing control field, which holds `message`.
    pub fn write_control(&mut self, num_fields: usize, message: &str) -> io::Result<()> {
        let mut fields = vec![""; num_fields.max(1)];
        if let Some(last) = fields.last_mut() {
            *last = message;
        }
        self.write_record(&fields)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn encode_len(len: usize) -> io::Result<[u8; 4]> {
    i32::try_from(len)
        .map(i32::to_be_bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record field too long"))
}

/// Reads length-encoded records back.
pub struct LengthEncodedReader<R: Read> {
    inner: R,
}

impl<R: Read> LengthEncodedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, `None` at a clean end of stream.
    pub fn read_record(&mut self) -> io::Result<Option<Vec<String>>> {
        let count = match self.read_len()? {
            Some(count) => count,
            None => return Ok(None),
        };
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self
                .read_len()?
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "record truncated"))?;
            let mut bytes = vec![0u8; len];
            self.inner.read_exact(&mut bytes)?;
            let field = String::from_utf8(bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fields.push(field);
        }
        Ok(Some(fields))
    }

    fn read_len(&mut self) -> io::Result<Option<usize>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "length prefix truncated")),
                n => filled += n,
            }
        }
        usize::try_from(i32::from_be_bytes(buf))
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative length prefix"))
    }
}

/// Splits a stream into NUL-terminated records.
///
/// Yields each record without its terminator. Bytes left over when the
/// stream ends produce a single [`StreamError::TruncatedStateRecord`], after
/// which the iterator is exhausted.
pub struct NulDelimitedReader<R: Read> {
    inner: BufReader<R>,
    done: bool,
}

impl<R: Read> NulDelimitedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            done: false,
        }
    }
}

impl<R: Read> Iterator for NulDelimitedReader<R> {
    type Item = Result<Vec<u8>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut record = Vec::new();
        match self.inner.read_until(0, &mut record) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) if record.last() == Some(&0) => {
                record.pop();
                Some(Ok(record))
            }
            Ok(len) => {
                self.done = true;
                Some(Err(StreamError::TruncatedStateRecord { len }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Where the results stream stands: records handed out so far and what
/// arrived after the last one.
#[derive(Debug, Default, Clone, Copy)]
struct ArrayProgress {
    records: u64,
    opened: bool,
    tail_len: usize,
    partial: bool,
}

/// Records every byte the deserializer pulls so an end of stream can be
/// told apart from a record cut off mid-way.
struct ProgressReader<R> {
    inner: R,
    progress: Rc<Cell<ArrayProgress>>,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut progress = self.progress.get();
        progress.tail_len += n;
        for &byte in &buf[..n] {
            if byte.is_ascii_whitespace() || byte == b',' {
                continue;
            }
            if !progress.opened && byte == b'[' {
                progress.opened = true;
            } else {
                progress.partial = true;
            }
        }
        self.progress.set(progress);
        Ok(n)
    }
}

struct ArrayElements<'a, F> {
    on_record: &'a mut F,
    progress: &'a Cell<ArrayProgress>,
}

impl<'de, F: FnMut(Value)> Visitor<'de> for ArrayElements<'_, F> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON array of result records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(value) = seq.next_element::<Value>()? {
            let progress = self.progress.get();
            self.progress.set(ArrayProgress {
                records: progress.records + 1,
                opened: true,
                ..ArrayProgress::default()
            });
            (self.on_record)(value);
        }
        Ok(())
    }
}

/// Stream the elements of the JSON array the engine writes, handing each
/// to `on_record` as soon as it is parsed. Returns the number of records.
///
/// The engine writes the closing bracket only when it exits, so a stream
/// that ends between records is a clean end. A stream that ends inside a
/// record is [`StreamError::TruncatedResult`]; anything that is not JSON
/// is [`StreamError::MalformedRecord`].
pub fn read_json_array<R, F>(stream: R, mut on_record: F) -> Result<u64, StreamError>
where
    R: Read,
    F: FnMut(Value),
{
    let progress = Rc::new(Cell::new(ArrayProgress::default()));
    let reader = ProgressReader {
        inner: BufReader::new(stream),
        progress: Rc::clone(&progress),
    };
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let outcome = (&mut deserializer)
        .deserialize_seq(ArrayElements {
            on_record: &mut on_record,
            progress: &progress,
        })
        .and_then(|()| deserializer.end());

    let progress = progress.get();
    match outcome {
        Ok(()) => Ok(progress.records),
        Err(e) if e.is_eof() && !progress.partial => Ok(progress.records),
        Err(e) if e.is_eof() => Err(StreamError::TruncatedResult {
            len: progress.tail_len,
        }),
        Err(e) if e.is_io() => Err(StreamError::Io(e.into())),
        Err(e) => Err(StreamError::MalformedRecord(e.to_string())),
    }
}
