//! Byte-stream file interface over resizable byte datasets.
//!
//! An internal file is a random-access view over a `Bytes` dataset in the
//! `/data` or `/documentation` section. Text modes decode to ASCII unless
//! UTF-8 was requested explicitly; binary modes hand out raw bytes. Every
//! write re-stamps the dataset with the creator's current provenance, so
//! dependency lists stay accurate while a codelet streams output.

use std::sync::Arc;

use crate::codelet::Creator;
use crate::error::{Error, Result};
use crate::paper::PaperInner;
use crate::stamp;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    /// Parse `r`, `w`, `a`, `rb`, `wb`, `ab`.
    pub fn parse(mode: &str) -> Result<(OpenMode, bool)> {
        let (kind, binary) = match mode {
            "r" => (OpenMode::Read, false),
            "w" => (OpenMode::Write, false),
            "a" => (OpenMode::Append, false),
            "rb" => (OpenMode::Read, true),
            "wb" => (OpenMode::Write, true),
            "ab" => (OpenMode::Append, true),
            other => return Err(Error::Format(format!("unknown file mode {}", other))),
        };
        Ok((kind, binary))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Utf8,
}

impl Encoding {
    pub fn parse(name: &str) -> Result<Encoding> {
        match name.to_ascii_lowercase().as_str() {
            "ascii" => Ok(Encoding::Ascii),
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            other => Err(Error::Format(format!("unsupported encoding {}", other))),
        }
    }
}

/// What a read returns: text in text mode, raw bytes in binary mode.
#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn into_dynamic(self) -> rhai::Dynamic {
        match self {
            FileContent::Text(s) => rhai::Dynamic::from(s),
            FileContent::Binary(b) => rhai::Dynamic::from_blob(b),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FileContent::Text(s) => s.into_bytes(),
            FileContent::Binary(b) => b,
        }
    }
}

pub struct InternalFile {
    paper: Arc<PaperInner>,
    path: String,
    mode: OpenMode,
    binary: bool,
    encoding: Option<Encoding>,
    pos: usize,
    closed: bool,
    creator: Creator,
}

impl InternalFile {
    /// Wrap an existing byte dataset. The caller (the paper) has already
    /// created the dataset and enforced the ownership rules.
    pub(crate) fn new(
        paper: Arc<PaperInner>,
        path: String,
        mode: OpenMode,
        binary: bool,
        encoding: Option<Encoding>,
        creator: Creator,
    ) -> Result<InternalFile> {
        let pos = match mode {
            OpenMode::Append => {
                let store = paper.store.lock().unwrap();
                byte_len(store.require(&path)?)?
            }
            _ => 0,
        };
        let file = InternalFile {
            paper,
            path,
            mode,
            binary,
            encoding,
            pos,
            closed: false,
            creator,
        };
        file.stamp()?;
        Ok(file)
    }

    pub fn name(&self) -> &str {
        &self.path
    }

    pub fn writable(&self) -> bool {
        self.mode != OpenMode::Read
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Format(format!("{} has been closed", self.path)));
        }
        Ok(())
    }

    fn stamp(&self) -> Result<()> {
        if !self.writable() {
            return Ok(());
        }
        let mut store = self.paper.store.lock().unwrap();
        let node = store.require_mut(&self.path)?;
        stamp::stamp(node, "file", &self.creator.stamp_attrs())?;
        drop(store);
        self.creator.note_output(&self.path);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let store = self.paper.store.lock().unwrap();
        byte_len(store.require(&self.path)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn convert(&self, data: Vec<u8>) -> Result<FileContent> {
        if self.binary {
            return Ok(FileContent::Binary(data));
        }
        match self.encoding {
            Some(Encoding::Utf8) => String::from_utf8(data)
                .map(FileContent::Text)
                .map_err(|_| Error::Format(format!("{}: invalid UTF-8", self.path))),
            // ASCII is the implicit text encoding.
            Some(Encoding::Ascii) | None => {
                if data.iter().any(|b| *b > 0x7f) {
                    return Err(Error::Format(format!(
                        "{}: non-ASCII byte in text-mode read",
                        self.path
                    )));
                }
                Ok(FileContent::Text(data.iter().map(|b| *b as char).collect()))
            }
        }
    }

    /// Read `size` bytes (or the rest of the file).
    pub fn read(&mut self, size: Option<usize>) -> Result<FileContent> {
        self.check_open()?;
        let data = {
            let store = self.paper.store.lock().unwrap();
            let bytes = byte_slice(store.require(&self.path)?)?;
            let end = match size {
                Some(n) => (self.pos + n).min(bytes.len()),
                None => bytes.len(),
            };
            let start = self.pos.min(bytes.len());
            bytes[start..end].to_vec()
        };
        self.pos += data.len();
        self.convert(data)
    }

    /// Read up to and including the next `\n`. Probes with exponentially
    /// growing windows so the cost stays logarithmic in the line length.
    pub fn readline(&mut self) -> Result<FileContent> {
        self.check_open()?;
        let data = {
            let store = self.paper.store.lock().unwrap();
            let bytes = byte_slice(store.require(&self.path)?)?;
            let start = self.pos.min(bytes.len());
            let remaining = &bytes[start..];
            let mut probe = 128usize;
            loop {
                let window = probe.min(remaining.len());
                if let Some(eol) = remaining[..window].iter().position(|b| *b == 0x0a) {
                    break remaining[..=eol].to_vec();
                }
                if window == remaining.len() {
                    break remaining.to_vec();
                }
                probe *= 2;
            }
        };
        self.pos += data.len();
        self.convert(data)
    }

    pub fn readlines(&mut self) -> Result<Vec<FileContent>> {
        self.check_open()?;
        let mut lines = Vec::new();
        loop {
            let line = self.readline()?;
            let empty = match &line {
                FileContent::Text(s) => s.is_empty(),
                FileContent::Binary(b) => b.is_empty(),
            };
            if empty {
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }

    pub fn tell(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.pos)
    }

    /// Absolute seek, clamped to the file bounds.
    pub fn seek(&mut self, offset: i64) -> Result<()> {
        self.check_open()?;
        let len = self.len()? as i64;
        self.pos = offset.clamp(0, len) as usize;
        Ok(())
    }

    pub fn truncate(&mut self, size: Option<usize>) -> Result<()> {
        self.check_open()?;
        let size = size.unwrap_or(self.pos);
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(&self.path)?;
            match node.value_mut() {
                Some(Value::Bytes(b)) => b.truncate(size),
                _ => return Err(Error::Format(format!("{} is not a byte dataset", self.path))),
            }
        }
        self.stamp()
    }

    pub fn write_str(&mut self, text: &str) -> Result<()> {
        let encoded = match (self.binary, self.encoding) {
            (true, _) => text.as_bytes().to_vec(),
            (false, Some(Encoding::Utf8)) => text.as_bytes().to_vec(),
            (false, _) => {
                if !text.is_ascii() {
                    return Err(Error::Format(format!(
                        "{}: non-ASCII text without an encoding",
                        self.path
                    )));
                }
                text.as_bytes().to_vec()
            }
        };
        self.write_bytes(&encoded)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if self.mode == OpenMode::Read {
            return Err(Error::PermissionDenied(format!(
                "{} not open for writing",
                self.path
            )));
        }
        if data.is_empty() {
            // The container cannot represent an empty slice assignment.
            return Ok(());
        }
        {
            let mut store = self.paper.store.lock().unwrap();
            let node = store.require_mut(&self.path)?;
            let bytes = match node.value_mut() {
                Some(Value::Bytes(b)) => b,
                _ => return Err(Error::Format(format!("{} is not a byte dataset", self.path))),
            };
            let end = self.pos + data.len();
            if end > bytes.len() {
                bytes.resize(end, 0);
            }
            bytes[self.pos..end].copy_from_slice(data);
        }
        self.pos += data.len();
        self.stamp()
    }

    pub fn flush(&self) -> Result<()> {
        self.check_open()
    }

    /// Close the file; one final stamp, then all operations fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.stamp()?;
        self.closed = true;
        Ok(())
    }
}

fn byte_len(node: &crate::store::Node) -> Result<usize> {
    match node.value() {
        Some(Value::Bytes(b)) => Ok(b.len()),
        _ => Err(Error::Format("not a byte dataset".into())),
    }
}

fn byte_slice(node: &crate::store::Node) -> Result<&[u8]> {
    match node.value() {
        Some(Value::Bytes(b)) => Ok(b),
        _ => Err(Error::Format("not a byte dataset".into())),
    }
}
