//! Streaming line source over very large text inputs
//!
//! Reads plain or gzip-compressed files one line at a time without
//! materialising them. Lines that fail to decode are either replaced
//! lossily or skipped and counted; they never abort the run. Opening
//! errors surface before the first record is produced.

use crate::error::{Error, Result};
use crate::types::Record;
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const READ_BUFFER_BYTES: usize = 1 << 16;

/// Declared text encoding of the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    /// Every byte maps to one char; decoding never fails
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

/// What to do with a line that is not valid under the declared encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Substitute U+FFFD and keep the line
    #[default]
    Replace,
    /// Drop the line and count it as a decode error
    Skip,
}

/// Layout of each line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    Lines,
    Tsv,
    Csv,
}

impl InputFormat {
    fn delimiter(&self) -> Option<char> {
        match self {
            Self::Lines => None,
            Self::Tsv => Some('\t'),
            Self::Csv => Some(','),
        }
    }
}

/// Compression of the input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Gzip when the file name ends in `.gz`
    #[default]
    Auto,
    None,
    Gzip,
}

impl Compression {
    /// Resolve `Auto` against a path
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => {
                if path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
                {
                    Self::Gzip
                } else {
                    Self::None
                }
            }
            other => other,
        }
    }
}

/// Options controlling how an input is read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOptions {
    #[serde(default)]
    pub encoding: Encoding,

    #[serde(default)]
    pub on_decode_error: DecodePolicy,

    #[serde(default)]
    pub format: InputFormat,

    /// First line of a delimited input is a header row
    #[serde(default = "default_true")]
    pub has_header: bool,

    /// Columns to classify (header names or zero-based indices); empty means the whole line
    #[serde(default)]
    pub fields: Vec<String>,

    #[serde(default)]
    pub compression: Compression,

    /// Known or approximate record count, used only for ETA
    #[serde(default)]
    pub expected_records: Option<u64>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Utf8,
            on_decode_error: DecodePolicy::Replace,
            format: InputFormat::Lines,
            has_header: true,
            fields: Vec::new(),
            compression: Compression::Auto,
            expected_records: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Position to resume streaming from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    /// Last line already processed; streaming starts at `line + 1`
    pub line: u64,

    /// Byte offset just past `line`, when known
    pub byte_offset: Option<u64>,
}

impl ResumePoint {
    /// Resume after a line number, skipping lines to get there
    pub fn after_line(line: u64) -> Self {
        Self {
            line,
            byte_offset: None,
        }
    }
}

/// Counters maintained while reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Physical lines read, including skipped ones and the header
    pub lines_read: u64,
    /// Lines dropped under `DecodePolicy::Skip`
    pub decode_errors: u64,
    /// Lines kept with replacement characters
    pub decode_replaced: u64,
    /// Bytes consumed from the (decompressed) stream
    pub bytes_read: u64,
}

/// Lazy sequence of records from one input file
pub struct LineSource {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    options: SourceOptions,
    selected: Vec<usize>,
    header: Option<Vec<String>>,
    line: u64,
    offset: u64,
    stats: SourceStats,
    buf: Vec<u8>,
    failed: bool,
}

impl std::fmt::Debug for LineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineSource")
            .field("path", &self.path)
            .field("line", &self.line)
            .field("offset", &self.offset)
            .finish()
    }
}

impl LineSource {
    /// Open an input, read its header if any and position it at `resume`
    pub fn open(
        path: impl AsRef<Path>,
        options: SourceOptions,
        resume: Option<ResumePoint>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| Error::source_io(&path, e))?;
        let metadata = file.metadata().map_err(|e| Error::source_io(&path, e))?;
        if !metadata.is_file() {
            return Err(Error::source_io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let compression = options.compression.resolve(&path);
        let wants_header = options.format != InputFormat::Lines && options.has_header;

        let mut header = None;
        let mut line = 0u64;
        let mut offset = 0u64;

        // Uncompressed input with a known offset: read the header through a
        // borrowed handle, then seek straight to the resume point.
        let seek_to = match (compression, resume) {
            (Compression::None, Some(ResumePoint { line: l, byte_offset: Some(off) })) if l > 0 => {
                Some((l, off))
            }
            _ => None,
        };

        let reader: Box<dyn BufRead + Send> = if let Some((resume_line, resume_offset)) = seek_to {
            if wants_header {
                let mut head = BufReader::new(&file);
                let mut raw = Vec::new();
                head.read_until(b'\n', &mut raw)
                    .map_err(|e| Error::source_io(&path, e))?;
                let text = decode_lossy(&raw, options.encoding);
                header = Some(split_fields(text.trim_end_matches(['\r', '\n']), options.format));
            }
            file.seek(SeekFrom::Start(resume_offset))
                .map_err(|e| Error::source_io(&path, e))?;
            line = resume_line;
            offset = resume_offset;
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file))
        } else {
            let inner: Box<dyn Read + Send> = match compression {
                Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
                _ => Box::new(file),
            };
            Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, inner))
        };

        let mut source = Self {
            path,
            reader,
            selected: Vec::new(),
            header,
            line,
            offset,
            stats: SourceStats {
                lines_read: line,
                bytes_read: offset,
                ..SourceStats::default()
            },
            buf: Vec::with_capacity(1024),
            failed: false,
            options,
        };

        if wants_header && source.header.is_none() {
            if let Some(raw) = source.read_raw_line()? {
                let text = decode_lossy(&raw, source.options.encoding);
                source.header = Some(split_fields(&text, source.options.format));
            }
        }

        source.selected = resolve_fields(
            &source.options.fields,
            source.header.as_deref(),
            source.options.format,
        )?;

        if let Some(resume) = resume {
            if seek_to.is_none() {
                source.skip_to(resume.line)?;
            }
        }

        Ok(source)
    }

    /// Path of the input
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header row of a delimited input
    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    /// Last physical line consumed
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Byte offset just past the last consumed line
    pub fn byte_offset(&self) -> u64 {
        self.offset
    }

    /// Reading counters
    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Produce the next record, skipping undecodable lines under `DecodePolicy::Skip`
    pub fn next_record(&mut self) -> Option<Result<Record>> {
        loop {
            if self.failed {
                return None;
            }

            let start = self.offset;
            let raw = match self.read_raw_line() {
                Ok(Some(raw)) => raw,
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            let text = match self.options.encoding {
                Encoding::Latin1 => raw.iter().map(|&b| b as char).collect(),
                Encoding::Utf8 => match String::from_utf8(raw) {
                    Ok(text) => text,
                    Err(e) => match self.options.on_decode_error {
                        DecodePolicy::Replace => {
                            self.stats.decode_replaced += 1;
                            String::from_utf8_lossy(e.as_bytes()).into_owned()
                        }
                        DecodePolicy::Skip => {
                            self.stats.decode_errors += 1;
                            let err = Error::Decode {
                                line: self.line,
                                message: e.utf8_error().to_string(),
                            };
                            debug!("Skipping line: {}", err);
                            continue;
                        }
                    },
                },
            };

            let scan_text = if self.selected.is_empty() {
                None
            } else {
                let fields = split_fields(&text, self.options.format);
                let picked: Vec<&str> = self
                    .selected
                    .iter()
                    .filter_map(|&i| fields.get(i).map(|s| s.as_str()))
                    .collect();
                Some(picked.join(" "))
            };

            return Some(Ok(Record {
                line_number: self.line,
                byte_offset: start,
                raw_text: text,
                scan_text,
            }));
        }
    }

    /// Read one physical line without its terminator
    fn read_raw_line(&mut self) -> Result<Option<Vec<u8>>> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| Error::source_io(&self.path, e))?;
        if n == 0 {
            return Ok(None);
        }

        self.line += 1;
        self.offset += n as u64;
        self.stats.lines_read += 1;
        self.stats.bytes_read += n as u64;

        let mut end = self.buf.len();
        if end > 0 && self.buf[end - 1] == b'\n' {
            end -= 1;
        }
        if end > 0 && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        Ok(Some(self.buf[..end].to_vec()))
    }

    /// Consume lines until `target` has been read
    fn skip_to(&mut self, target: u64) -> Result<()> {
        while self.line < target {
            if self.read_raw_line()?.is_none() {
                warn!(
                    "Resume line {} is past end of {} ({} lines)",
                    target,
                    self.path.display(),
                    self.line
                );
                break;
            }
        }
        Ok(())
    }
}

impl Iterator for LineSource {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

fn decode_lossy(raw: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Latin1 => raw.iter().map(|&b| b as char).collect(),
        Encoding::Utf8 => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Map field selectors to column indices
fn resolve_fields(
    fields: &[String],
    header: Option<&[String]>,
    format: InputFormat,
) -> Result<Vec<usize>> {
    if fields.is_empty() {
        return Ok(Vec::new());
    }
    if format == InputFormat::Lines {
        return Err(Error::config(
            "`fields` requires a delimited format (tsv or csv)",
        ));
    }

    fields
        .iter()
        .map(|field| {
            if let Ok(index) = field.trim().parse::<usize>() {
                return Ok(index);
            }
            let header = header.ok_or_else(|| {
                Error::config(format!(
                    "field `{}` selected by name but the input has no header row",
                    field
                ))
            })?;
            header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(field.trim()))
                .ok_or_else(|| Error::config(format!("field `{}` not found in header", field)))
        })
        .collect()
}

/// Split one line into fields. CSV honours double quotes on a single line.
pub fn split_fields(line: &str, format: InputFormat) -> Vec<String> {
    let Some(delimiter) = format.delimiter() else {
        return vec![line.to_string()];
    };
    if format != InputFormat::Csv {
        return line.split(delimiter).map(str::to_string).collect();
    }

    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Estimate the number of lines in an uncompressed file from a sample of its head
pub fn estimate_total_records(path: impl AsRef<Path>, sample_lines: usize) -> Result<Option<u64>> {
    let path = path.as_ref();
    if Compression::Auto.resolve(path) == Compression::Gzip {
        return Ok(None);
    }

    let file = File::open(path).map_err(|e| Error::source_io(path, e))?;
    let total_bytes = file.metadata().map_err(|e| Error::source_io(path, e))?.len();
    if total_bytes == 0 {
        return Ok(Some(0));
    }

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut lines = 0u64;
    let mut bytes = 0u64;
    while (lines as usize) < sample_lines {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| Error::source_io(path, e))?;
        if n == 0 {
            return Ok(Some(lines));
        }
        lines += 1;
        bytes += n as u64;
    }

    let avg = (bytes as f64 / lines as f64).max(1.0);
    Ok(Some((total_bytes as f64 / avg).round() as u64))
}
