//! Query input: a datafile of `name [type]` lines shared by every sender.
//!
//! The whole file is parsed into memory at startup, so `next()` is a cursor
//! bump under a mutex and repeated passes are a reset, not a re-read. Blank
//! lines and `#`/`;` comments are skipped; a file with no usable entries is
//! a fatal configuration error.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Mutex;

use crate::error::Error;
use crate::wire;

/// One parsed line of the datafile.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub name: String,
    pub qtype: u16,
    /// The textual form, `"name TYPE"`, carried into verbose output.
    pub text: String,
}

#[derive(Debug)]
struct Cursor {
    index: usize,
    passes_done: u64,
    exhausted: bool,
}

/// Thread-safe iterator over the datafile with a bounded pass count.
#[derive(Debug)]
pub struct InputSource {
    entries: Vec<QueryDescriptor>,
    cursor: Mutex<Cursor>,
    /// 0 = unlimited.
    max_passes: u64,
}

impl InputSource {
    /// Load from a path; `-` reads stdin.
    pub fn load(path: &str, max_passes: u64) -> Result<Self, Error> {
        if path == "-" {
            let stdin = io::stdin();
            Self::from_reader(stdin.lock(), max_passes)
        } else {
            let file = File::open(path)
                .map_err(|e| Error::InvalidInput(format!("cannot open '{path}': {e}")))?;
            Self::from_reader(BufReader::new(file), max_passes)
        }
    }

    pub fn from_reader(reader: impl BufRead, max_passes: u64) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(Error::Io)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            entries.push(parse_line(line, lineno + 1)?);
        }
        if entries.is_empty() {
            return Err(Error::InvalidInput("datafile contains no queries".to_string()));
        }
        Ok(Self {
            entries,
            cursor: Mutex::new(Cursor { index: 0, passes_done: 0, exhausted: false }),
            max_passes,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The next descriptor, or `None` once every pass is spent. Safe to call
    /// from any number of sender threads.
    pub fn next(&self) -> Option<QueryDescriptor> {
        let mut cur = self.cursor.lock().unwrap();
        if cur.exhausted {
            return None;
        }
        if cur.index == self.entries.len() {
            cur.passes_done += 1;
            if self.max_passes != 0 && cur.passes_done >= self.max_passes {
                cur.exhausted = true;
                return None;
            }
            cur.index = 0;
        }
        let entry = self.entries[cur.index].clone();
        cur.index += 1;
        Some(entry)
    }
}

fn parse_line(line: &str, lineno: usize) -> Result<QueryDescriptor, Error> {
    let mut fields = line.split_whitespace();
    let name = fields
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("line {lineno}: empty query")))?;
    let type_text = fields.next().unwrap_or("A");
    if fields.next().is_some() {
        return Err(Error::InvalidInput(format!(
            "line {lineno}: expected 'name [type]', got '{line}'"
        )));
    }
    let qtype = wire::qtype_value(type_text)
        .map_err(|e| Error::InvalidInput(format!("line {lineno}: {e}")))?;
    wire::validate_name(name).map_err(|e| Error::InvalidInput(format!("line {lineno}: {e}")))?;
    Ok(QueryDescriptor {
        name: name.to_string(),
        qtype,
        text: format!("{name} {type_text}"),
    })
}
