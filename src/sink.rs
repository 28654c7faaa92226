//! Readers that normalize subject outputs into line sequences.
//!
//! Every sink kind (plain file, external decoder tool, SQLite table) is
//! exposed through [`SinkReader`], a lazy, finite and non-restartable
//! sequence of lines without terminators.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::File;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, warn};

use crate::verifier::Discrepancy;

/// A source of delivered lines
#[async_trait]
pub trait SinkReader: Send {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Returns the next line, or `None` once the sink is exhausted
    async fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// Splits on `\n` without requiring valid UTF-8
fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec())
}

/// Decodes one raw line; undecodable bytes become U+FFFD so the scan policy decides
fn lines_item(item: Option<Result<Bytes, AnyDelimiterCodecError>>) -> io::Result<Option<String>> {
    match item {
        None => Ok(None),
        Some(Ok(raw)) => {
            let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
            Ok(Some(String::from_utf8_lossy(raw).into_owned()))
        }
        Some(Err(AnyDelimiterCodecError::Io(e))) => Err(e),
        Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    }
}

/// Plain line oriented log file
pub struct FileSink {
    name: String,
    lines: FramedRead<File, AnyDelimiterCodec>,
}

impl FileSink {
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path).await?;
        Ok(Self {
            name: path.display().to_string(),
            lines: FramedRead::new(file, line_codec()),
        })
    }
}

#[async_trait]
impl SinkReader for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        lines_item(self.lines.next().await)
    }
}

/// Standard output of an external tool, e.g. a log store decoder
///
/// A tool exiting with a non-zero status fails the read at end of output.
/// Relative paths in its arguments resolve against `working_dir` when given.
pub struct CommandSink {
    name: String,
    child: Option<Child>,
    lines: FramedRead<ChildStdout, AnyDelimiterCodec>,
}

impl CommandSink {
    pub fn spawn(program: &str, args: &[String], working_dir: Option<&Path>) -> io::Result<Self> {
        let mut command = Command::new(program);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdout not captured"))?;
        Ok(Self {
            name: format!("{} {}", program, args.join(" ")).trim_end().to_string(),
            child: Some(child),
            lines: FramedRead::new(stdout, line_codec()),
        })
    }
}

#[async_trait]
impl SinkReader for CommandSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let line = lines_item(self.lines.next().await)?;
        if line.is_none() {
            if let Some(mut child) = self.child.take() {
                let status = child.wait().await?;
                if !status.success() {
                    return Err(io::Error::other(format!("'{}' exited with {}", self.name, status)));
                }
                debug!("'{}' finished", self.name);
            }
        }
        Ok(line)
    }
}

/// Lines that are already in memory
pub struct BufferedSink {
    name: String,
    lines: VecDeque<String>,
}

impl BufferedSink {
    pub fn new(name: impl Into<String>, lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            lines: lines.into_iter().collect(),
        }
    }
}

#[async_trait]
impl SinkReader for BufferedSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.lines.pop_front())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
    }
}

/// Reads every row of `table` ordered by `order_by`, columns joined by a space
///
/// Runs on the blocking pool; rows are materialized before scanning starts.
/// An `order_by` naming no column of the table is rejected before querying.
pub async fn read_sqlite_rows(database: PathBuf, table: String, order_by: String) -> io::Result<BufferedSink> {
    tokio::task::spawn_blocking(move || {
        let to_io = |e: rusqlite::Error| io::Error::other(e);
        let conn = Connection::open_with_flags(&database, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(to_io)?;

        let columns_sql = format!("SELECT * FROM {} LIMIT 0", quote_identifier(&table));
        let known = conn.prepare(&columns_sql).map_err(to_io)?.column_names().iter().any(|c| *c == order_by);
        if !known {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no column '{}' in table '{}'", order_by, table),
            ));
        }

        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_identifier(&table),
            quote_identifier(&order_by)
        );
        let mut stmt = conn.prepare(&sql).map_err(to_io)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([]).map_err(to_io)?;

        let mut lines = Vec::new();
        while let Some(row) = rows.next().map_err(to_io)? {
            let mut fields = Vec::with_capacity(columns);
            for i in 0..columns {
                fields.push(value_text(row.get_ref(i).map_err(to_io)?));
            }
            lines.push(fields.join(" "));
        }
        Ok(BufferedSink::new(format!("{}:{}", database.display(), table), lines))
    })
    .await
    .map_err(io::Error::other)?
}

/// Which sink to read and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkDescriptor {
    /// Line oriented file
    File(PathBuf),
    /// Output of an external tool, run from `working_dir` when set
    Command {
        program: String,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    },
    /// Rows of a SQLite table
    Sqlite {
        database: PathBuf,
        table: String,
        order_by: String,
    },
}

impl SinkDescriptor {
    pub fn sqlite(database: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        SinkDescriptor::Sqlite {
            database: database.into(),
            table: table.into(),
            order_by: "msg".to_string(),
        }
    }

    /// Opens the sink; failures become a `SinkUnreadable` discrepancy
    pub async fn open(&self) -> Result<Box<dyn SinkReader>, Discrepancy> {
        let unreadable = |e: io::Error| {
            warn!("Error opening sink {}: {}", self, e);
            Discrepancy::SinkUnreadable {
                sink: self.to_string(),
                reason: e.to_string(),
            }
        };

        match self {
            SinkDescriptor::File(path) => {
                let sink = FileSink::open(path).await.map_err(unreadable)?;
                Ok(Box::new(sink))
            }
            SinkDescriptor::Command {
                program,
                args,
                working_dir,
            } => {
                let sink = CommandSink::spawn(program, args, working_dir.as_deref()).map_err(unreadable)?;
                Ok(Box::new(sink))
            }
            SinkDescriptor::Sqlite {
                database,
                table,
                order_by,
            } => {
                let sink = read_sqlite_rows(database.clone(), table.clone(), order_by.clone())
                    .await
                    .map_err(unreadable)?;
                Ok(Box::new(sink))
            }
        }
    }
}

impl fmt::Display for SinkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkDescriptor::File(path) => write!(f, "file({})", path.display()),
            SinkDescriptor::Command { program, args, .. } => {
                write!(f, "command({}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                write!(f, ")")
            }
            SinkDescriptor::Sqlite { database, table, .. } => {
                write!(f, "sqlite({}:{})", database.display(), table)
            }
        }
    }
}
