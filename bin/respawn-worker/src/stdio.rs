//! Job protocol over standard input and output.
//!
//! Each job arrives as one JSON object per line:
//!
//! ```json
//! {"id": "42", "mode": "queue", "payload": {"kind": "activity", "type": "Echo", "input": "hi"}}
//! ```
//!
//! and each result is written back as one JSON object per line, in completion order:
//!
//! ```json
//! {"id": "42", "status": "ok", "result": "hi"}
//! {"id": "43", "status": "error", "error_kind": "validation", "message": "bad card"}
//! ```

use async_trait::async_trait;
use respawn_core::job::{Job, JobId, JobSource};
use respawn_error::{ErrorContext as _, GenericError, JobError};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader, Lines, Stdin, Stdout};

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Status<'a> {
    Ok { result: &'a Value },
    Error { error_kind: &'a str, message: String },
}

#[derive(Serialize)]
struct Response<'a> {
    id: &'a JobId,
    #[serde(flatten)]
    status: Status<'a>,
}

impl<'a> Response<'a> {
    fn new(id: &'a JobId, result: &'a Result<Value, JobError>) -> Self {
        let status = match result {
            Ok(result) => Status::Ok { result },
            Err(e) => Status::Error {
                error_kind: e.kind().as_str(),
                message: e.source_error().to_string(),
            },
        };
        Self { id, status }
    }
}

/// A job source reading jobs from, and writing results to, a pair of line-oriented streams.
///
/// A line that is not a valid job is a transport fault: the peer is not speaking the protocol, so no result could be
/// routed back to it.
pub struct StdioJobSource<R, W> {
    lines: Lines<R>,
    writer: W,
}

impl StdioJobSource<BufReader<Stdin>, Stdout> {
    /// Creates a new `StdioJobSource` over the process's standard input and output.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> StdioJobSource<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a new `StdioJobSource` over the given streams.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            lines: reader.lines(),
            writer,
        }
    }

    #[cfg(test)]
    fn into_writer(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<R, W> JobSource for StdioJobSource<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_job(&mut self) -> Result<Option<Job>, GenericError> {
        // `next_line` is cancel safe, so a partially read line survives being interrupted.
        while let Some(line) = self
            .lines
            .next_line()
            .await
            .error_context("Failed to read from job input.")?
        {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let job = serde_json::from_str(line).with_error_context(|| format!("Malformed job line: {}", line))?;
            return Ok(Some(job));
        }

        Ok(None)
    }

    async fn respond(&mut self, id: &JobId, result: &Result<Value, JobError>) -> Result<(), GenericError> {
        let mut encoded =
            serde_json::to_vec(&Response::new(id, result)).error_context("Failed to encode job response.")?;
        encoded.push(b'\n');

        self.writer
            .write_all(&encoded)
            .await
            .error_context("Failed to write job response.")?;
        self.writer
            .flush()
            .await
            .error_context("Failed to flush job response.")?;
        Ok(())
    }
}
