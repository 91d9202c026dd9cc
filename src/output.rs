//! Output collection and stream plumbing shared by both backends
//!
//! Pipes handed out by the command handles are in-memory bounded pipes pumped
//! by the backend, so local and SSH commands expose identical stream types.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::error::ExecError;

/// Read end of a command output stream
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Write end of a command input stream, or a caller-supplied output sink
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffer size of the in-memory pipes handed out by the pipe accessors
pub(crate) const PIPE_CAPACITY: usize = 64 * 1024;

/// Where one of a command's output streams goes once started
pub(crate) enum Attachment {
    /// Write end of an in-memory pipe whose read end the caller holds
    Pipe(DuplexStream),
    /// Caller-provided sink
    Sink(WriteStream),
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attachment::Pipe(_) => f.write_str("Pipe"),
            Attachment::Sink(_) => f.write_str("Sink"),
        }
    }
}

impl Attachment {
    pub(crate) fn into_writer(self) -> WriteStream {
        match self {
            Attachment::Pipe(writer) => Box::new(writer),
            Attachment::Sink(writer) => writer,
        }
    }
}

/// Pre-start configuration for one output stream (stdout or stderr).
///
/// A pipe and a sink on the same stream are mutually exclusive; the conflict
/// surfaces when the backend collects the attachment at start.
#[derive(Default)]
pub(crate) struct OutputTarget {
    pipe: Option<DuplexStream>,
    sink: Option<WriteStream>,
}

impl OutputTarget {
    /// Create the in-memory pipe for this stream and return its read end.
    /// The write end stays here until the backend takes it at start.
    pub(crate) fn request_pipe(&mut self, stream: &'static str) -> Result<ReadStream, ExecError> {
        if self.pipe.is_some() {
            return Err(ExecError::StreamFailure(format!(
                "{stream} pipe already requested"
            )));
        }
        let (read, write) = tokio::io::duplex(PIPE_CAPACITY);
        self.pipe = Some(write);
        Ok(Box::new(read))
    }

    /// Attach a sink, replacing any earlier one
    pub(crate) fn set_sink(&mut self, sink: WriteStream) {
        self.sink = Some(sink);
    }

    /// Hand the configured attachment to the backend; called once at start
    pub(crate) fn take_attachment(
        &mut self,
        stream: &'static str,
    ) -> Result<Option<Attachment>, ExecError> {
        match (self.pipe.take(), self.sink.take()) {
            (Some(_), Some(_)) => Err(ExecError::StreamFailure(format!(
                "both a pipe and a sink are attached to {stream}"
            ))),
            (Some(writer), None) => Ok(Some(Attachment::Pipe(writer))),
            (None, Some(writer)) => Ok(Some(Attachment::Sink(writer))),
            (None, None) => Ok(None),
        }
    }
}

/// Copy a backend stream into an attachment writer until end-of-stream.
///
/// Dropping the writer on return is what signals end-of-stream to a pipe's
/// read end, so this consumes the writer.
pub(crate) async fn pump<R, W>(mut from: R, mut to: W) -> Result<(), ExecError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(&mut from, &mut to)
        .await
        .map_err(|e| ExecError::StreamFailure(e.to_string()))?;
    to.flush()
        .await
        .map_err(|e| ExecError::StreamFailure(e.to_string()))?;
    Ok(())
}

/// Drain both output streams concurrently until each reports end-of-stream,
/// accumulating stdout as lines and discarding stderr.
///
/// Both streams are serviced at the same time: a command filling one stream
/// past the pipe capacity can never stall because the other is not being read.
pub(crate) async fn drain_to_lines(
    stdout: ReadStream,
    stderr: ReadStream,
) -> Result<Vec<String>, ExecError> {
    let stdout_task = tokio::spawn(read_lines(stdout));
    let stderr_task = tokio::spawn(discard(stderr));

    let (stdout_res, stderr_res) = tokio::join!(stdout_task, stderr_task);
    let lines = flatten_join(stdout_res)?;
    flatten_join(stderr_res)?;
    Ok(lines)
}

fn flatten_join<T>(
    res: Result<Result<T, ExecError>, tokio::task::JoinError>,
) -> Result<T, ExecError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(ExecError::StreamFailure(format!("drain task failed: {e}"))),
    }
}

async fn read_lines(mut stream: ReadStream) -> Result<Vec<String>, ExecError> {
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ExecError::StreamFailure(e.to_string()))?;
    Ok(split_lines(&buf))
}

async fn discard(mut stream: ReadStream) -> Result<(), ExecError> {
    tokio::io::copy(&mut stream, &mut tokio::io::sink())
        .await
        .map_err(|e| ExecError::StreamFailure(e.to_string()))?;
    Ok(())
}

/// Split captured bytes into lines.
///
/// Invalid UTF-8 is replaced, a trailing newline does not produce an empty
/// final line, a final unterminated line is kept, and `\r\n` endings are
/// normalized.
pub(crate) fn split_lines(buf: &[u8]) -> Vec<String> {
    if buf.is_empty() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(buf);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    if text.ends_with('\n') {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn test_split_lines_trailing_newline() {
        assert_eq!(split_lines(b"one\ntwo\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_split_lines_partial_last_line() {
        assert_eq!(split_lines(b"one\ntwo"), vec!["one", "two"]);
    }

    #[test]
    fn test_split_lines_empty_and_blank() {
        assert_eq!(split_lines(b""), Vec::<String>::new());
        assert_eq!(split_lines(b"\n"), vec![""]);
    }

    #[test]
    fn test_split_lines_crlf() {
        assert_eq!(split_lines(b"one\r\ntwo\r\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_split_lines_invalid_utf8_replaced() {
        let lines = split_lines(b"ok\n\xff\xfe\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "ok");
    }

    #[tokio::test]
    async fn test_drain_accumulates_stdout_discards_stderr() {
        let (out_read, mut out_write) = tokio::io::duplex(64);
        let (err_read, mut err_write) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            out_write.write_all(b"a\nb\nc").await.unwrap();
            err_write.write_all(b"noise\n").await.unwrap();
        });

        let lines = drain_to_lines(Box::new(out_read), Box::new(err_read))
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_drain_services_both_streams_past_capacity() {
        let (out_read, mut out_write) = tokio::io::duplex(128);
        let (err_read, mut err_write) = tokio::io::duplex(128);

        // Interleave writes well past each pipe's capacity; the drain must
        // keep both moving.
        let writer = tokio::spawn(async move {
            for i in 0..1_000 {
                out_write
                    .write_all(format!("out{i}\n").as_bytes())
                    .await
                    .unwrap();
                err_write
                    .write_all(format!("err{i}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        let lines = drain_to_lines(Box::new(out_read), Box::new(err_read))
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(lines.len(), 1_000);
        assert_eq!(lines[0], "out0");
        assert_eq!(lines[999], "out999");
    }

    #[tokio::test]
    async fn test_pipe_and_sink_conflict() {
        let mut target = OutputTarget::default();
        let _read = target.request_pipe("stdout").unwrap();
        target.set_sink(Box::new(tokio::io::sink()));

        let err = target.take_attachment("stdout").unwrap_err();
        assert!(matches!(err, ExecError::StreamFailure(_)));
    }

    #[test]
    fn test_second_pipe_request_rejected() {
        let mut target = OutputTarget::default();
        let _first = target.request_pipe("stdout").unwrap();
        assert!(target.request_pipe("stdout").is_err());
    }
}
