use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// One line read from a child stream, without its `\n` terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawLine {
    pub(crate) text: String,
    /// False only for a final fragment that ended at EOF without `\n`.
    pub(crate) terminated: bool,
}

/// Splits an async byte stream on `\n`.
pub(crate) struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Returns `Ok(None)` at end of stream.
    pub(crate) async fn next_line(&mut self) -> io::Result<Option<RawLine>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }

        let terminated = self.buf.last() == Some(&b'\n');
        if terminated {
            self.buf.pop();
        }
        Ok(Some(RawLine {
            text: String::from_utf8_lossy(&self.buf).into_owned(),
            terminated,
        }))
    }
}
