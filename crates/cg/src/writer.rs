use std::{fmt, io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    indicator::{render_line, Indicator},
    lines::LineReader,
    logparse::{apply_processor, LineProcessor},
};

/// Produces the prefix placed before each annotated line, usually a formatted timestamp.
pub type PrefixFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Writes annotated lines to an output sink.
///
/// Every write holds the same lock for the full line, so concurrent callers (one per child
/// stream) can never interleave within a single emitted line.
pub struct AnnotatedWriter<W> {
    dest: Mutex<W>,
    prefix: PrefixFn,
    processor: Option<Arc<dyn LineProcessor>>,
}

impl<W> fmt::Debug for AnnotatedWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotatedWriter")
            .field("processor", &self.processor.is_some())
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin + Send> AnnotatedWriter<W> {
    pub fn new(dest: W, prefix: PrefixFn) -> Self {
        Self {
            dest: Mutex::new(dest),
            prefix,
            processor: None,
        }
    }

    /// Installs a processor applied to every line read by [`AnnotatedWriter::write_lines`].
    pub fn set_processor(&mut self, processor: Arc<dyn LineProcessor>) {
        self.processor = Some(processor);
    }

    pub fn processor(&self) -> Option<Arc<dyn LineProcessor>> {
        self.processor.clone()
    }

    /// Writes `line` followed by a newline, prefixed with a freshly computed prefix.
    pub async fn write_line(&self, indicator: Indicator, line: &str) -> io::Result<()> {
        self.emit(None, indicator, line, true).await
    }

    /// Like [`AnnotatedWriter::write_line`] but without the trailing newline. Used for the final
    /// fragment of a stream that did not end with one.
    pub async fn write_partial_line(&self, indicator: Indicator, line: &str) -> io::Result<()> {
        self.emit(None, indicator, line, false).await
    }

    /// Writes a line with an explicit prefix, e.g. one captured when a buffered line arrived.
    pub async fn write_line_with_prefix(
        &self,
        prefix: &str,
        indicator: Indicator,
        line: &str,
    ) -> io::Result<()> {
        self.emit(Some(prefix), indicator, line, true).await
    }

    pub async fn write_partial_line_with_prefix(
        &self,
        prefix: &str,
        indicator: Indicator,
        line: &str,
    ) -> io::Result<()> {
        self.emit(Some(prefix), indicator, line, false).await
    }

    /// Reads `reader` line by line and writes each line annotated with `indicator`.
    ///
    /// A final fragment without a newline is written without one. The first sink error aborts
    /// the loop; bytes not yet read stay in `reader`.
    pub async fn write_lines<R>(&self, reader: R, indicator: Indicator) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = LineReader::new(reader);
        while let Some(raw) = lines.next_line().await? {
            let (prefix, display) = apply_processor(self.processor.as_deref(), raw.text);
            self.emit(prefix.as_deref(), indicator, &display, raw.terminated)
                .await?;
        }
        Ok(())
    }

    /// Consumes the writer and returns the underlying sink.
    pub fn into_inner(self) -> W {
        self.dest.into_inner()
    }

    async fn emit(
        &self,
        prefix: Option<&str>,
        indicator: Indicator,
        line: &str,
        terminated: bool,
    ) -> io::Result<()> {
        let mut dest = self.dest.lock().await;
        let rendered = match prefix {
            Some(prefix) => render_line(prefix, indicator, line, terminated),
            None => render_line(&(self.prefix)(), indicator, line, terminated),
        };
        dest.write_all(rendered.as_bytes()).await?;
        dest.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        sync::atomic::{AtomicUsize, Ordering},
        task::{Context, Poll},
    };

    use super::*;
    use crate::logparse::ProcessedLine;

    fn fixed(prefix: &'static str) -> PrefixFn {
        Arc::new(move || prefix.to_string())
    }

    #[tokio::test]
    async fn writes_complete_and_partial_lines() {
        let writer = AnnotatedWriter::new(Vec::new(), fixed("T "));
        writer.write_line(Indicator::Info, "hello").await.unwrap();
        writer.write_partial_line(Indicator::Err, "tail").await.unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, "T I: hello\nT E: tail");
    }

    #[tokio::test]
    async fn explicit_prefix_replaces_computed_prefix() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let prefix: PrefixFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "NOW ".to_string()
        });

        let writer = AnnotatedWriter::new(Vec::new(), prefix);
        writer
            .write_line_with_prefix("THEN ", Indicator::Out, "a")
            .await
            .unwrap();
        writer
            .write_partial_line_with_prefix("THEN ", Indicator::Out, "b")
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, "THEN O: a\nTHEN O: b");
    }

    #[tokio::test]
    async fn write_lines_preserves_order_and_trailing_fragment() {
        let writer = AnnotatedWriter::new(Vec::new(), fixed(""));
        writer
            .write_lines(&b"first\nsecond\n\nlast"[..], Indicator::Out)
            .await
            .unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, "O: first\nO: second\nO: \nO: last");
    }

    #[tokio::test]
    async fn write_lines_uses_processor_prefix_when_supplied() {
        struct Upper;
        impl LineProcessor for Upper {
            fn process(&self, line: &str) -> Option<ProcessedLine> {
                line.strip_prefix("ts:").map(|rest| ProcessedLine {
                    prefix: Some("12:00 ".to_string()),
                    text: rest.to_uppercase(),
                })
            }
        }

        let mut writer = AnnotatedWriter::new(Vec::new(), fixed("T "));
        writer.set_processor(Arc::new(Upper));
        writer
            .write_lines(&b"ts:abc\nplain\n"[..], Indicator::Err)
            .await
            .unwrap();

        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out, "12:00 E: ABC\nT E: plain\n");
    }

    #[tokio::test]
    async fn concurrent_writers_never_split_a_line() {
        let writer = Arc::new(AnnotatedWriter::new(Vec::new(), fixed("P ")));
        let out_text = "o".repeat(200);
        let err_text = "e".repeat(200);

        let mut stdout_input = Vec::new();
        let mut stderr_input = Vec::new();
        for _ in 0..100 {
            stdout_input.extend_from_slice(out_text.as_bytes());
            stdout_input.push(b'\n');
            stderr_input.extend_from_slice(err_text.as_bytes());
            stderr_input.push(b'\n');
        }

        let w1 = Arc::clone(&writer);
        let w2 = Arc::clone(&writer);
        let a = tokio::spawn(async move {
            w1.write_lines(&stdout_input[..], Indicator::Out).await
        });
        let b = tokio::spawn(async move {
            w2.write_lines(&stderr_input[..], Indicator::Err).await
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let writer = Arc::try_unwrap(writer).expect("sole owner");
        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 200);
        for line in lines {
            assert!(
                line == format!("P O: {out_text}") || line == format!("P E: {err_text}"),
                "interleaved line: {line}"
            );
        }
    }

    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn sink_error_aborts_write_lines() {
        let writer = AnnotatedWriter::new(FailingSink, fixed(""));
        let err = writer
            .write_lines(&b"a\nb\n"[..], Indicator::Out)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
