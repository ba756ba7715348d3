use std::{collections::HashMap, fmt, io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};

use crate::{
    indicator::Indicator,
    lines::LineReader,
    logparse::{apply_processor, LineProcessor},
    writer::{AnnotatedWriter, PrefixFn},
};

#[derive(Debug, Clone)]
struct BufferedLine {
    prefix: String,
    text: String,
    partial: bool,
}

/// Holds child output in memory, grouped by stream, for replay after the child exits.
///
/// Each line keeps the prefix computed when it was received, so replayed lines carry their
/// original timestamps rather than the flush time.
pub struct LineBuffer {
    prefix: PrefixFn,
    processor: Option<Arc<dyn LineProcessor>>,
    streams: Mutex<HashMap<Indicator, Vec<BufferedLine>>>,
}

impl fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBuffer")
            .field("processor", &self.processor.is_some())
            .finish_non_exhaustive()
    }
}

impl LineBuffer {
    pub fn new(prefix: PrefixFn) -> Self {
        Self {
            prefix,
            processor: None,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_processor(&mut self, processor: Arc<dyn LineProcessor>) {
        self.processor = Some(processor);
    }

    /// Reads `reader` line by line, storing each line under `indicator`. A final fragment
    /// without a newline is stored as partial.
    pub async fn write_lines<R>(&self, reader: R, indicator: Indicator) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = LineReader::new(reader);
        while let Some(raw) = lines.next_line().await? {
            let (prefix, text) = apply_processor(self.processor.as_deref(), raw.text);
            let prefix = prefix.unwrap_or_else(|| (self.prefix)());

            self.streams
                .lock()
                .await
                .entry(indicator)
                .or_default()
                .push(BufferedLine {
                    prefix,
                    text,
                    partial: !raw.terminated,
                });
        }
        Ok(())
    }

    /// Number of lines held for `indicator`.
    pub async fn line_count(&self, indicator: Indicator) -> usize {
        self.streams
            .lock()
            .await
            .get(&indicator)
            .map_or(0, Vec::len)
    }

    /// Replays buffered lines to `writer`: stdout first, then stderr, each non-empty stream
    /// preceded by a `--- stdout ---` / `--- stderr ---` header.
    pub async fn flush<W>(&self, writer: &AnnotatedWriter<W>) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let streams = self.streams.lock().await;

        for (indicator, header) in [
            (Indicator::Out, "--- stdout ---"),
            (Indicator::Err, "--- stderr ---"),
        ] {
            let Some(lines) = streams.get(&indicator).filter(|lines| !lines.is_empty()) else {
                continue;
            };

            writer.write_line(Indicator::Info, header).await?;
            for line in lines {
                if line.partial {
                    writer
                        .write_partial_line_with_prefix(&line.prefix, indicator, &line.text)
                        .await?;
                } else {
                    writer
                        .write_line_with_prefix(&line.prefix, indicator, &line.text)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
