use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{ready, Context, Poll},
};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
};
use tracing::debug;

use crate::{
    indicator::{render_line, Indicator},
    runner::TOOL_NAME,
    writer::PrefixFn,
    CaptureError,
};

#[derive(Debug)]
struct CaptureFile {
    path: PathBuf,
    file: File,
}

impl CaptureFile {
    async fn create(dir: &Path, pid: u32, stream: &'static str) -> Result<Self, CaptureError> {
        let path = dir.join(format!("{TOOL_NAME}-{pid}-{stream}"));
        let file = File::create(&path)
            .await
            .map_err(|source| CaptureError::Create {
                stream,
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    async fn tee<R>(&self, reader: R) -> Result<CaptureTee<R>, CaptureError> {
        let copy = self
            .file
            .try_clone()
            .await
            .map_err(|source| CaptureError::Duplicate {
                path: self.path.clone(),
                source,
            })?;
        Ok(CaptureTee {
            inner: reader,
            copy,
            pending: Vec::new(),
            eof: false,
        })
    }

    async fn close(mut self) -> Result<(), CaptureError> {
        let result = match self.file.flush().await {
            Ok(()) => self.file.sync_all().await,
            Err(err) => Err(err),
        };
        result.map_err(|source| CaptureError::Close {
            path: self.path,
            source,
        })
    }
}

/// On-disk capture of a single run: raw stdout, raw stderr, and an annotated lifecycle log.
///
/// The stdout/stderr files are byte-for-byte copies of the child's streams, independent of any
/// annotation or log parsing applied to the terminal view.
pub struct Capture {
    stdout: CaptureFile,
    stderr: CaptureFile,
    lifecycle: CaptureFile,
    prefix: PrefixFn,
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("stdout", &self.stdout.path)
            .field("stderr", &self.stderr.path)
            .field("lifecycle", &self.lifecycle.path)
            .finish_non_exhaustive()
    }
}

impl Capture {
    /// Creates `cg-<pid>-{stdout,stderr,lifecycle}` in the system temporary directory.
    pub async fn new(pid: u32, prefix: PrefixFn) -> Result<Self, CaptureError> {
        Self::create_in(&std::env::temp_dir(), pid, prefix).await
    }

    /// Creates the capture files in `dir`. Files opened before a failure are closed again.
    pub async fn create_in(dir: &Path, pid: u32, prefix: PrefixFn) -> Result<Self, CaptureError> {
        let stdout = CaptureFile::create(dir, pid, "stdout").await?;
        let stderr = CaptureFile::create(dir, pid, "stderr").await?;
        let lifecycle = CaptureFile::create(dir, pid, "lifecycle").await?;
        debug!(dir = %dir.display(), pid, "created capture files");

        Ok(Self {
            stdout,
            stderr,
            lifecycle,
            prefix,
        })
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout.path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr.path
    }

    pub fn lifecycle_path(&self) -> &Path {
        &self.lifecycle.path
    }

    /// Appends one annotated `Info` line to the lifecycle file.
    pub async fn write_lifecycle(&mut self, msg: &str) -> Result<(), CaptureError> {
        let line = render_line(&(self.prefix)(), Indicator::Info, msg, true);
        let file = &mut self.lifecycle.file;
        file.write_all(line.as_bytes())
            .await
            .map_err(CaptureError::Lifecycle)?;
        file.flush().await.map_err(CaptureError::Lifecycle)
    }

    /// Wraps the child's stdout so every byte read is also copied to the raw stdout file.
    pub async fn tee_stdout<R>(&self, reader: R) -> Result<CaptureTee<R>, CaptureError> {
        self.stdout.tee(reader).await
    }

    /// Wraps the child's stderr so every byte read is also copied to the raw stderr file.
    pub async fn tee_stderr<R>(&self, reader: R) -> Result<CaptureTee<R>, CaptureError> {
        self.stderr.tee(reader).await
    }

    /// Flushes and closes all three files, returning the first error. Every file is closed
    /// even if an earlier one fails.
    pub async fn close(self) -> Result<(), CaptureError> {
        let stdout = self.stdout.close().await;
        let stderr = self.stderr.close().await;
        let lifecycle = self.lifecycle.close().await;
        stdout.and(stderr).and(lifecycle)
    }
}

/// Reader adapter that copies everything it reads into a raw capture file.
///
/// Bytes handed to the caller are written to the file before the next read from the inner
/// reader, and the file is flushed before end of stream is reported.
#[derive(Debug)]
pub struct CaptureTee<R> {
    inner: R,
    copy: File,
    pending: Vec<u8>,
    eof: bool,
}

impl<R> CaptureTee<R> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.copy).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CaptureTee<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            ready!(this.poll_drain(cx))?;
            if this.eof {
                ready!(Pin::new(&mut this.copy).poll_flush(cx))?;
                return Poll::Ready(Ok(()));
            }

            let before = buf.filled().len();
            ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
            let fresh = &buf.filled()[before..];
            if fresh.is_empty() {
                this.eof = true;
                continue;
            }
            this.pending.extend_from_slice(fresh);
            return Poll::Ready(Ok(()));
        }
    }
}
