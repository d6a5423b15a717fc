use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

const DEFAULT_LIMIT_BYTES: u32 = 64 * 1024;
const MAX_LIMIT_BYTES: u32 = 1024 * 1024;
const DEFAULT_MAX_LINES: u32 = 200;
const MAX_MAX_LINES: u32 = 2000;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("log file not found")]
    NotFound,
    #[error("failed to read log file: {0}")]
    Io(#[from] std::io::Error),
}

fn clamp_u32(v: u32, max: u32, default: u32) -> u32 {
    if v == 0 {
        return default;
    }
    v.min(max)
}

fn parse_cursor(cursor: &str) -> Result<u64, TailError> {
    let c = cursor.trim();
    if c.is_empty() {
        return Ok(0);
    }
    c.parse::<u64>()
        .map_err(|_| TailError::InvalidCursor(c.to_string()))
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

async fn file_size(path: &Path) -> Result<u64, TailError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(TailError::NotFound),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(TailError::NotFound);
    }
    Ok(meta.len())
}

async fn read_window(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, TailError> {
    let mut f = tokio::fs::File::open(path).await?;
    f.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len as usize);
    // The worker may still be appending; read what is there up to the limit.
    (&mut f).take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Reads a window of `path`.
///
/// A zero or empty cursor tails the last `limit_bytes`; otherwise reading
/// continues forward from that byte offset. A cursor past the end (the file
/// was truncated by a restart) resets to the tail.
pub async fn tail_file(
    path: &Path,
    cursor: &str,
    limit_bytes: u32,
    max_lines: u32,
) -> Result<LogTail, TailError> {
    let size = file_size(path).await?;
    let limit_bytes = clamp_u32(limit_bytes, MAX_LIMIT_BYTES, DEFAULT_LIMIT_BYTES) as u64;
    let max_lines = clamp_u32(max_lines, MAX_MAX_LINES, DEFAULT_MAX_LINES) as usize;

    let mut cursor = parse_cursor(cursor)?;
    if cursor == 0 || cursor > size {
        cursor = size.saturating_sub(limit_bytes);
    }
    let buf = read_window(path, cursor, limit_bytes.min(size - cursor)).await?;

    Ok(LogTail {
        lines: split_lines_from_tail(&buf, max_lines),
        next_cursor: (cursor + buf.len() as u64).to_string(),
    })
}

/// The last `limit_bytes` of `path` as text (zero means the maximum). When
/// the window starts mid-file the partial first line is dropped.
pub async fn tail_text(path: &Path, limit_bytes: u32) -> Result<String, TailError> {
    let size = file_size(path).await?;
    let limit_bytes = clamp_u32(limit_bytes, MAX_LIMIT_BYTES, MAX_LIMIT_BYTES) as u64;
    let start = size.saturating_sub(limit_bytes);
    let buf = read_window(path, start, size - start).await?;

    let body = if start > 0 {
        match buf.iter().position(|b| *b == b'\n') {
            Some(nl) => &buf[nl + 1..],
            None => &buf[..],
        }
    } else {
        &buf[..]
    };
    Ok(String::from_utf8_lossy(body).into_owned())
}
