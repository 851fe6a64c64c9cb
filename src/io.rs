//! Line-oriented and fixed-size reads over a byte stream, plus
//! partial-write-tolerant writes. The worker pipeline never touches a raw
//! `TcpStream` directly, only through this type, so tests can drive it
//! over any `AsyncRead + AsyncWrite` pair, not just real sockets.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Outcome of a single `read_block` call.
pub enum Block {
    /// Orderly EOF: the peer closed its write half.
    Eof,
    /// `n` bytes landed in the caller's buffer; `n < max` is a legal short read.
    Data(usize),
}

pub struct BufferedIo<S> {
    reader: BufReader<S>,
}

impl<S> BufferedIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Reads one `\r\n`-terminated line (terminator included), capped at
    /// `max` bytes. Returns `Ok(None)` on orderly EOF before any byte was
    /// read. A line longer than `max` is returned truncated at `max` bytes
    /// (not an error) so the caller can apply its own "too large" policy.
    pub async fn read_line(&mut self, max: usize) -> std::io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(if line.is_empty() { None } else { Some(line) });
            }
            let newline_at = buf.iter().position(|&b| b == b'\n');
            let scan_end = newline_at.map(|p| p + 1).unwrap_or(buf.len());
            let room = max.saturating_sub(line.len());
            let take = scan_end.min(room);
            line.extend_from_slice(&buf[..take]);
            self.reader.consume(scan_end);
            if newline_at.is_some() || line.len() >= max {
                break;
            }
        }
        Ok(Some(line))
    }

    /// Reads until `out[..max]` is full or the peer reaches EOF, issuing as
    /// many underlying reads as it takes. `n < max` on return means EOF was
    /// hit partway through, not that the peer merely paused: a response
    /// split across several TCP segments still comes back as one `Data(n)`
    /// with `n` the full length read so far.
    pub async fn read_block(&mut self, max: usize, out: &mut [u8]) -> std::io::Result<Block> {
        let cap = max.min(out.len());
        let mut total = 0;
        while total < cap {
            let n = self.reader.read(&mut out[total..cap]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        if total == 0 {
            Ok(Block::Eof)
        } else {
            Ok(Block::Data(total))
        }
    }

    /// Writes every byte or returns an error. Partial writes are retried
    /// internally by `AsyncWriteExt::write_all`; a peer that has closed its
    /// read half surfaces as `Err(BrokenPipe)`, never as a process signal.
    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.reader.get_mut().write_all(buf).await?;
        self.reader.get_mut().flush().await
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }
}
