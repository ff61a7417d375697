//! Message framing over size-limited data channels.
//!
//! Frame format:
//! ```text
//! ┌────────────────┬──────────┬──────────┬───────┬───────────┐
//! │ correlation_id │ index    │ total    │ flags │ chunk     │
//! │ u64 BE         │ u32 BE   │ u32 BE   │ u8    │ variable  │
//! └────────────────┴──────────┴──────────┴───────┴───────────┘
//! ```
//!
//! One encoded message is split into `total` frames sharing a correlation id.
//! Messages above the compression threshold are LZ4-compressed (size
//! prepended) before splitting; `flags` bit 0 marks that.

use std::collections::{BTreeMap, HashMap};

/// Fixed frame header size in bytes.
pub const HEADER_LEN: usize = 17;

/// Payload is LZ4-compressed.
pub const FLAG_LZ4: u8 = 0b0000_0001;

/// Frame violations. Any of these closes the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Shorter than the header
    Truncated(usize),
    /// Larger than the channel's message size
    Oversized { size: usize, limit: usize },
    /// Header disagrees with itself or with earlier frames of the message
    Inconsistent(String),
    /// Too many messages or bytes in flight
    ReassemblyFull(String),
    Compression(String),
    /// Frame size leaves no room for payload
    InvalidFrameSize(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "Truncated frame ({len} bytes)"),
            Self::Oversized { size, limit } => {
                write!(f, "Oversized frame ({size} bytes, limit {limit})")
            }
            Self::Inconsistent(e) => write!(f, "Inconsistent frame: {e}"),
            Self::ReassemblyFull(e) => write!(f, "Reassembly buffer full: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
            Self::InvalidFrameSize(size) => write!(f, "Invalid frame size {size}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub correlation_id: u64,
    pub index: u32,
    pub total: u32,
    pub flags: u8,
}

impl FrameHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.correlation_id.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.flags);
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < HEADER_LEN {
            return Err(FrameError::Truncated(frame.len()));
        }
        let mut u64_buf = [0u8; 8];
        u64_buf.copy_from_slice(&frame[0..8]);
        let mut u32_buf = [0u8; 4];
        u32_buf.copy_from_slice(&frame[8..12]);
        let index = u32::from_be_bytes(u32_buf);
        u32_buf.copy_from_slice(&frame[12..16]);
        let total = u32::from_be_bytes(u32_buf);

        Ok(Self {
            correlation_id: u64::from_be_bytes(u64_buf),
            index,
            total,
            flags: frame[16],
        })
    }
}

/// Splits encoded messages into frames.
#[derive(Debug)]
pub struct Fragmenter {
    max_message_size: usize,
    compression_threshold: usize,
    next_correlation: u64,
}

impl Fragmenter {
    pub fn new(max_message_size: usize, compression_threshold: usize) -> Self {
        Self {
            max_message_size,
            compression_threshold,
            next_correlation: 0,
        }
    }

    /// Frame one encoded message.
    pub fn split(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let chunk_size = self
            .max_message_size
            .checked_sub(HEADER_LEN)
            .filter(|n| *n > 0)
            .ok_or(FrameError::InvalidFrameSize(self.max_message_size))?;

        let compressed;
        let (body, flags) = if payload.len() > self.compression_threshold {
            compressed = lz4_flex::compress_prepend_size(payload);
            (compressed.as_slice(), FLAG_LZ4)
        } else {
            (payload, 0)
        };

        let total = body.len().div_ceil(chunk_size).max(1);
        let total = u32::try_from(total)
            .map_err(|_| FrameError::Oversized {
                size: body.len(),
                limit: chunk_size * u32::MAX as usize,
            })?;

        let correlation_id = self.next_correlation;
        self.next_correlation = self.next_correlation.wrapping_add(1);

        let mut frames = Vec::with_capacity(total as usize);
        for index in 0..total {
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(body.len());
            let mut frame = Vec::with_capacity(HEADER_LEN + end - start);
            FrameHeader {
                correlation_id,
                index,
                total,
                flags,
            }
            .write(&mut frame);
            frame.extend_from_slice(&body[start..end]);
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[derive(Debug)]
struct Partial {
    total: u32,
    flags: u8,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
}

/// Rebuilds messages from frames, within fixed memory bounds.
#[derive(Debug)]
pub struct Reassembler {
    max_message_size: usize,
    max_messages: usize,
    max_bytes: usize,
    partial: HashMap<u64, Partial>,
    buffered: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize, max_messages: usize, max_bytes: usize) -> Self {
        Self {
            max_message_size,
            max_messages,
            max_bytes,
            partial: HashMap::new(),
            buffered: 0,
        }
    }

    /// Feed one frame. Returns the full message once its last frame arrives.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        if frame.len() > self.max_message_size {
            return Err(FrameError::Oversized {
                size: frame.len(),
                limit: self.max_message_size,
            });
        }
        let header = FrameHeader::parse(frame)?;
        if header.total == 0 || header.index >= header.total {
            return Err(FrameError::Inconsistent(format!(
                "index {} of {}",
                header.index, header.total
            )));
        }
        let chunk = &frame[HEADER_LEN..];

        if header.total == 1 {
            if self.partial.contains_key(&header.correlation_id) {
                return Err(FrameError::Inconsistent(format!(
                    "message {} restarted",
                    header.correlation_id
                )));
            }
            return self.finish(header.flags, chunk.to_vec()).map(Some);
        }

        if !self.partial.contains_key(&header.correlation_id)
            && self.partial.len() >= self.max_messages
        {
            return Err(FrameError::ReassemblyFull(format!(
                "{} messages in flight",
                self.partial.len()
            )));
        }
        // A full message of `total` frames holds at least (total - 1) full chunks
        let chunk_size = self.max_message_size.saturating_sub(HEADER_LEN).max(1);
        let least = (header.total as usize - 1).saturating_mul(chunk_size);
        if least >= self.max_bytes {
            return Err(FrameError::ReassemblyFull(format!(
                "message {} declares {} frames",
                header.correlation_id, header.total
            )));
        }
        if self.buffered + chunk.len() > self.max_bytes {
            return Err(FrameError::ReassemblyFull(format!(
                "{} bytes buffered",
                self.buffered
            )));
        }

        let partial = self
            .partial
            .entry(header.correlation_id)
            .or_insert_with(|| Partial {
                total: header.total,
                flags: header.flags,
                chunks: BTreeMap::new(),
                bytes: 0,
            });
        if partial.total != header.total || partial.flags != header.flags {
            return Err(FrameError::Inconsistent(format!(
                "message {} changed its header",
                header.correlation_id
            )));
        }
        if partial.chunks.contains_key(&header.index) {
            return Err(FrameError::Inconsistent(format!(
                "duplicate frame {} of message {}",
                header.index, header.correlation_id
            )));
        }
        partial.chunks.insert(header.index, chunk.to_vec());
        partial.bytes += chunk.len();
        self.buffered += chunk.len();

        if (partial.chunks.len() as u64) < u64::from(partial.total) {
            return Ok(None);
        }

        let done = match self.partial.remove(&header.correlation_id) {
            Some(done) => done,
            None => return Ok(None),
        };
        self.buffered -= done.bytes;
        let mut body = Vec::with_capacity(done.bytes);
        for chunk in done.chunks.into_values() {
            body.extend_from_slice(&chunk);
        }
        self.finish(done.flags, body).map(Some)
    }

    fn finish(&self, flags: u8, body: Vec<u8>) -> Result<Vec<u8>, FrameError> {
        if flags & FLAG_LZ4 == 0 {
            return Ok(body);
        }
        // lz4_flex prepends the uncompressed size as u32 LE
        if body.len() < 4 {
            return Err(FrameError::Compression("missing size prefix".into()));
        }
        let declared = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if declared > self.max_bytes {
            return Err(FrameError::Oversized {
                size: declared,
                limit: self.max_bytes,
            });
        }
        lz4_flex::decompress_size_prepended(&body)
            .map_err(|e| FrameError::Compression(e.to_string()))
    }

    /// Messages currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }
}
