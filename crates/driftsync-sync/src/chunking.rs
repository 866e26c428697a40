//! Chunk framing for large payloads.
//!
//! Payloads are cut into pieces of at most `chunk_size` characters and sent
//! as `chunk:<index>:<count>:<content>`. Lengths count Unicode scalar values,
//! so a chunk never splits a code point. Content is opaque: only the first
//! three `:` delimiters are significant.

use std::time::Duration;

use crate::error::{ChunkError, Result, SyncError};
use crate::interruptable::Interruptable;
use crate::transport::Transport;

const CHUNK_TAG: &str = "chunk";

/// `ceil(chars(payload) / chunk_size)`. Zero for an empty payload.
pub fn calculate_chunk_count(payload: &str, chunk_size: usize) -> usize {
    let chunk_size = chunk_size.max(1);
    payload.chars().count().div_ceil(chunk_size)
}

/// Characters `[index * chunk_size, (index + 1) * chunk_size)` of `payload`,
/// clipped at the end.
pub fn get_chunk(payload: &str, index: usize, chunk_size: usize) -> &str {
    let chunk_size = chunk_size.max(1);
    let start = byte_offset(payload, index.saturating_mul(chunk_size));
    let end = byte_offset(payload, index.saturating_add(1).saturating_mul(chunk_size));
    &payload[start..end]
}

fn byte_offset(payload: &str, chars: usize) -> usize {
    payload
        .char_indices()
        .nth(chars)
        .map(|(offset, _)| offset)
        .unwrap_or(payload.len())
}

/// Split `payload` into its chunks in one pass.
pub fn split_chunks(payload: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    for (n, (offset, _)) in payload.char_indices().enumerate() {
        if n > 0 && n % chunk_size == 0 {
            chunks.push(&payload[start..offset]);
            start = offset;
        }
    }
    if start < payload.len() {
        chunks.push(&payload[start..]);
    }
    chunks
}

/// Wire form of one chunk.
pub fn format_chunk(index: usize, count: usize, content: &str) -> String {
    format!("{}:{}:{}:{}", CHUNK_TAG, index, count, content)
}

/// A parsed chunk message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub count: usize,
    pub content: String,
}

impl Chunk {
    /// Parse `chunk:<index>:<count>:<content>`.
    pub fn parse(message: &str) -> std::result::Result<Self, ChunkError> {
        let malformed = || ChunkError::MalformedHeader(truncate(message));

        let mut parts = message.splitn(4, ':');
        let (Some(tag), Some(index), Some(count), Some(content)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        if tag != CHUNK_TAG {
            return Err(malformed());
        }
        let index: usize = index.parse().map_err(|_| malformed())?;
        let count: usize = count.parse().map_err(|_| malformed())?;
        if count == 0 || index >= count {
            return Err(malformed());
        }

        Ok(Self {
            index,
            count,
            content: content.to_string(),
        })
    }
}

fn truncate(message: &str) -> String {
    const MAX: usize = 40;
    if message.chars().count() <= MAX {
        message.to_string()
    } else {
        format!("{}...", get_chunk(message, 0, MAX))
    }
}

/// Reassembles chunks of one payload, in order.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    expected_chunk_count: Option<usize>,
    received: usize,
    buffer: String,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the next chunk. Returns the payload once every chunk has arrived.
    pub fn push(&mut self, chunk: Chunk) -> std::result::Result<Option<String>, ChunkError> {
        let expected = *self.expected_chunk_count.get_or_insert(chunk.count);
        if chunk.count != expected {
            return Err(ChunkError::CountMismatch {
                expected,
                got: chunk.count,
            });
        }
        if chunk.index != self.received {
            return Err(ChunkError::OutOfOrder {
                expected: self.received,
                got: chunk.index,
            });
        }

        self.buffer.push_str(&chunk.content);
        self.received += 1;

        if self.received == expected {
            self.expected_chunk_count = None;
            self.received = 0;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        Ok(None)
    }

    pub fn is_idle(&self) -> bool {
        self.expected_chunk_count.is_none()
    }
}

/// Send `payload` in chunks. Returns `false` if the interruptable stopped
/// the transfer midway.
///
/// An empty payload travels as a single empty chunk.
pub async fn send_in_chunks<T: Transport + ?Sized>(
    transport: &T,
    payload: &str,
    chunk_size: usize,
    interruptable: &Interruptable,
) -> Result<bool> {
    let mut chunks = split_chunks(payload, chunk_size);
    if chunks.is_empty() {
        chunks.push("");
    }
    let count = chunks.len();

    let mut pieces = chunks.into_iter().enumerate();
    while let Some((index, content)) = interruptable.next(&mut pieces).await? {
        transport.send(format_chunk(index, count, content)).await?;
    }
    Ok(!interruptable.is_cancelled())
}

/// Receive one complete chunked payload.
///
/// Each wait for the next chunk is bounded by `timeout`; exceeding it is
/// [`SyncError::Stalled`]. `Ok(None)` when the interruptable was cancelled.
pub async fn receive_in_chunks<T: Transport + ?Sized>(
    transport: &T,
    timeout: Option<Duration>,
    interruptable: &Interruptable,
) -> Result<Option<String>> {
    let mut assembler = ChunkAssembler::new();

    while interruptable.gate().await? {
        let message = tokio::select! {
            message = recv_with_timeout(transport, timeout) => message?,
            _ = interruptable.cancelled() => return Ok(None),
        };

        if let Some(payload) = assembler.push(Chunk::parse(&message)?)? {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

async fn recv_with_timeout<T: Transport + ?Sized>(
    transport: &T,
    timeout: Option<Duration>,
) -> Result<String> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, transport.recv())
            .await
            .map_err(|_| SyncError::Stalled {
                timeout_ms: limit.as_millis() as u64,
            })?,
        None => transport.recv().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use proptest::prelude::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(calculate_chunk_count("", 3), 0);
        assert_eq!(calculate_chunk_count("abc", 3), 1);
        assert_eq!(calculate_chunk_count("abcd", 3), 2);
        assert_eq!(calculate_chunk_count("ééé", 2), 2);
    }

    #[test]
    fn test_get_chunk_clips_at_end() {
        assert_eq!(get_chunk("abcdefg", 0, 3), "abc");
        assert_eq!(get_chunk("abcdefg", 2, 3), "g");
        assert_eq!(get_chunk("abcdefg", 3, 3), "");
        assert_eq!(get_chunk("añb€", 1, 2), "b€");
    }

    #[test]
    fn test_get_chunk_with_extreme_index() {
        assert_eq!(get_chunk("abcdef", usize::MAX, 2), "");
        assert_eq!(get_chunk("abcdef", usize::MAX - 1, 4), "");
        assert_eq!(get_chunk("abcdef", 0, usize::MAX), "abcdef");
    }

    #[test]
    fn test_parse_keeps_colons_in_content() {
        let chunk = Chunk::parse("chunk:1:3:{\"a\":\"b:c\"}").unwrap();
        assert_eq!(chunk.index, 1);
        assert_eq!(chunk.count, 3);
        assert_eq!(chunk.content, "{\"a\":\"b:c\"}");
    }

    #[test]
    fn test_parse_rejects_malformed_headers() {
        for message in [
            "chunk:0:1",
            "block:0:1:x",
            "chunk:a:1:x",
            "chunk:0:b:x",
            "chunk:0:0:x",
            "chunk:2:2:x",
            "",
        ] {
            assert!(
                matches!(Chunk::parse(message), Err(ChunkError::MalformedHeader(_))),
                "accepted {:?}",
                message
            );
        }
    }

    #[test]
    fn test_assembler_rejects_count_change() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(Chunk::parse("chunk:0:3:a").unwrap()).unwrap();
        assert_eq!(
            assembler.push(Chunk::parse("chunk:1:4:b").unwrap()),
            Err(ChunkError::CountMismatch { expected: 3, got: 4 })
        );
    }

    #[test]
    fn test_assembler_rejects_out_of_order() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(Chunk::parse("chunk:0:3:a").unwrap()).unwrap();
        assert_eq!(
            assembler.push(Chunk::parse("chunk:2:3:c").unwrap()),
            Err(ChunkError::OutOfOrder { expected: 1, got: 2 })
        );
    }

    #[tokio::test]
    async fn test_send_and_receive_over_transport() {
        let (a, b) = memory::pair();
        let interruptable = Interruptable::new();
        let payload = "héllo wörld: chunked";

        assert!(send_in_chunks(&a, payload, 4, &interruptable).await.unwrap());
        let received = receive_in_chunks(&b, Some(Duration::from_secs(1)), &interruptable)
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some(payload));
    }

    #[tokio::test]
    async fn test_empty_payload_is_one_chunk() {
        let (a, b) = memory::pair();
        let interruptable = Interruptable::new();

        send_in_chunks(&a, "", 4, &interruptable).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), "chunk:0:1:");
    }

    #[tokio::test]
    async fn test_receive_times_out_as_stall() {
        let (_a, b) = memory::pair();
        let result =
            receive_in_chunks(&b, Some(Duration::from_millis(30)), &Interruptable::new()).await;
        assert!(matches!(result, Err(SyncError::Stalled { timeout_ms: 30 })));
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_receive() {
        let (_a, b) = memory::pair();
        let interruptable = Interruptable::new();
        let canceller = interruptable.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let received = receive_in_chunks(&b, None, &interruptable).await.unwrap();
        assert!(received.is_none());
    }

    proptest! {
        #[test]
        fn test_split_join_identity(payload in "\\PC{0,200}", size in 1usize..20) {
            let chunks = split_chunks(&payload, size);
            prop_assert_eq!(chunks.len(), calculate_chunk_count(&payload, size));
            prop_assert_eq!(chunks.concat(), payload.clone());
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(*chunk, get_chunk(&payload, i, size));
            }
        }
    }
}
