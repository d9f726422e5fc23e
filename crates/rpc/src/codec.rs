//! Codec for messages exchanged with the client.

use futures::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use serde::{de::DeserializeOwned, Serialize};
use std::io;

/// Length-prefixed, snappy-compressed BCS frames.
///
/// Each frame is a 4-byte little-endian prefix holding the compressed length, followed by the
/// compressed bytes. Frames whose compressed or decompressed size exceeds the max are discarded
/// without allocating for them.
///
/// Errors of kind [io::ErrorKind::InvalidData] mean the frame was consumed and rejected; the
/// transport is still aligned on the next frame. Any other error leaves the transport unusable.
#[derive(Clone, Debug)]
pub struct RpcCodec {
    /// Reusable buffer for compressed frames.
    compressed_buffer: Vec<u8>,
    /// Reusable buffer for encoded messages.
    decode_buffer: Vec<u8>,
    /// The maximum size (bytes) for a single decompressed message.
    ///
    /// The 4-byte prefix does not count towards this value.
    max_message_size: usize,
}

impl RpcCodec {
    /// Create a new instance of Self.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            compressed_buffer: Vec::new(),
            decode_buffer: Vec::new(),
            max_message_size,
        }
    }

    /// Read the next message.
    ///
    /// Returns `None` if the transport ended cleanly before a new frame.
    pub async fn read_message<T, M>(&mut self, io: &mut T) -> io::Result<Option<M>>
    where
        T: AsyncRead + Unpin,
        M: DeserializeOwned,
    {
        // retrieve prefix for compressed frame length
        let mut prefix = [0; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = io.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }

        // NOTE: cast u32 to usize is safe
        let length = u32::from_le_bytes(prefix) as usize;

        // compressed bytes can't legitimately exceed this
        if length > snap::raw::max_compress_len(self.max_message_size) {
            discard(io, length).await?;
            return Err(invalid_data("prefix indicates message size is too large"));
        }

        self.compressed_buffer.clear();
        self.compressed_buffer.resize(length, 0);
        io.read_exact(&mut self.compressed_buffer).await?;

        // check the decompressed size before allocating for it
        let decompressed_len =
            snap::raw::decompress_len(&self.compressed_buffer).map_err(invalid_data)?;
        if decompressed_len > self.max_message_size {
            return Err(invalid_data("decompressed message size is too large"));
        }

        self.decode_buffer.clear();
        self.decode_buffer.resize(decompressed_len, 0);
        snap::raw::Decoder::new()
            .decompress(&self.compressed_buffer, &mut self.decode_buffer)
            .map_err(invalid_data)?;

        bcs::from_bytes(&self.decode_buffer).map(Some).map_err(invalid_data)
    }

    /// Write a message and flush.
    pub async fn write_message<T, M>(&mut self, io: &mut T, msg: &M) -> io::Result<()>
    where
        T: AsyncWrite + Unpin,
        M: Serialize,
    {
        self.decode_buffer.clear();
        bcs::serialize_into(&mut self.decode_buffer, msg).map_err(|e| {
            let error = format!("encode into buffer: {e}");
            invalid_data(error)
        })?;

        // ensure encoded bytes are within bounds
        if self.decode_buffer.len() > self.max_message_size {
            return Err(invalid_data("encoded message exceeds max_message_size"));
        }

        self.compressed_buffer.clear();
        self.compressed_buffer.resize(snap::raw::max_compress_len(self.decode_buffer.len()), 0);
        let compressed_len = snap::raw::Encoder::new()
            .compress(&self.decode_buffer, &mut self.compressed_buffer)
            .map_err(invalid_data)?;

        // NOTE: 32bit max 4,294,967,295
        let prefix = (compressed_len as u32).to_le_bytes();
        io.write_all(&prefix).await?;
        io.write_all(&self.compressed_buffer[..compressed_len]).await?;
        io.flush().await
    }
}

/// Read and drop `length` bytes.
async fn discard<T: AsyncRead + Unpin>(io: &mut T, length: usize) -> io::Result<()> {
    let copied = futures::io::copy(io.take(length as u64), &mut futures::io::sink()).await?;
    if copied < length as u64 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod codec_tests;
