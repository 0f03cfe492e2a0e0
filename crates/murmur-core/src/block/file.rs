//! File block — the one streaming variant.
//!
//! Layout: a 17-byte pseudo-header (owner id, mime selector) followed by
//! `payload_length - 17` raw file bytes. Cleartext file blocks are copied
//! between the stream and disk in fixed-size chunks and never held in
//! memory whole. An encrypted file block is a single sealed window and is
//! therefore opened in memory before it lands on disk.

use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::PayloadReader;
use super::{read_exact_payload, write_block_bytes};
use crate::crypto::BundleCipher;
use crate::ids::ID_SIZE;
use crate::wire::{BlockHeader, BlockType, ProtocolError, HEADER_SIZE};

/// Owner id + mime selector.
pub const PSEUDO_HEADER_SIZE: usize = ID_SIZE + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MimeType {
    #[default]
    OctetStream = 0x00,
    Jpeg = 0x01,
    Png = 0x02,
    Gif = 0x03,
    Text = 0x04,
}

impl MimeType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => MimeType::Jpeg,
            0x02 => MimeType::Png,
            0x03 => MimeType::Gif,
            0x04 => MimeType::Text,
            _ => MimeType::OctetStream,
        }
    }

    /// Guess from a file name's extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg") | Some("jpeg") => MimeType::Jpeg,
            Some("png") => MimeType::Png,
            Some("gif") => MimeType::Gif,
            Some("txt") => MimeType::Text,
            _ => MimeType::OctetStream,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MimeType::OctetStream => "bin",
            MimeType::Jpeg => "jpg",
            MimeType::Png => "png",
            MimeType::Gif => "gif",
            MimeType::Text => "txt",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::OctetStream => "application/octet-stream",
            MimeType::Jpeg => "image/jpeg",
            MimeType::Png => "image/png",
            MimeType::Gif => "image/gif",
            MimeType::Text => "text/plain",
        }
    }
}

/// A file received from the wire and written to local storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Status (or user, for avatars) the file belongs to.
    pub owner: [u8; ID_SIZE],
    pub mime: MimeType,
    pub path: PathBuf,
    pub size: u64,
}

impl ReceivedFile {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Bounds every file block payload must respect, in cleartext bytes.
pub fn check_bounds(payload_length: u64, max_file_size: u64) -> Result<(), ProtocolError> {
    let min = PSEUDO_HEADER_SIZE as u64;
    let max = min + max_file_size;
    if payload_length < min || payload_length > max {
        return Err(ProtocolError::malformed(
            format!("file payload length {payload_length} outside [{min}, {max}]"),
            0,
        ));
    }
    Ok(())
}

fn encode_pseudo_header(owner: &[u8; ID_SIZE], mime: MimeType) -> BytesMut {
    let mut out = BytesMut::with_capacity(PSEUDO_HEADER_SIZE);
    out.put_slice(owner);
    out.put_u8(mime as u8);
    out
}

fn decode_pseudo_header(bytes: &[u8]) -> Result<([u8; ID_SIZE], MimeType), ProtocolError> {
    let mut r = PayloadReader::new(bytes);
    let owner = r.id("owner_id")?;
    let mime = MimeType::from_u8(r.u8("mime")?);
    Ok((owner, mime))
}

async fn create_destination(
    dir: &Path,
    mime: MimeType,
) -> Result<(fs::File, PathBuf), ProtocolError> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), mime.extension()));
    let file = fs::File::create(&path).await?;
    Ok((file, path))
}

/// Stream a cleartext file block's payload from `input` into a new file
/// under `dir`. Consumes exactly `header.payload_length` bytes.
pub async fn read_file_block<R>(
    input: &mut R,
    header: &BlockHeader,
    dir: &Path,
    chunk_size: usize,
) -> Result<ReceivedFile, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let pseudo = read_exact_payload(input, PSEUDO_HEADER_SIZE as u64).await?;
    let (owner, mime) = decode_pseudo_header(&pseudo)?;
    let size = header.payload_length - PSEUDO_HEADER_SIZE as u64;

    let (mut file, path) = create_destination(dir, mime).await?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = input.read(&mut buf[..want]).await?;
        if n == 0 {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(ProtocolError::Truncated {
                expected: header.payload_length,
                got: header.payload_length - remaining,
            });
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;

    tracing::trace!(path = %path.display(), size, "file block stored");
    Ok(ReceivedFile {
        owner,
        mime,
        path,
        size,
    })
}

/// Store a file block whose payload window was already decrypted.
pub async fn store_file_window(window: &[u8], dir: &Path) -> Result<ReceivedFile, ProtocolError> {
    let (owner, mime) = decode_pseudo_header(window)?;
    let body = &window[PSEUDO_HEADER_SIZE..];
    let (mut file, path) = create_destination(dir, mime).await?;
    file.write_all(body).await?;
    file.flush().await?;
    Ok(ReceivedFile {
        owner,
        mime,
        path,
        size: body.len() as u64,
    })
}

/// Write a file block for the file at `path`.
///
/// Returns the number of bytes written, header included. Without a cipher
/// the file is streamed in `chunk_size` pieces.
pub async fn write_file_block<W>(
    out: &mut W,
    mut header: BlockHeader,
    owner: &[u8; ID_SIZE],
    path: &Path,
    cipher: Option<&mut BundleCipher>,
    chunk_size: usize,
) -> Result<u64, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    header.block_type = BlockType::File;
    let mime = MimeType::from_path(path);
    let mut file = fs::File::open(path)
        .await
        .map_err(|_| ProtocolError::AttachmentMissing(path.to_path_buf()))?;
    let size = file.metadata().await?.len();
    let pseudo = encode_pseudo_header(owner, mime);

    if let Some(cipher) = cipher {
        let mut window = Vec::with_capacity(PSEUDO_HEADER_SIZE + size as usize);
        window.extend_from_slice(&pseudo);
        file.read_to_end(&mut window).await?;
        return write_block_bytes(out, header, &window, Some(cipher)).await;
    }

    header.encrypted = false;
    header.payload_length = PSEUDO_HEADER_SIZE as u64 + size;
    header.write(out).await?;
    out.write_all(&pseudo).await?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;
    while sent < size {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let n = n.min((size - sent) as usize);
        out.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    if sent != size {
        return Err(ProtocolError::Truncated {
            expected: size,
            got: sent,
        });
    }
    Ok((HEADER_SIZE + PSEUDO_HEADER_SIZE) as u64 + size)
}
