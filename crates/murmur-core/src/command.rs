//! Write side of the protocol: one outbound command becomes one bundle.
//!
//! ```text
//!   Contact / Chat / KeepAlive : [block, last]
//!   PushStatus, public group   : [status] [file, last]     or [status, last]
//!   PushStatus, private group  : [cipher(group)] [status*] [file*, last]
//!                                [cipher(clear), last]
//!                                (* = encrypted; status is last when no file)
//! ```

use std::path::{Path, PathBuf};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::block::file::write_file_block;
use crate::block::{encode_block, write_block, write_block_bytes, CipherBlock, KeepAlive};
use crate::config::ProtocolConfig;
use crate::crypto::{generate_iv, BundleCipher, GroupKey};
use crate::message::{ChatMessage, Contact, PushStatus};
use crate::wire::{BlockHeader, BlockType, ProtocolError};

/// An outbound command.
#[derive(Debug, Clone)]
pub enum Command {
    KeepAlive,
    Contact(Contact),
    Chat(ChatMessage),
    PushStatus(PushCommand),
}

/// A status to push, with what is needed to send it.
#[derive(Debug, Clone)]
pub struct PushCommand {
    pub status: PushStatus,
    /// Local path of the attached file. Required when the status names one.
    pub attachment: Option<PathBuf>,
    /// Key of the destination group, when it is private.
    pub group_key: Option<GroupKey>,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::KeepAlive => "keepalive",
            Command::Contact(_) => "contact",
            Command::Chat(_) => "chat",
            Command::PushStatus(_) => "push_status",
        }
    }
}

/// What a command put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transmission {
    pub bytes: u64,
    pub blocks: u32,
}

impl Transmission {
    fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.blocks += 1;
    }
}

pub struct CommandProcessor {
    config: ProtocolConfig,
}

impl CommandProcessor {
    pub fn new(config: ProtocolConfig) -> Self {
        Self { config }
    }

    /// Serialize `command` onto `out` and flush.
    ///
    /// Validation happens before the first byte is written: a payload out
    /// of bounds or a missing attachment leaves `out` untouched.
    pub async fn execute<W>(
        &self,
        out: &mut W,
        command: &Command,
    ) -> Result<Transmission, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut sent = Transmission::default();
        match command {
            Command::KeepAlive => sent.add(write_block(out, &KeepAlive, true, None).await?),
            Command::Contact(contact) => sent.add(write_block(out, contact, true, None).await?),
            Command::Chat(chat) => sent.add(write_block(out, chat, true, None).await?),
            Command::PushStatus(push) => self.push_status(out, push, &mut sent).await?,
        }
        out.flush().await?;
        tracing::trace!(
            command = command.kind(),
            bytes = sent.bytes,
            blocks = sent.blocks,
            "command written"
        );
        Ok(sent)
    }

    async fn push_status<W>(
        &self,
        out: &mut W,
        push: &PushCommand,
        sent: &mut Transmission,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let status = &push.status;
        let payload = encode_block(status)?;
        let attachment = resolve_attachment(status, push.attachment.as_deref()).await?;

        let mut status_header = BlockHeader::new(BlockType::PushStatus);
        status_header.last_block = attachment.is_none();
        let mut file_header = BlockHeader::new(BlockType::File);
        file_header.last_block = true;

        let Some(key) = &push.group_key else {
            sent.add(write_block_bytes(out, status_header, &payload, None).await?);
            if let Some(path) = attachment {
                sent.add(
                    write_file_block(
                        out,
                        file_header,
                        status.id.as_bytes(),
                        path,
                        None,
                        self.config.io_chunk_size,
                    )
                    .await?,
                );
            }
            return Ok(());
        };

        let suite = self.config.default_cipher;
        let iv = generate_iv(suite.iv_size());
        let mut cipher = BundleCipher::new(suite, key.clone(), iv.clone())?;
        let opening = CipherBlock::Group {
            suite: suite.into(),
            group: status.group,
            iv,
        };
        sent.add(write_block(out, &opening, false, None).await?);
        sent.add(write_block_bytes(out, status_header, &payload, Some(&mut cipher)).await?);
        if let Some(path) = attachment {
            sent.add(
                write_file_block(
                    out,
                    file_header,
                    status.id.as_bytes(),
                    path,
                    Some(&mut cipher),
                    self.config.io_chunk_size,
                )
                .await?,
            );
        }
        sent.add(write_block(out, &CipherBlock::Clear, true, None).await?);
        Ok(())
    }
}

/// The file to send after the status, checked to exist.
async fn resolve_attachment<'a>(
    status: &PushStatus,
    path: Option<&'a Path>,
) -> Result<Option<&'a Path>, ProtocolError> {
    match (&status.filename, path) {
        (None, _) => Ok(None),
        (Some(name), None) => Err(ProtocolError::AttachmentMissing(PathBuf::from(name))),
        (Some(_), Some(path)) => match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            _ => Err(ProtocolError::AttachmentMissing(path.to_path_buf())),
        },
    }
}
