//! Read side of the protocol: turns a byte stream back into messages.
//!
//! The processor reads one header at a time and keeps the state scoped to
//! the current bundle: the cipher set up by a Cipher block and a status
//! waiting for its attached file. A header carrying the last-block flag
//! clears both, whichever block it belongs to.

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::block::file::{self, ReceivedFile, PSEUDO_HEADER_SIZE};
use crate::block::{
    decode_block, discard_payload, read_exact_payload, BlockPayload, CipherBlock, KeepAlive,
};
use crate::config::ProtocolConfig;
use crate::crypto::{BundleCipher, CryptoError, GroupKeyring};
use crate::message::{ChatMessage, Contact, PushStatus};
use crate::wire::{BlockHeader, BlockType, ProtocolError};

/// Where the processor stands within the current bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    /// Encrypted blocks are arriving with no usable key; they are skipped
    /// until a Cipher block or the end of the bundle.
    AwaitingCipherBlock,
    InsideEncryptedBundle,
    AwaitingFileForPendingStatus,
}

/// A message extracted from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedEvent {
    /// A status, with its attachment once the following File block landed.
    Status {
        status: PushStatus,
        attachment: Option<ReceivedFile>,
    },
    Chat(ChatMessage),
    Contact(Contact),
    /// A file that did not belong to a pending status (avatars and the like).
    File(ReceivedFile),
    KeepAlive,
}

impl ReceivedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ReceivedEvent::Status { .. } => "status",
            ReceivedEvent::Chat(_) => "chat",
            ReceivedEvent::Contact(_) => "contact",
            ReceivedEvent::File(_) => "file",
            ReceivedEvent::KeepAlive => "keepalive",
        }
    }
}

pub struct BlockProcessor {
    config: ProtocolConfig,
    keyring: Arc<dyn GroupKeyring>,
    cipher: Option<BundleCipher>,
    pending: Option<PushStatus>,
    skipping: bool,
    discarded: u64,
}

impl BlockProcessor {
    pub fn new(config: ProtocolConfig, keyring: Arc<dyn GroupKeyring>) -> Self {
        Self {
            config,
            keyring,
            cipher: None,
            pending: None,
            skipping: false,
            discarded: 0,
        }
    }

    pub fn state(&self) -> ProcessorState {
        if self.pending.is_some() {
            ProcessorState::AwaitingFileForPendingStatus
        } else if self.cipher.is_some() {
            ProcessorState::InsideEncryptedBundle
        } else if self.skipping {
            ProcessorState::AwaitingCipherBlock
        } else {
            ProcessorState::Idle
        }
    }

    /// True while a decryption key is active for the current bundle.
    pub fn is_decrypting(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypted blocks skipped so far for lack of a usable key.
    pub fn discarded_blocks(&self) -> u64 {
        self.discarded
    }

    /// Read one block and return the message it completes, if any.
    ///
    /// Structural errors abort the bundle: its state is reset and the error
    /// is handed to the caller, which owns the connection.
    pub async fn process_next<R>(
        &mut self,
        input: &mut R,
    ) -> Result<Option<ReceivedEvent>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        self.next_block(input).await.map(|(_, event)| event)
    }

    /// Read blocks up to and including the next one flagged last.
    pub async fn process_bundle<R>(
        &mut self,
        input: &mut R,
    ) -> Result<Vec<ReceivedEvent>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut events = Vec::new();
        loop {
            let (header, event) = self.next_block(input).await?;
            events.extend(event);
            if header.last_block {
                return Ok(events);
            }
        }
    }

    async fn next_block<R>(
        &mut self,
        input: &mut R,
    ) -> Result<(BlockHeader, Option<ReceivedEvent>), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = BlockHeader::read(input).await?;
        let result = match self.handle(input, &header).await {
            // Past the header the peer owes us a payload.
            Err(ProtocolError::EndOfStream) => Err(ProtocolError::Truncated {
                expected: header.payload_length,
                got: 0,
            }),
            other => other,
        };
        if header.last_block || result.is_err() {
            self.reset_bundle();
        }
        result.map(|event| (header, event))
    }

    fn reset_bundle(&mut self) {
        if let Some(status) = self.pending.take() {
            tracing::debug!(
                status = %status.id.short(),
                "bundle closed before the attachment arrived; status dropped"
            );
        }
        if self.cipher.take().is_some() || self.skipping {
            tracing::trace!("bundle reset, decryption torn down");
        }
        self.skipping = false;
    }

    async fn handle<R>(
        &mut self,
        input: &mut R,
        header: &BlockHeader,
    ) -> Result<Option<ReceivedEvent>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        if header.block_type == BlockType::Null {
            return Err(ProtocolError::UnknownBlockType(BlockType::Null as u8));
        }

        if header.encrypted {
            return self.handle_encrypted(input, header).await;
        }

        if header.block_type == BlockType::File {
            file::check_bounds(header.payload_length, self.config.max_file_size)?;
            let received = file::read_file_block(
                input,
                header,
                &self.config.attachment_dir,
                self.config.io_chunk_size,
            )
            .await?;
            return Ok(Some(self.on_file(received)));
        }

        sanity_check(header.block_type, header.payload_length)?;
        let payload = read_exact_payload(input, header.payload_length).await?;
        self.on_window(header.block_type, &payload)
    }

    async fn handle_encrypted<R>(
        &mut self,
        input: &mut R,
        header: &BlockHeader,
    ) -> Result<Option<ReceivedEvent>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let Some(cipher) = self.cipher.as_mut() else {
            tracing::debug!(
                block_type = ?header.block_type,
                len = header.payload_length,
                "no bundle key, discarding encrypted block"
            );
            discard_payload(input, header.payload_length).await?;
            self.skipping = true;
            self.discarded += 1;
            return Ok(None);
        };

        let max_clear = match header.block_type {
            BlockType::File => PSEUDO_HEADER_SIZE as u64 + self.config.max_file_size,
            other => max_payload(other),
        };
        let max_sealed = cipher.suite().sealed_len(max_clear as usize) as u64;
        if header.payload_length > max_sealed {
            return Err(ProtocolError::malformed(
                format!(
                    "encrypted {:?} payload length {} exceeds {max_sealed}",
                    header.block_type, header.payload_length
                ),
                0,
            ));
        }

        let window = read_exact_payload(input, header.payload_length).await?;
        let clear = match cipher.open(&window) {
            Ok(clear) => clear,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    block_type = ?header.block_type,
                    "cannot decrypt block, skipping the rest of the encrypted region"
                );
                self.cipher = None;
                self.skipping = true;
                self.discarded += 1;
                return Ok(None);
            }
        };

        if header.block_type == BlockType::File {
            file::check_bounds(clear.len() as u64, self.config.max_file_size)?;
            let received = file::store_file_window(&clear, &self.config.attachment_dir).await?;
            return Ok(Some(self.on_file(received)));
        }
        self.on_window(header.block_type, &clear)
    }

    /// Handle a buffered, cleartext payload.
    fn on_window(
        &mut self,
        block_type: BlockType,
        payload: &[u8],
    ) -> Result<Option<ReceivedEvent>, ProtocolError> {
        match block_type {
            BlockType::KeepAlive => {
                decode_block::<KeepAlive>(payload)?;
                Ok(Some(ReceivedEvent::KeepAlive))
            }
            BlockType::PushStatus => {
                let status = decode_block::<PushStatus>(payload)?;
                if status.has_attachment() {
                    self.pending = Some(status);
                    Ok(None)
                } else {
                    self.pending = None;
                    Ok(Some(ReceivedEvent::Status {
                        status,
                        attachment: None,
                    }))
                }
            }
            BlockType::Contact => Ok(Some(ReceivedEvent::Contact(decode_block(payload)?))),
            BlockType::ChatMessage => Ok(Some(ReceivedEvent::Chat(decode_block(payload)?))),
            BlockType::Cipher => {
                let block = decode_block::<CipherBlock>(payload)?;
                self.on_cipher(block);
                Ok(None)
            }
            BlockType::File | BlockType::Null => {
                Err(ProtocolError::UnknownBlockType(block_type as u8))
            }
        }
    }

    fn on_cipher(&mut self, block: CipherBlock) {
        match block {
            CipherBlock::Clear => {
                self.cipher = None;
                self.skipping = false;
            }
            CipherBlock::Group { suite, group, iv } => {
                let setup = suite.resolve().and_then(|suite| {
                    let key = self
                        .keyring
                        .group_key(&group)
                        .ok_or_else(|| CryptoError::UnknownGroup(group.short()))?;
                    BundleCipher::new(suite, key, iv)
                });
                match setup {
                    Ok(cipher) => {
                        tracing::trace!(
                            group = %group.short(),
                            suite = ?cipher.suite(),
                            "bundle decryption set up"
                        );
                        self.cipher = Some(cipher);
                        self.skipping = false;
                    }
                    Err(e) => {
                        let e = ProtocolError::CryptographicFailure(e);
                        tracing::warn!(error = %e, group = %group.short(), "proceeding without decryption");
                        self.cipher = None;
                        self.skipping = true;
                    }
                }
            }
        }
    }

    fn on_file(&mut self, received: ReceivedFile) -> ReceivedEvent {
        match self.pending.take() {
            Some(status) => ReceivedEvent::Status {
                status,
                attachment: Some(received),
            },
            None => ReceivedEvent::File(received),
        }
    }
}

fn sanity_check(block_type: BlockType, len: u64) -> Result<(), ProtocolError> {
    match block_type {
        BlockType::KeepAlive => KeepAlive::sanity_check(block_type, len),
        BlockType::PushStatus => PushStatus::sanity_check(block_type, len),
        BlockType::Contact => Contact::sanity_check(block_type, len),
        BlockType::ChatMessage => ChatMessage::sanity_check(block_type, len),
        BlockType::Cipher => CipherBlock::sanity_check(block_type, len),
        BlockType::File | BlockType::Null => Err(ProtocolError::UnknownBlockType(block_type as u8)),
    }
}

fn max_payload(block_type: BlockType) -> u64 {
    match block_type {
        BlockType::KeepAlive => KeepAlive::MAX_PAYLOAD,
        BlockType::PushStatus => PushStatus::MAX_PAYLOAD,
        BlockType::Contact => Contact::MAX_PAYLOAD,
        BlockType::ChatMessage => ChatMessage::MAX_PAYLOAD,
        BlockType::Cipher => CipherBlock::MAX_PAYLOAD,
        BlockType::File | BlockType::Null => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{encode_block, write_block, write_block_bytes};
    use crate::crypto::{generate_iv, CipherSuite, GroupKey, MemoryKeyring};
    use crate::ids::{GroupId, UserId};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir(tag: &str) -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "murmur-processor-{tag}-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn processor(keyring: Arc<MemoryKeyring>, dir: PathBuf) -> BlockProcessor {
        let config = ProtocolConfig {
            attachment_dir: dir,
            ..ProtocolConfig::default()
        };
        BlockProcessor::new(config, keyring)
    }

    fn status(group: GroupId, post: &str) -> PushStatus {
        PushStatus::new(group, UserId::random(), "ann", post)
    }

    /// Cipher(group), `n` encrypted statuses, Cipher(clear, last).
    async fn encrypted_bundle(
        group: GroupId,
        key: &GroupKey,
        suite: CipherSuite,
        n: usize,
    ) -> (Vec<u8>, Vec<PushStatus>) {
        let iv = generate_iv(suite.iv_size());
        let mut cipher = BundleCipher::new(suite, key.clone(), iv.clone()).unwrap();
        let mut wire = Vec::new();
        let opening = CipherBlock::Group {
            suite: suite.into(),
            group,
            iv,
        };
        write_block(&mut wire, &opening, false, None).await.unwrap();
        let mut sent = Vec::new();
        for i in 0..n {
            let s = status(group, &format!("post #{i}"));
            write_block(&mut wire, &s, false, Some(&mut cipher)).await.unwrap();
            sent.push(s);
        }
        write_block(&mut wire, &CipherBlock::Clear, true, None).await.unwrap();
        (wire, sent)
    }

    #[tokio::test]
    async fn encrypted_bundle_yields_every_block() {
        for suite in [CipherSuite::Aes256Cbc, CipherSuite::ChaCha20Poly1305] {
            let group = GroupId::random();
            let key = GroupKey::generate();
            let keyring = Arc::new(MemoryKeyring::new());
            keyring.insert(group, key.clone());

            let (wire, sent) = encrypted_bundle(group, &key, suite, 4).await;
            let mut p = processor(keyring, temp_dir("bundle"));
            let mut input: &[u8] = &wire;
            let events = p.process_bundle(&mut input).await.unwrap();

            assert_eq!(events.len(), 4);
            for (event, expected) in events.iter().zip(&sent) {
                match event {
                    ReceivedEvent::Status { status, attachment } => {
                        assert_eq!(status, expected);
                        assert!(attachment.is_none());
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            }
            assert!(!p.is_decrypting());
            assert_eq!(p.state(), ProcessorState::Idle);
            assert!(input.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_key_skips_bundle_and_keeps_alignment() {
        let group = GroupId::random();
        let key = GroupKey::generate();
        let (mut wire, _) = encrypted_bundle(group, &key, CipherSuite::Aes256Cbc, 3).await;

        let chat = ChatMessage::new(UserId::random(), "bob", "after the private bundle");
        write_block(&mut wire, &chat, true, None).await.unwrap();

        let mut p = processor(Arc::new(MemoryKeyring::new()), temp_dir("skip"));
        let mut input: &[u8] = &wire;
        let skipped = p.process_bundle(&mut input).await.unwrap();
        assert!(skipped.is_empty());
        assert_eq!(p.discarded_blocks(), 3);

        let next = p.process_bundle(&mut input).await.unwrap();
        assert_eq!(next, vec![ReceivedEvent::Chat(chat)]);
    }

    #[tokio::test]
    async fn wrong_key_degrades_to_skipping() {
        let group = GroupId::random();
        let (wire, _) =
            encrypted_bundle(group, &GroupKey::generate(), CipherSuite::ChaCha20Poly1305, 2).await;

        let keyring = Arc::new(MemoryKeyring::new());
        keyring.insert(group, GroupKey::generate());
        let mut p = processor(keyring, temp_dir("wrongkey"));
        let mut input: &[u8] = &wire;

        assert_eq!(p.process_next(&mut input).await.unwrap(), None);
        assert_eq!(p.state(), ProcessorState::InsideEncryptedBundle);
        assert_eq!(p.process_next(&mut input).await.unwrap(), None);
        assert_eq!(p.state(), ProcessorState::AwaitingCipherBlock);
        assert_eq!(p.process_next(&mut input).await.unwrap(), None);
        assert_eq!(p.discarded_blocks(), 2);
        assert_eq!(p.process_next(&mut input).await.unwrap(), None);
        assert_eq!(p.state(), ProcessorState::Idle);
    }

    #[tokio::test]
    async fn unsupported_suite_skips_bundle_and_keeps_alignment() {
        let group = GroupId::random();
        let key = GroupKey::generate();
        let keyring = Arc::new(MemoryKeyring::new());
        keyring.insert(group, key.clone());

        let (mut wire, _) = encrypted_bundle(group, &key, CipherSuite::Aes256Cbc, 1).await;
        // Cipher(group) payload: cipher type, then the algorithm byte.
        wire[crate::wire::HEADER_SIZE + 1] = 0x09;
        let chat = ChatMessage::new(UserId::random(), "bob", "in the clear");
        write_block(&mut wire, &chat, true, None).await.unwrap();

        let mut p = processor(keyring, temp_dir("suite"));
        let mut input: &[u8] = &wire;
        assert!(p.process_bundle(&mut input).await.unwrap().is_empty());
        assert_eq!(p.discarded_blocks(), 1);
        assert_eq!(p.state(), ProcessorState::Idle);

        let next = p.process_bundle(&mut input).await.unwrap();
        assert_eq!(next, vec![ReceivedEvent::Chat(chat)]);
    }

    #[tokio::test]
    async fn encrypted_block_without_cipher_is_discarded() {
        let mut wire = Vec::new();
        let mut header = BlockHeader::new(BlockType::PushStatus);
        header.encrypted = true;
        header.payload_length = 5;
        header.write(&mut wire).await.unwrap();
        wire.extend_from_slice(&[0xAA; 5]);
        write_block(&mut wire, &KeepAlive, true, None).await.unwrap();

        let mut p = processor(Arc::new(MemoryKeyring::new()), temp_dir("garbage"));
        let mut input: &[u8] = &wire;
        assert_eq!(p.process_bundle(&mut input).await.unwrap(), vec![ReceivedEvent::KeepAlive]);
        assert_eq!(p.discarded_blocks(), 1);
    }

    #[tokio::test]
    async fn status_waits_for_its_file() {
        let dir = temp_dir("attach");
        let mut s = status(GroupId::random(), "look at this");
        s.filename = Some("cat.png".to_string());

        let mut wire = Vec::new();
        write_block(&mut wire, &s, false, None).await.unwrap();
        let mut header = BlockHeader::new(BlockType::File);
        header.last_block = true;
        header.payload_length = (PSEUDO_HEADER_SIZE + 4) as u64;
        header.write(&mut wire).await.unwrap();
        wire.extend_from_slice(s.id.as_bytes());
        wire.push(file::MimeType::Png as u8);
        wire.extend_from_slice(b"\x89PNG");

        let mut p = processor(Arc::new(MemoryKeyring::new()), dir.clone());
        let mut input: &[u8] = &wire;
        assert_eq!(p.process_next(&mut input).await.unwrap(), None);
        assert_eq!(p.state(), ProcessorState::AwaitingFileForPendingStatus);

        match p.process_next(&mut input).await.unwrap() {
            Some(ReceivedEvent::Status {
                status,
                attachment: Some(file),
            }) => {
                assert_eq!(status, s);
                assert_eq!(file.owner, *s.id.as_bytes());
                assert_eq!(std::fs::read(&file.path).unwrap(), b"\x89PNG");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(p.state(), ProcessorState::Idle);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn last_flag_drops_pending_status() {
        let mut s = status(GroupId::random(), "orphan");
        s.filename = Some("gone.jpg".to_string());
        let mut wire = Vec::new();
        write_block(&mut wire, &s, true, None).await.unwrap();

        let mut p = processor(Arc::new(MemoryKeyring::new()), temp_dir("orphan"));
        let mut input: &[u8] = &wire;
        assert!(p.process_bundle(&mut input).await.unwrap().is_empty());
        assert_eq!(p.state(), ProcessorState::Idle);
    }

    #[tokio::test]
    async fn standalone_file_is_reported() {
        let dir = temp_dir("standalone");
        let mut header = BlockHeader::new(BlockType::File);
        header.last_block = true;
        let mut window = vec![7u8; PSEUDO_HEADER_SIZE];
        window[PSEUDO_HEADER_SIZE - 1] = file::MimeType::Text as u8;
        window.extend_from_slice(b"avatar");
        let mut wire = Vec::new();
        write_block_bytes(&mut wire, header, &window, None).await.unwrap();

        let mut p = processor(Arc::new(MemoryKeyring::new()), dir.clone());
        let mut input: &[u8] = &wire;
        match p.process_next(&mut input).await.unwrap() {
            Some(ReceivedEvent::File(f)) => {
                assert_eq!(f.owner, [7u8; 16]);
                assert_eq!(f.mime, file::MimeType::Text);
                assert_eq!(f.size, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn null_block_is_fatal() {
        let mut wire = Vec::new();
        BlockHeader::new(BlockType::Null).write(&mut wire).await.unwrap();
        let mut p = processor(Arc::new(MemoryKeyring::new()), temp_dir("null"));
        let mut input: &[u8] = &wire;
        assert!(matches!(
            p.process_next(&mut input).await,
            Err(ProtocolError::UnknownBlockType(0xFF))
        ));
    }

    #[tokio::test]
    async fn oversized_payload_rejected_before_reading() {
        let mut wire = Vec::new();
        let mut header = BlockHeader::new(BlockType::ChatMessage);
        header.payload_length = ChatMessage::MAX_PAYLOAD + 1;
        header.write(&mut wire).await.unwrap();

        let mut p = processor(Arc::new(MemoryKeyring::new()), temp_dir("oversized"));
        let mut input: &[u8] = &wire;
        assert!(matches!(
            p.process_next(&mut input).await,
            Err(ProtocolError::MalformedBlockPayload { .. })
        ));
    }

    #[tokio::test]
    async fn closed_stream_is_end_of_stream() {
        let mut p = processor(Arc::new(MemoryKeyring::new()), temp_dir("eos"));
        let mut input: &[u8] = &[];
        assert!(matches!(
            p.process_next(&mut input).await,
            Err(ProtocolError::EndOfStream)
        ));

        let contact = Contact::new(UserId::random(), "cy");
        let bytes = encode_block(&contact).unwrap();
        let mut wire = Vec::new();
        let mut header = BlockHeader::new(BlockType::Contact);
        header.payload_length = bytes.len() as u64;
        header.write(&mut wire).await.unwrap();
        let header_only = wire.clone();
        wire.extend_from_slice(&bytes[..bytes.len() - 1]);
        let mut input: &[u8] = &wire;
        assert!(matches!(
            p.process_next(&mut input).await,
            Err(ProtocolError::Truncated { .. })
        ));

        let mut input: &[u8] = &header_only;
        assert!(matches!(
            p.process_next(&mut input).await,
            Err(ProtocolError::Truncated { got: 0, .. })
        ));
    }
}
