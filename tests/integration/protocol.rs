//! Raw block streams fed into a device's receive path.

use anyhow::Result;
use tokio::io::AsyncWriteExt;

use murmur_core::crypto::{CipherSuite, GroupKey};
use murmur_core::{
    ChatMessage, Command, CommandProcessor, Group, GroupId, PushCommand, PushStatus,
};

use crate::*;

fn push(status: PushStatus, group_key: Option<GroupKey>) -> Command {
    Command::PushStatus(PushCommand {
        status,
        attachment: None,
        group_key,
    })
}

/// A bundle sealed with a key the receiver lacks is skipped whole and the
/// stream stays usable.
#[tokio::test]
async fn unknown_key_bundle_is_skipped() -> Result<()> {
    let secret = Group::private(GroupId::random(), "secret", GroupKey::generate());
    let town = Group::public(GroupId::random(), "town");
    let mut b = Device::new("b");
    b.join(&town);
    let sender = Device::new("a");

    let writer = CommandProcessor::new(sender.service.config().protocol.clone());
    let (mut tx, rx) = tokio::io::duplex(PIPE_SIZE);

    let hidden = PushStatus::new(secret.id, sender.uid(), "a", "for members only");
    let open = PushStatus::new(town.id, sender.uid(), "a", "hello town");
    writer.execute(&mut tx, &push(hidden.clone(), secret.key.clone())).await?;
    writer.execute(&mut tx, &push(open.clone(), None)).await?;
    writer
        .execute(&mut tx, &Command::Chat(ChatMessage::new(sender.uid(), "a", "still there?")))
        .await?;
    drop(tx);

    let handled = b.service.serve(sender.uid(), rx).await?;
    assert_eq!(handled, 2);
    assert!(!b.has_status(&hidden.id));
    assert!(b.has_status(&open.id));
    assert_eq!(b.service.chats().get(&sender.uid())[0].text, "still there?");
    Ok(())
}

/// The same private bundle decodes once the receiver holds the key, for
/// every cipher suite.
#[tokio::test]
async fn private_bundle_with_each_suite() -> Result<()> {
    for suite in [CipherSuite::Aes256Cbc, CipherSuite::ChaCha20Poly1305] {
        let club = Group::private(GroupId::random(), "club", GroupKey::generate());
        let mut b = Device::new("b");
        b.join(&club);

        let mut protocol = b.service.config().protocol.clone();
        protocol.default_cipher = suite;
        let writer = CommandProcessor::new(protocol);
        let (mut tx, rx) = tokio::io::duplex(PIPE_SIZE);
        let status = PushStatus::new(club.id, murmur_core::UserId::random(), "a", "psst");
        writer.execute(&mut tx, &push(status.clone(), club.key.clone())).await?;
        drop(tx);

        assert_eq!(b.service.serve(status.author, rx).await?, 1, "{suite:?}");
        assert!(b.has_status(&status.id), "{suite:?}");
    }
    Ok(())
}

/// A stream cut inside a payload is an error, not a silent end.
#[tokio::test]
async fn truncated_stream_is_reported() -> Result<()> {
    let b = Device::new("b");
    let writer = CommandProcessor::new(b.service.config().protocol.clone());
    let mut encoded = Vec::new();
    let chat = ChatMessage::new(murmur_core::UserId::random(), "a", "cut short");
    writer.execute(&mut encoded, &Command::Chat(chat)).await?;

    let (mut tx, rx) = tokio::io::duplex(PIPE_SIZE);
    tx.write_all(&encoded[..encoded.len() - 3]).await?;
    drop(tx);

    let err = b
        .service
        .serve(murmur_core::UserId::random(), rx)
        .await
        .expect_err("truncated payload must fail");
    assert!(matches!(
        err.downcast_ref::<murmur_core::ProtocolError>(),
        Some(murmur_core::ProtocolError::Truncated { .. })
    ));
    Ok(())
}
