//! Statuses moving between devices.

use std::time::Duration;

use anyhow::Result;

use murmur_core::crypto::GroupKey;
use murmur_core::{Group, GroupId, PushStatus};
use murmur_services::{DispatchError, Phase, StatusStore};

use crate::*;

/// A private-group status with a photo travels A → B intact.
#[tokio::test]
async fn private_status_with_attachment() -> Result<()> {
    let club = Group::private(GroupId::random(), "club", GroupKey::generate());
    let mut a = Device::new("a");
    let mut b = Device::new("b");
    a.join(&club);
    b.join(&club);

    let photo = a.dir.join("sunset.jpg");
    let bytes: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&photo, &bytes)?;

    let mut status = PushStatus::new(club.id, a.uid(), "a", "look at this #sunset");
    status.filename = Some("sunset.jpg".into());
    let sid = status.id;
    a.service.post(status, Some(photo))?;

    let link = connect(&a, &b).await?;
    wait_for("status on b", || b.has_status(&sid)).await?;

    let record = b.store.get(b.store.find(&sid).unwrap()).unwrap();
    assert_eq!(record.status.post, "look at this #sunset");
    assert_eq!(record.status.hop_count, 1);
    assert_eq!(record.received_from, Some(a.uid()));
    let stored = record.attachment.expect("attachment path");
    assert!(stored.starts_with(&b.dir));
    assert_eq!(std::fs::read(stored)?, bytes);

    wait_for("sent marker on a", || {
        let id = a.store.find(&sid).unwrap();
        a.store.get(id).unwrap().sent_to.contains(&b.uid())
    })
    .await?;

    link.close().await;
    a.service.shutdown().await;
    b.service.shutdown().await;
    Ok(())
}

/// Only members of a group ever see its statuses.
#[tokio::test]
async fn group_membership_gates_delivery() -> Result<()> {
    let town = Group::public(GroupId::random(), "town");
    let mut a = Device::new("a");
    let mut b = Device::new("b");
    let c = Device::new("c");
    a.join(&town);
    b.join(&town);

    let status = PushStatus::new(town.id, a.uid(), "a", "market is open #news");
    let sid = status.id;
    a.service.post(status, None)?;

    let ab = connect(&a, &b).await?;
    let ac = connect(&a, &c).await?;
    wait_for("status on b", || b.has_status(&sid)).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!c.has_status(&sid));
    assert!(a.service.candidates(&c.uid()).is_empty());

    ab.close().await;
    ac.close().await;
    a.service.shutdown().await;
    Ok(())
}

/// Scores as seen from the sender, with the built-in weights.
#[tokio::test]
async fn news_scenario_scores() -> Result<()> {
    let town = Group::public(GroupId::random(), "town");
    let mut a = Device::new("a");
    a.join(&town);

    let reader = murmur_core::Contact::new(murmur_core::UserId::random(), "reader")
        .join(town.id)
        .interested_in("news", 5);
    let stranger = murmur_core::Contact::new(murmur_core::UserId::random(), "stranger");

    let mut status = PushStatus::new(town.id, a.uid(), "a", "big story #news");
    status.like = 1;
    let id = a.service.post(status, None)?;
    let record = a.store.get(id).unwrap();

    let now = murmur_core::message::now_millis();
    let score = a.service.scoring().breakdown(&record, &reader, now);
    assert_eq!(score.relevance, 1.0);
    assert_eq!(score.density, 1.0);
    // Authored here: no copies received, so no quality signal yet.
    assert_eq!(score.quality, 0.0);
    let w = a.service.scoring().weights();
    assert!((score.total - (w.relevance + w.density)).abs() < 1e-6);

    assert_eq!(a.service.scoring().score(&record, &stranger, now), 0.0);
    a.service.shutdown().await;
    Ok(())
}

/// A status relayed A → B → C keeps counting hops and never bounces back.
#[tokio::test]
async fn relay_through_intermediate() -> Result<()> {
    let town = Group::public(GroupId::random(), "town");
    let mut a = Device::new("a");
    let mut b = Device::new("b");
    let mut c = Device::new("c");
    for d in [&mut a, &mut b, &mut c] {
        d.join(&town);
    }

    let status = PushStatus::new(town.id, a.uid(), "a", "pass it on");
    let sid = status.id;
    a.service.post(status, None)?;

    let ab = connect(&a, &b).await?;
    wait_for("status on b", || b.has_status(&sid)).await?;
    let bc = connect(&b, &c).await?;
    wait_for("status on c", || c.has_status(&sid)).await?;

    let on_c = c.store.get(c.store.find(&sid).unwrap()).unwrap();
    assert_eq!(on_c.status.hop_count, 2);
    assert_eq!(on_c.received_from, Some(b.uid()));

    // B never offers the status back to the device it came from.
    let on_b = b.store.find(&sid).unwrap();
    assert!(!b.service.candidates(&a.uid()).contains(&on_b));
    assert_eq!(a.store.get(a.store.find(&sid).unwrap()).unwrap().duplicate, 0);

    ab.close().await;
    bc.close().await;
    for d in [&a, &b, &c] {
        d.service.shutdown().await;
    }
    Ok(())
}

/// A hop limit stops relaying once reached.
#[tokio::test]
async fn hop_limit_stops_relay() -> Result<()> {
    let town = Group::public(GroupId::random(), "town");
    let mut a = Device::new("a");
    let mut b = Device::new("b");
    let mut c = Device::new("c");
    for d in [&mut a, &mut b, &mut c] {
        d.join(&town);
    }

    let mut status = PushStatus::new(town.id, a.uid(), "a", "one hop only");
    status.hop_limit = 1;
    let sid = status.id;
    a.service.post(status, None)?;

    let ab = connect(&a, &b).await?;
    wait_for("status on b", || b.has_status(&sid)).await?;
    let bc = connect(&b, &c).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!c.has_status(&sid));

    ab.close().await;
    bc.close().await;
    Ok(())
}

/// Keep-alives go through the registered channel; disconnect tears the
/// dispatcher down.
#[tokio::test]
async fn keep_alive_and_disconnect() -> Result<()> {
    let a = Device::new("a");
    let b = Device::new("b");
    assert!(matches!(
        a.service.keep_alive(&b.uid()),
        Err(DispatchError::ChannelUnavailable(_))
    ));

    let link = connect(&a, &b).await?;
    wait_for("dispatcher for b", || {
        a.service.dispatcher_phase(&b.uid()) == Some(Phase::Running)
    })
    .await?;
    a.service.keep_alive(&b.uid())?;

    a.service.contact_disconnected(&b.uid()).await;
    assert!(a.service.dispatcher_phase(&b.uid()).is_none());

    link.close().await;
    a.service.shutdown().await;
    b.service.shutdown().await;
    Ok(())
}
