//! Integration test: a linked transfer from sender to recipient through the
//! router, end to end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use linkpay_channel::{ChannelEngine, CounterpartyBehaviour, DepositBehaviour};
use linkpay_core::{AssetId, Channel, CollateralProfile, PaymentId, PreImage, ProtocolConfig, TransferStatus};
use linkpay_integration_tests::{id, Router, ROUTER};
use linkpay_transfer::{retry_with_budget, NewLinkedTransfer, ReclaimWorker, TransferError};

const P1: PaymentId = PaymentId([0x11; 32]);
const S1: PreImage = PreImage([0x22; 32]);

fn transfer(sender: &Channel, amount: u128) -> NewLinkedTransfer {
    NewLinkedTransfer {
        sender_channel: sender.clone(),
        amount,
        asset_id: AssetId::NATIVE,
        payment_id: P1,
        pre_image: S1,
        meta: Some(serde_json::json!({ "note": "coffee" })),
    }
}

// =========================================================================
// Create → resolve → reclaim
// =========================================================================

#[tokio::test]
async fn test_full_lifecycle() -> anyhow::Result<()> {
    let router = Router::new(ProtocolConfig::default());
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    let bob = router.open_funded(0xb2, "xpubBob", 0);

    // Sender locks 3 of its 10.
    let created = router.protocol.create_linked_transfer(transfer(&alice, 3)).await?;
    assert_eq!(created.status, TransferStatus::Pending);
    assert_eq!(
        created.linked_hash,
        linkpay_crypto::linked_hash(3, &AssetId::NATIVE, &P1, &S1)
    );
    assert_eq!(
        router.engine.balance_of(&alice.multisig_address, &AssetId::NATIVE, &id("xpubAlice")),
        7
    );

    // Recipient reveals the preimage; the router collateralizes bob's channel.
    let resolved = router
        .protocol
        .resolve_linked_transfer(&id("xpubBob"), &P1, &S1, 3, &AssetId::NATIVE)
        .await?;
    let receiver_app = router
        .engine
        .app_instance(&resolved.app_instance_id)
        .expect("receiver app exists");
    assert_eq!(receiver_app.multisig_address, bob.multisig_address);
    let credited: u128 = receiver_app
        .latest_state
        .coin_transfers
        .iter()
        .filter(|t| t.to == id("xpubBob"))
        .map(|t| t.amount)
        .sum();
    assert_eq!(credited, 3);

    let row = router.protocol.find_by_payment_id(&P1).await?.expect("row");
    assert_eq!(row.status, TransferStatus::Redeemed);
    assert_eq!(row.receiver_app_instance_id, Some(resolved.app_instance_id));
    assert_eq!(row.meta, Some(serde_json::json!({ "note": "coffee" })));

    // Router unlocks the sender app and takes the funds.
    let reclaimed = router.protocol.reclaim(&P1).await?;
    assert_eq!(reclaimed.status, TransferStatus::Reclaimed);
    let installed = router.engine.get_app_instances().await?;
    assert!(installed
        .iter()
        .all(|app| app.identity_hash != created.sender_app_instance_id));
    assert_eq!(
        router.engine.balance_of(&alice.multisig_address, &AssetId::NATIVE, &id(ROUTER)),
        3
    );
    assert_eq!(
        router.engine.balance_of(&alice.multisig_address, &AssetId::NATIVE, &id("xpubAlice")),
        7
    );
    Ok(())
}

#[tokio::test]
async fn test_profile_collateralizes_above_transfer_amount() -> anyhow::Result<()> {
    let config = ProtocolConfig {
        collateral_profiles: vec![CollateralProfile {
            asset_id: AssetId::NATIVE,
            amount_to_collateralize: 10,
            minimum_maintained_collateral: 2,
        }],
        ..ProtocolConfig::default()
    };
    let router = Router::new(config);
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    let bob = router.open_funded(0xb2, "xpubBob", 0);

    router.protocol.create_linked_transfer(transfer(&alice, 3)).await?;
    let resolved = router
        .protocol
        .resolve_linked_transfer(&id("xpubBob"), &P1, &S1, 3, &AssetId::NATIVE)
        .await?;

    assert_eq!(resolved.free_balance.balance_of(&id(ROUTER)), 7);
    assert_eq!(
        router.engine.balance_of(&bob.multisig_address, &AssetId::NATIVE, &id(ROUTER)),
        7
    );
    assert!(!router.protocol.collateral().needs_top_up(&bob, &AssetId::NATIVE).await?);
    Ok(())
}

#[tokio::test]
async fn test_collateral_never_arrives() -> anyhow::Result<()> {
    let config = ProtocolConfig {
        collateral_timeout_ms: 50,
        ..ProtocolConfig::default()
    };
    let router = Router::new(config);
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    let bob = router.open_funded(0xb2, "xpubBob", 0);
    router
        .engine
        .set_deposit_behaviour(bob.multisig_address, DepositBehaviour::Never);

    router.protocol.create_linked_transfer(transfer(&alice, 3)).await?;
    let err = router
        .protocol
        .resolve_linked_transfer(&id("xpubBob"), &P1, &S1, 3, &AssetId::NATIVE)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InsufficientCollateral { required: 3, .. }));
    assert!(err.is_retryable());

    let row = router.protocol.find_by_payment_id(&P1).await?.expect("row");
    assert_eq!(row.status, TransferStatus::Pending);
    assert_eq!(router.engine.events().listener_count(), 0);
    Ok(())
}

// =========================================================================
// Retry and background reclaim
// =========================================================================

#[tokio::test]
async fn test_retry_through_rejecting_counterparty() -> anyhow::Result<()> {
    let router = Router::new(ProtocolConfig::default());
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    router
        .engine
        .set_counterparty_behaviour(id("xpubAlice"), CounterpartyBehaviour::Reject("syncing".into()));

    let attempts = Arc::new(AtomicU32::new(0));
    let created = retry_with_budget(Duration::from_secs(5), Duration::from_millis(20), || {
        let attempts = attempts.clone();
        let protocol = router.protocol.clone();
        let engine = router.engine.clone();
        let request = transfer(&alice, 3);
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 2 {
                engine.set_counterparty_behaviour(id("xpubAlice"), CounterpartyBehaviour::AutoInstall);
            }
            protocol.create_linked_transfer(request).await
        }
    })
    .await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(created.status, TransferStatus::Pending);
    assert_eq!(router.engine.get_app_instances().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reclaim_worker_sweeps_redeemed() -> anyhow::Result<()> {
    let router = Router::new(ProtocolConfig::default());
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    router.open_funded(0xb2, "xpubBob", 0);

    router.protocol.create_linked_transfer(transfer(&alice, 3)).await?;
    router
        .protocol
        .resolve_linked_transfer(&id("xpubBob"), &P1, &S1, 3, &AssetId::NATIVE)
        .await?;

    let worker = Arc::new(ReclaimWorker::new(
        router.protocol.clone(),
        Duration::from_millis(20),
    ));
    worker.watch_channel(alice.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = worker.clone().spawn(shutdown_rx);

    let mut status = TransferStatus::Redeemed;
    for _ in 0..50 {
        status = router.protocol.find_by_payment_id(&P1).await?.expect("row").status;
        if status == TransferStatus::Reclaimed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TransferStatus::Reclaimed);
    assert!(router.protocol.find_reclaimable(&alice).await?.is_empty());

    shutdown_tx.send(true)?;
    handle.await?;
    Ok(())
}
