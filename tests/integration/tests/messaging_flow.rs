//! Integration test: clients talking to the router over the message bus,
//! and concurrent redemption attempts.

use std::time::Duration;

use linkpay_channel::{ChannelError, MessageBus};
use linkpay_core::{AssetId, Channel, LinkedTransfer, PaymentId, PreImage, ProtocolConfig, TransferStatus};
use linkpay_crypto::{decrypt_preimage, EncryptedPayload, RecipientKeyPair};
use linkpay_integration_tests::{id, Router};
use linkpay_transfer::{
    send_async_subject, subject, NewLinkedTransfer, ResolvedTransfer, SendAsyncNotice,
    GET_PENDING_PREFIX, LOCK_ACQUIRE_PREFIX, LOCK_RELEASE_PREFIX, RESOLVE_LINKED_PREFIX,
};
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(5);

fn transfer(sender: &Channel, payment: u8, amount: u128) -> NewLinkedTransfer {
    NewLinkedTransfer {
        sender_channel: sender.clone(),
        amount,
        asset_id: AssetId::NATIVE,
        payment_id: PaymentId([payment; 32]),
        pre_image: PreImage([payment.wrapping_add(0x40); 32]),
        meta: None,
    }
}

// =========================================================================
// Designated recipient over the bus
// =========================================================================

#[tokio::test]
async fn test_send_async_then_resolve_over_bus() -> anyhow::Result<()> {
    let router = Router::new(ProtocolConfig::default());
    router.serve().await?;
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    router.open_funded(0xb2, "xpubBob", 0);

    let bob_keys = RecipientKeyPair::generate();
    let mut inbox = router.bus.subscribe(&send_async_subject(&id("xpubBob"))).await?;

    router
        .protocol
        .create_linked_transfer_to_recipient(transfer(&alice, 1, 4), id("xpubBob"), &bob_keys.public_key())
        .await?;

    // Bob learns about the transfer and decrypts the preimage.
    let message = inbox.recv().await.expect("send-async notice");
    let notice: SendAsyncNotice = serde_json::from_value(message.payload)?;
    assert_eq!(notice.amount, "4");
    let pre_image = decrypt_preimage(&EncryptedPayload::from_hex(&notice.encrypted_pre_image)?, &bob_keys)?;

    let pending = router
        .bus
        .request(&subject(GET_PENDING_PREFIX, "xpubBob"), Value::Null, TIMEOUT)
        .await?;
    let pending: Vec<LinkedTransfer> = serde_json::from_value(pending)?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payment_id, notice.payment_id);

    let reply = router
        .bus
        .request(
            &subject(RESOLVE_LINKED_PREFIX, "xpubBob"),
            json!({
                "paymentId": notice.payment_id.to_hex(),
                "preImage": pre_image.to_hex(),
                "amount": notice.amount,
                "assetId": notice.asset_id.to_hex(),
            }),
            TIMEOUT,
        )
        .await?;
    let resolved: ResolvedTransfer = serde_json::from_value(reply)?;
    let row = router
        .protocol
        .find_by_payment_id(&notice.payment_id)
        .await?
        .expect("row");
    assert_eq!(row.status, TransferStatus::Redeemed);
    assert_eq!(row.receiver_app_instance_id, Some(resolved.app_instance_id));

    let pending = router
        .bus
        .request(&subject(GET_PENDING_PREFIX, "xpubBob"), Value::Null, TIMEOUT)
        .await?;
    assert_eq!(pending, json!([]));
    Ok(())
}

#[tokio::test]
async fn test_other_recipient_cannot_redeem_designated_transfer() -> anyhow::Result<()> {
    let router = Router::new(ProtocolConfig::default());
    router.serve().await?;
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    router.open_funded(0xb2, "xpubBob", 0);
    router.open_funded(0xc3, "xpubCarol", 0);

    let bob_keys = RecipientKeyPair::generate();
    router
        .protocol
        .create_linked_transfer_to_recipient(transfer(&alice, 1, 4), id("xpubBob"), &bob_keys.public_key())
        .await?;

    let err = router
        .bus
        .request(
            &subject(RESOLVE_LINKED_PREFIX, "xpubCarol"),
            json!({
                "paymentId": PaymentId([1; 32]).to_hex(),
                "preImage": PreImage([0x41; 32]).to_hex(),
                "amount": "4",
                "assetId": AssetId::NATIVE.to_hex(),
            }),
            TIMEOUT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Remote(_)));

    let row = router
        .protocol
        .find_by_payment_id(&PaymentId([1; 32]))
        .await?
        .expect("row");
    assert_eq!(row.status, TransferStatus::Pending);
    Ok(())
}

// =========================================================================
// Locks held by external clients
// =========================================================================

#[tokio::test]
async fn test_client_lock_blocks_protocol_until_released() -> anyhow::Result<()> {
    let config = ProtocolConfig {
        lock_acquire_timeout_ms: 2_000,
        ..ProtocolConfig::default()
    };
    let router = Router::new(config);
    router.serve().await?;
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    let multisig = alice.multisig_address.to_hex();

    let token = router
        .bus
        .request(&subject(LOCK_ACQUIRE_PREFIX, &multisig), json!({ "lockTTL": 10_000 }), TIMEOUT)
        .await?;

    let create = {
        let protocol = router.protocol.clone();
        let request = transfer(&alice, 1, 3);
        tokio::spawn(async move { protocol.create_linked_transfer(request).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!create.is_finished());

    let released = router
        .bus
        .request(&subject(LOCK_RELEASE_PREFIX, &multisig), json!({ "lockValue": token }), TIMEOUT)
        .await?;
    assert_eq!(released, Value::Bool(true));

    let created = create.await??;
    assert_eq!(created.status, TransferStatus::Pending);
    Ok(())
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test]
async fn test_parallel_transfers_from_one_sender() -> anyhow::Result<()> {
    let router = Router::new(ProtocolConfig::default());
    let alice = router.open_funded(0xa1, "xpubAlice", 10);
    router.open_funded(0xb2, "xpubBob", 0);

    // Four transfers of 3 against a balance of 10: three fit.
    let mut handles = Vec::new();
    for payment in 1..=4u8 {
        let protocol = router.protocol.clone();
        let request = transfer(&alice, payment, 3);
        handles.push(tokio::spawn(async move { protocol.create_linked_transfer(request).await }));
    }
    let mut created = Vec::new();
    for handle in handles {
        if let Ok(transfer) = handle.await? {
            created.push(transfer);
        }
    }
    assert_eq!(created.len(), 3);
    assert_eq!(
        router.engine.balance_of(&alice.multisig_address, &AssetId::NATIVE, &id("xpubAlice")),
        1
    );

    let mut handles = Vec::new();
    for transfer in &created {
        for _ in 0..2 {
            let protocol = router.protocol.clone();
            let payment_id = transfer.payment_id;
            let pre_image = PreImage([payment_id.0[0].wrapping_add(0x40); 32]);
            handles.push(tokio::spawn(async move {
                protocol
                    .resolve_linked_transfer(&id("xpubBob"), &payment_id, &pre_image, 3, &AssetId::NATIVE)
                    .await
            }));
        }
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, created.len());

    for transfer in &created {
        let row = router
            .protocol
            .find_by_payment_id(&transfer.payment_id)
            .await?
            .expect("row");
        assert_eq!(row.status, TransferStatus::Redeemed);
    }
    assert_eq!(router.protocol.find_reclaimable(&alice).await?.len(), 3);
    Ok(())
}
