use async_trait::async_trait;
use dashmap::DashMap;
use linkpay_core::{
    AppInstanceId, AssetId, Channel, FreeBalance, MultisigAddress, PublicIdentifier,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ChannelError;
use crate::events::{EngineEvent, EventHub};
use crate::traits::ChannelEngine;
use crate::types::{
    AppAction, AppInstance, AppStatus, InstallRoute, LinkedTransferAppState, ProposeInstallParams,
};

/// How a simulated counterparty answers proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterpartyBehaviour {
    /// Install every proposal.
    AutoInstall,
    /// Reject every proposal with the given reason.
    Reject(String),
    /// Accept the proposal but never answer.
    Silent,
    /// Fail the proposal itself.
    Offline,
}

/// How collateral requests on a channel are answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositBehaviour {
    /// Credit the router and confirm after `delay`.
    Confirm { delay: Duration },
    /// Accept the request but never confirm.
    Never,
    /// Refuse the request.
    Fail,
}

impl Default for DepositBehaviour {
    fn default() -> Self {
        Self::Confirm {
            delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelRecord {
    channel: Channel,
    balances: HashMap<AssetId, FreeBalance>,
}

impl ChannelRecord {
    fn balance_of(&self, asset_id: &AssetId, party: &PublicIdentifier) -> u128 {
        self.balances
            .get(asset_id)
            .map(|fb| fb.balance_of(party))
            .unwrap_or(0)
    }

    fn credit(&mut self, asset_id: &AssetId, party: &PublicIdentifier, amount: u128) {
        let fb = self
            .balances
            .entry(*asset_id)
            .or_insert_with(|| FreeBalance::new(*asset_id));
        *fb.balances.entry(party.clone()).or_insert(0) += amount;
    }

    fn debit(
        &mut self,
        asset_id: &AssetId,
        party: &PublicIdentifier,
        amount: u128,
    ) -> Result<(), ChannelError> {
        let available = self.balance_of(asset_id, party);
        if available < amount {
            return Err(ChannelError::InsufficientFreeBalance {
                available,
                required: amount,
            });
        }
        if let Some(fb) = self.balances.get_mut(asset_id) {
            fb.balances.insert(party.clone(), available - amount);
        }
        Ok(())
    }
}

struct EngineState {
    identifier: PublicIdentifier,
    events: EventHub,
    channels: DashMap<MultisigAddress, ChannelRecord>,
    /// Always locked before `channels` when both are needed.
    apps: DashMap<AppInstanceId, AppInstance>,
    counterparties: DashMap<PublicIdentifier, CounterpartyBehaviour>,
    deposits: DashMap<MultisigAddress, DepositBehaviour>,
    nonce: AtomicU64,
}

impl EngineState {
    /// Move a proposed app to installed, locking both deposits.
    fn install_app(&self, app_instance_id: &AppInstanceId) -> Result<(), ChannelError> {
        let mut app = self
            .apps
            .get_mut(app_instance_id)
            .ok_or(ChannelError::AppNotFound(*app_instance_id))?;
        if app.status != AppStatus::Proposed {
            return Err(ChannelError::InvalidAppState(format!(
                "app {} is {:?}, not proposed",
                app_instance_id, app.status
            )));
        }

        let mut record = self
            .channels
            .get_mut(&app.multisig_address)
            .ok_or(ChannelError::ChannelNotFound(app.multisig_address))?;
        let initiator_available = record.balance_of(&app.asset_id, &app.initiator);
        let responder_available = record.balance_of(&app.asset_id, &app.responder);
        if initiator_available < app.initiator_deposit {
            return Err(ChannelError::InsufficientFreeBalance {
                available: initiator_available,
                required: app.initiator_deposit,
            });
        }
        if responder_available < app.responder_deposit {
            return Err(ChannelError::InsufficientFreeBalance {
                available: responder_available,
                required: app.responder_deposit,
            });
        }
        record.debit(&app.asset_id, &app.initiator, app.initiator_deposit)?;
        record.debit(&app.asset_id, &app.responder, app.responder_deposit)?;
        app.status = AppStatus::Installed;

        tracing::info!(
            app_instance_id = %app_instance_id,
            multisig = %app.multisig_address,
            "app installed"
        );
        Ok(())
    }

    fn reject_app(&self, app_instance_id: &AppInstanceId) {
        if let Some(mut app) = self.apps.get_mut(app_instance_id) {
            if app.status == AppStatus::Proposed {
                app.status = AppStatus::Rejected;
            }
        }
    }
}

/// Single-process channel engine.
///
/// Holds channel free balances and app instances in memory, answers
/// proposals on behalf of simulated counterparties and confirms collateral
/// deposits after a configurable delay. Completion is always reported
/// asynchronously through the event hub.
#[derive(Clone)]
pub struct InMemoryChannelEngine {
    state: Arc<EngineState>,
}

impl InMemoryChannelEngine {
    /// Create an engine acting for the router `identifier`.
    pub fn new(identifier: PublicIdentifier) -> Self {
        Self {
            state: Arc::new(EngineState {
                identifier,
                events: EventHub::new(),
                channels: DashMap::new(),
                apps: DashMap::new(),
                counterparties: DashMap::new(),
                deposits: DashMap::new(),
                nonce: AtomicU64::new(0),
            }),
        }
    }

    /// Open an empty channel between the router and `user`.
    pub fn open_channel(&self, multisig: MultisigAddress, user: PublicIdentifier) -> Channel {
        let channel = Channel::new(multisig, user);
        self.state.channels.insert(
            multisig,
            ChannelRecord {
                channel: channel.clone(),
                balances: HashMap::new(),
            },
        );
        tracing::debug!(%multisig, user = %channel.user_public_identifier, "channel opened");
        channel
    }

    /// Credit `party`'s free balance directly.
    pub fn deposit(
        &self,
        multisig: &MultisigAddress,
        party: &PublicIdentifier,
        asset_id: &AssetId,
        amount: u128,
    ) -> Result<(), ChannelError> {
        let mut record = self
            .state
            .channels
            .get_mut(multisig)
            .ok_or(ChannelError::ChannelNotFound(*multisig))?;
        record.credit(asset_id, party, amount);
        Ok(())
    }

    /// Free balance of one party, zero for unknown channels.
    pub fn balance_of(
        &self,
        multisig: &MultisigAddress,
        asset_id: &AssetId,
        party: &PublicIdentifier,
    ) -> u128 {
        self.state
            .channels
            .get(multisig)
            .map(|record| record.balance_of(asset_id, party))
            .unwrap_or(0)
    }

    pub fn set_counterparty_behaviour(
        &self,
        counterparty: PublicIdentifier,
        behaviour: CounterpartyBehaviour,
    ) {
        self.state.counterparties.insert(counterparty, behaviour);
    }

    pub fn set_deposit_behaviour(&self, multisig: MultisigAddress, behaviour: DepositBehaviour) {
        self.state.deposits.insert(multisig, behaviour);
    }

    /// Any app this engine knows about, whatever its status.
    pub fn app_instance(&self, app_instance_id: &AppInstanceId) -> Option<AppInstance> {
        self.state
            .apps
            .get(app_instance_id)
            .map(|app| app.value().clone())
    }

    /// Apps proposed to this engine's counterparties that have not been
    /// answered yet.
    pub fn pending_proposals(&self) -> Vec<AppInstanceId> {
        self.state
            .apps
            .iter()
            .filter(|app| app.status == AppStatus::Proposed)
            .map(|app| *app.key())
            .collect()
    }

    fn next_app_id(&self, multisig: &MultisigAddress, state: &LinkedTransferAppState) -> AppInstanceId {
        let nonce = self.state.nonce.fetch_add(1, Ordering::Relaxed);
        let mut data = Vec::with_capacity(20 + 8 + 32);
        data.extend_from_slice(multisig.as_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(state.payment_id.as_bytes());
        AppInstanceId(linkpay_crypto::hash(&data))
    }
}

#[async_trait]
impl ChannelEngine for InMemoryChannelEngine {
    fn public_identifier(&self) -> &PublicIdentifier {
        &self.state.identifier
    }

    fn events(&self) -> &EventHub {
        &self.state.events
    }

    async fn channel_for_user(&self, user: &PublicIdentifier) -> Result<Channel, ChannelError> {
        self.state
            .channels
            .iter()
            .find(|record| record.channel.user_public_identifier == *user)
            .map(|record| record.channel.clone())
            .ok_or_else(|| ChannelError::NoChannelForUser(user.clone()))
    }

    async fn propose_install(
        &self,
        params: ProposeInstallParams,
    ) -> Result<AppInstanceId, ChannelError> {
        let multisig = match &params.route {
            InstallRoute::Direct { multisig } => *multisig,
            InstallRoute::Virtual { intermediary } => {
                return Err(ChannelError::Unsupported(format!(
                    "virtual install via {}",
                    intermediary
                )));
            }
        };

        let counterparty = if params.initiator == self.state.identifier {
            params.responder.clone()
        } else {
            params.initiator.clone()
        };

        {
            let record = self
                .state
                .channels
                .get(&multisig)
                .ok_or(ChannelError::ChannelNotFound(multisig))?;
            if record.channel.user_public_identifier != counterparty {
                return Err(ChannelError::InvalidAppState(format!(
                    "{} is not a party to channel {}",
                    counterparty, multisig
                )));
            }

            let state = &params.initial_state;
            let outcome: u128 = state.coin_transfers.iter().map(|t| t.amount).sum();
            if outcome != params.initiator_deposit + params.responder_deposit {
                return Err(ChannelError::InvalidAppState(format!(
                    "outcome {} does not match deposits {} + {}",
                    outcome, params.initiator_deposit, params.responder_deposit
                )));
            }
            if state.asset_id != params.asset_id {
                return Err(ChannelError::InvalidAppState(
                    "state asset differs from deposit asset".into(),
                ));
            }

            let available = record.balance_of(&params.asset_id, &params.initiator);
            if available < params.initiator_deposit {
                return Err(ChannelError::InsufficientFreeBalance {
                    available,
                    required: params.initiator_deposit,
                });
            }
        }

        let behaviour = self
            .state
            .counterparties
            .get(&counterparty)
            .map(|b| b.value().clone())
            .unwrap_or(CounterpartyBehaviour::AutoInstall);
        if behaviour == CounterpartyBehaviour::Offline {
            return Err(ChannelError::Unreachable(counterparty.to_string()));
        }

        let app_instance_id = self.next_app_id(&multisig, &params.initial_state);
        self.state.apps.insert(
            app_instance_id,
            AppInstance {
                identity_hash: app_instance_id,
                multisig_address: multisig,
                app: params.app,
                initiator: params.initiator,
                responder: params.responder,
                initiator_deposit: params.initiator_deposit,
                responder_deposit: params.responder_deposit,
                asset_id: params.asset_id,
                latest_state: params.initial_state,
                status: AppStatus::Proposed,
            },
        );
        tracing::debug!(%app_instance_id, %multisig, %counterparty, "app proposed");

        let state = self.state.clone();
        match behaviour {
            CounterpartyBehaviour::AutoInstall => {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    match state.install_app(&app_instance_id) {
                        Ok(()) => {
                            state.events.emit(EngineEvent::Install { app_instance_id });
                        }
                        Err(e) => {
                            state.reject_app(&app_instance_id);
                            state.events.emit(EngineEvent::RejectInstall {
                                app_instance_id,
                                reason: e.to_string(),
                            });
                        }
                    }
                });
            }
            CounterpartyBehaviour::Reject(reason) => {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    state.reject_app(&app_instance_id);
                    state.events.emit(EngineEvent::RejectInstall {
                        app_instance_id,
                        reason,
                    });
                });
            }
            CounterpartyBehaviour::Silent | CounterpartyBehaviour::Offline => {}
        }

        Ok(app_instance_id)
    }

    async fn install(&self, app_instance_id: &AppInstanceId) -> Result<(), ChannelError> {
        self.state.install_app(app_instance_id)?;
        self.state.events.emit(EngineEvent::Install {
            app_instance_id: *app_instance_id,
        });
        Ok(())
    }

    async fn uninstall(&self, app_instance_id: &AppInstanceId) -> Result<(), ChannelError> {
        let mut app = self
            .state
            .apps
            .get_mut(app_instance_id)
            .ok_or(ChannelError::AppNotFound(*app_instance_id))?;
        if app.status != AppStatus::Installed {
            return Err(ChannelError::InvalidAppState(format!(
                "app {} is {:?}, not installed",
                app_instance_id, app.status
            )));
        }
        let mut record = self
            .state
            .channels
            .get_mut(&app.multisig_address)
            .ok_or(ChannelError::ChannelNotFound(app.multisig_address))?;
        for transfer in &app.latest_state.coin_transfers {
            record.credit(&app.asset_id, &transfer.to, transfer.amount);
        }
        app.status = AppStatus::Uninstalled;

        tracing::info!(%app_instance_id, multisig = %app.multisig_address, "app uninstalled");
        Ok(())
    }

    async fn take_action(
        &self,
        app_instance_id: &AppInstanceId,
        action: AppAction,
    ) -> Result<LinkedTransferAppState, ChannelError> {
        let mut app = self
            .state
            .apps
            .get_mut(app_instance_id)
            .ok_or(ChannelError::AppNotFound(*app_instance_id))?;
        if app.status != AppStatus::Installed {
            return Err(ChannelError::InvalidAppState(format!(
                "app {} is {:?}, not installed",
                app_instance_id, app.status
            )));
        }

        let state = &app.latest_state;
        if state.is_unlocked() {
            return Err(ChannelError::InvalidAction("app already unlocked".into()));
        }
        let matches = linkpay_crypto::verify_linked_hash(
            &state.linked_hash,
            state.amount,
            &state.asset_id,
            &state.payment_id,
            &action.pre_image,
        );
        if !matches {
            return Err(ChannelError::InvalidAction(
                "preimage does not match linked hash".into(),
            ));
        }

        let next = state.unlocked(action.pre_image);
        app.latest_state = next.clone();
        tracing::debug!(%app_instance_id, "app action applied");
        Ok(next)
    }

    async fn get_app_instances(&self) -> Result<Vec<AppInstance>, ChannelError> {
        Ok(self
            .state
            .apps
            .iter()
            .filter(|app| app.status == AppStatus::Installed)
            .map(|app| app.value().clone())
            .collect())
    }

    async fn get_free_balance(
        &self,
        multisig: &MultisigAddress,
        asset_id: &AssetId,
    ) -> Result<FreeBalance, ChannelError> {
        let record = self
            .state
            .channels
            .get(multisig)
            .ok_or(ChannelError::ChannelNotFound(*multisig))?;
        let balance = record
            .balances
            .get(asset_id)
            .cloned()
            .unwrap_or_else(|| FreeBalance::new(*asset_id));
        Ok(balance)
    }

    async fn request_collateral(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        amount: u128,
    ) -> Result<(), ChannelError> {
        let multisig = channel.multisig_address;
        if !self.state.channels.contains_key(&multisig) {
            return Err(ChannelError::ChannelNotFound(multisig));
        }
        let behaviour = self
            .state
            .deposits
            .get(&multisig)
            .map(|b| b.value().clone())
            .unwrap_or_default();

        tracing::info!(%multisig, asset_id = %asset_id, amount, "collateral requested");
        match behaviour {
            DepositBehaviour::Fail => Err(ChannelError::Other(format!(
                "deposit into {} refused",
                multisig
            ))),
            DepositBehaviour::Never => Ok(()),
            DepositBehaviour::Confirm { delay } => {
                let state = self.state.clone();
                let asset_id = *asset_id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let router = state.identifier.clone();
                    if let Some(mut record) = state.channels.get_mut(&multisig) {
                        record.credit(&asset_id, &router, amount);
                    } else {
                        return;
                    }
                    state.events.emit(EngineEvent::DepositConfirmed {
                        multisig,
                        from: router,
                        asset_id,
                    });
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::types::AppDefinition;
    use linkpay_core::{PaymentId, PreImage};

    fn id(s: &str) -> PublicIdentifier {
        PublicIdentifier::parse(s).unwrap()
    }

    fn setup() -> (InMemoryChannelEngine, Channel) {
        let engine = InMemoryChannelEngine::new(id("xpubRouter"));
        let channel = engine.open_channel(MultisigAddress([0xa1; 20]), id("xpubAlice"));
        engine
            .deposit(&channel.multisig_address, &id("xpubAlice"), &AssetId::NATIVE, 10)
            .unwrap();
        (engine, channel)
    }

    fn sender_params(channel: &Channel, amount: u128, pre_image: &PreImage) -> ProposeInstallParams {
        let payment_id = PaymentId([7; 32]);
        let hash = linkpay_crypto::linked_hash(amount, &AssetId::NATIVE, &payment_id, pre_image);
        ProposeInstallParams {
            app: AppDefinition::SimpleLinkedTransfer,
            route: InstallRoute::Direct {
                multisig: channel.multisig_address,
            },
            initiator: channel.user_public_identifier.clone(),
            responder: id("xpubRouter"),
            initial_state: LinkedTransferAppState::locked(
                amount,
                AssetId::NATIVE,
                channel.user_public_identifier.clone(),
                id("xpubRouter"),
                hash,
                payment_id,
            ),
            initiator_deposit: amount,
            responder_deposit: 0,
            asset_id: AssetId::NATIVE,
            meta: None,
        }
    }

    #[tokio::test]
    async fn test_propose_auto_installs_and_locks_deposit() {
        let (engine, channel) = setup();
        let mut installs = engine.events().subscribe(EventKind::Install);

        let app_id = engine
            .propose_install(sender_params(&channel, 3, &PreImage([1; 32])))
            .await
            .unwrap();
        let event = installs.recv().await.unwrap();
        assert_eq!(event, EngineEvent::Install { app_instance_id: app_id });

        let apps = engine.get_app_instances().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].identity_hash, app_id);
        assert_eq!(
            engine.balance_of(&channel.multisig_address, &AssetId::NATIVE, &id("xpubAlice")),
            7
        );
    }

    #[tokio::test]
    async fn test_rejecting_counterparty() {
        let (engine, channel) = setup();
        engine.set_counterparty_behaviour(id("xpubAlice"), CounterpartyBehaviour::Reject("no".into()));
        let mut rejects = engine.events().subscribe(EventKind::RejectInstall);

        let app_id = engine
            .propose_install(sender_params(&channel, 3, &PreImage([1; 32])))
            .await
            .unwrap();
        let event = rejects.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::RejectInstall {
                app_instance_id: app_id,
                reason: "no".into()
            }
        );
        assert_eq!(engine.app_instance(&app_id).unwrap().status, AppStatus::Rejected);
        assert!(engine.get_app_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_counterparty_fails_proposal() {
        let (engine, channel) = setup();
        engine.set_counterparty_behaviour(id("xpubAlice"), CounterpartyBehaviour::Offline);
        let err = engine
            .propose_install(sender_params(&channel, 3, &PreImage([1; 32])))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_proposal_over_free_balance() {
        let (engine, channel) = setup();
        let err = engine
            .propose_install(sender_params(&channel, 11, &PreImage([1; 32])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::InsufficientFreeBalance {
                available: 10,
                required: 11
            }
        ));
    }

    #[tokio::test]
    async fn test_virtual_route_unsupported() {
        let (engine, channel) = setup();
        let mut params = sender_params(&channel, 3, &PreImage([1; 32]));
        params.route = InstallRoute::Virtual {
            intermediary: id("xpubHub"),
        };
        let err = engine.propose_install(params).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_take_action_then_uninstall_pays_router() {
        let (engine, channel) = setup();
        engine.set_counterparty_behaviour(id("xpubAlice"), CounterpartyBehaviour::Silent);
        let pre_image = PreImage([1; 32]);
        let app_id = engine
            .propose_install(sender_params(&channel, 3, &pre_image))
            .await
            .unwrap();
        engine.install(&app_id).await.unwrap();

        let wrong = engine
            .take_action(&app_id, AppAction { pre_image: PreImage([2; 32]) })
            .await;
        assert!(matches!(wrong, Err(ChannelError::InvalidAction(_))));

        let state = engine
            .take_action(&app_id, AppAction { pre_image })
            .await
            .unwrap();
        assert!(state.is_unlocked());

        engine.uninstall(&app_id).await.unwrap();
        let multisig = channel.multisig_address;
        assert_eq!(engine.balance_of(&multisig, &AssetId::NATIVE, &id("xpubRouter")), 3);
        assert_eq!(engine.balance_of(&multisig, &AssetId::NATIVE, &id("xpubAlice")), 7);
        assert!(engine.uninstall(&app_id).await.is_err());
    }

    #[tokio::test]
    async fn test_request_collateral_confirms() {
        let (engine, channel) = setup();
        let mut deposits = engine.events().subscribe(EventKind::DepositConfirmed);

        engine
            .request_collateral(&channel, &AssetId::NATIVE, 5)
            .await
            .unwrap();
        let event = deposits.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::DepositConfirmed {
                multisig: channel.multisig_address,
                from: id("xpubRouter"),
                asset_id: AssetId::NATIVE,
            }
        );
        let fb = engine
            .get_free_balance(&channel.multisig_address, &AssetId::NATIVE)
            .await
            .unwrap();
        assert_eq!(fb.balance_of(&id("xpubRouter")), 5);
    }

    #[tokio::test]
    async fn test_request_collateral_refused() {
        let (engine, channel) = setup();
        engine.set_deposit_behaviour(channel.multisig_address, DepositBehaviour::Fail);
        assert!(engine
            .request_collateral(&channel, &AssetId::NATIVE, 5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_channel_for_user() {
        let (engine, channel) = setup();
        assert_eq!(engine.channel_for_user(&id("xpubAlice")).await.unwrap(), channel);
        let err = engine.channel_for_user(&id("xpubNobody")).await.unwrap_err();
        assert!(matches!(err, ChannelError::NoChannelForUser(_)));
    }

    #[tokio::test]
    async fn test_silent_counterparty_leaves_proposal_pending() {
        let (engine, channel) = setup();
        engine.set_counterparty_behaviour(id("xpubAlice"), CounterpartyBehaviour::Silent);
        let app_id = engine
            .propose_install(sender_params(&channel, 3, &PreImage([1; 32])))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(engine.pending_proposals(), vec![app_id]);
        assert!(engine.get_app_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let engine = InMemoryChannelEngine::new(id("xpubRouter"));
        let err = engine
            .get_free_balance(&MultisigAddress([9; 20]), &AssetId::NATIVE)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelNotFound(_)));
    }
}
