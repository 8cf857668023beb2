// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::todo,
    clippy::unimplemented
)]

//! Aktivierungstreiber des lokal konfigurierten Operators: externe Adresse
//! feststellen, Collateral sichern, Announce veröffentlichen und danach im
//! Heartbeat-Takt bleiben.

use sn_chain::{ChainError, ChainView, UtxoQuery};
use sn_crypto::OperatorKeypair;
use sn_p2p::PeerInfo;
use sn_registry::{
    Admission, LocalOperator, OperatorRecord, OperatorRegistry, SyncFlags, MIN_MNP_SECONDS,
};
use sn_types::{
    Amount, Announce, Heartbeat, NetAddress, OperatorState, OutPoint, PubKeyBytes, SigBytes, TxIn,
    PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

pub const HEARTBEAT_BLOCK_DEPTH: i32 = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveState {
    Initial,
    SyncInProcess,
    InputTooNew,
    NotCapable,
    Started,
}

impl ActiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::SyncInProcess => "SYNC_IN_PROCESS",
            Self::InputTooNew => "INPUT_TOO_NEW",
            Self::NotCapable => "NOT_CAPABLE",
            Self::Started => "STARTED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveType {
    Unknown,
    Remote,
    Local,
}

impl ActiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Remote => "REMOTE",
            Self::Local => "LOCAL",
        }
    }
}

/// Collateral-Quelle aus der Wallet.
#[derive(Clone, Debug)]
pub struct CollateralSource {
    pub vin: TxIn,
    pub pk_collateral: PubKeyBytes,
    pub key_collateral: OperatorKeypair,
}

/// Wallet-Mitarbeiter; Schlüsselhaltung und Coin-Auswahl bleiben draußen.
pub trait WalletAccess {
    fn is_available(&self) -> bool;
    fn is_locked(&self) -> bool;
    fn balance(&self) -> Amount;
    fn collateral_source(&mut self) -> Option<CollateralSource>;
    fn lock_coin(&mut self, outpoint: &OutPoint);
}

/// Netz-Mitarbeiter für Adress-Erkennung und Erreichbarkeitsprobe.
pub trait NetProbe {
    /// konfigurierte oder lokal erkannte Adresse
    fn local_address(&self) -> Option<NetAddress>;
    /// von einem Peer gespiegelte eigene Adresse
    fn reflected_address(&self, peer: &NetAddress) -> Option<NetAddress>;
    /// eingehende Verbindung zu uns selbst möglich?
    fn can_connect(&self, addr: &NetAddress) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActiveStep {
    RelayHeartbeat(Heartbeat),
}

pub struct ActiveOperator {
    keypair: OperatorKeypair,
    state: ActiveState,
    ty: ActiveType,
    pinger_enabled: bool,
    vin: TxIn,
    service: NetAddress,
    not_capable_reason: String,
}

impl ActiveOperator {
    pub fn new(keypair: OperatorKeypair) -> Self {
        Self {
            keypair,
            state: ActiveState::Initial,
            ty: ActiveType::Unknown,
            pinger_enabled: false,
            vin: TxIn::default(),
            service: NetAddress::default(),
            not_capable_reason: String::new(),
        }
    }

    pub fn state(&self) -> ActiveState {
        self.state
    }

    pub fn active_type(&self) -> ActiveType {
        self.ty
    }

    pub fn vin(&self) -> &TxIn {
        &self.vin
    }

    pub fn service(&self) -> NetAddress {
        self.service
    }

    pub fn operator_key(&self) -> PubKeyBytes {
        PubKeyBytes::from_keypair(&self.keypair)
    }

    pub fn get_status(&self) -> String {
        match self.state {
            ActiveState::Initial => "Node just started, not yet activated".to_string(),
            ActiveState::SyncInProcess => {
                "Sync in progress. Must wait until sync is complete to start operator".to_string()
            }
            ActiveState::InputTooNew => self.not_capable_reason.clone(),
            ActiveState::NotCapable => {
                format!("Not capable operator: {}", self.not_capable_reason)
            }
            ActiveState::Started => "Operator successfully started".to_string(),
        }
    }

    fn not_capable(&mut self, reason: String) {
        self.state = ActiveState::NotCapable;
        warn!(state = self.state.as_str(), "{reason}");
        self.not_capable_reason = reason;
    }

    /// Ein Verwaltungsdurchlauf. Liefert auszusendende Heartbeats; Announces
    /// laufen als Relay-Events durch das Register.
    #[allow(clippy::too_many_arguments)]
    pub fn manage_state(
        &mut self,
        chain: &dyn ChainView,
        registry: &mut OperatorRegistry,
        wallet: &mut dyn WalletAccess,
        probe: &dyn NetProbe,
        peers: &[PeerInfo],
        sync: SyncFlags,
        now: i64,
    ) -> Vec<ActiveStep> {
        debug!(
            state = self.state.as_str(),
            ty = self.ty.as_str(),
            pinger = self.pinger_enabled,
            "manage state"
        );

        let params = registry.options().params.clone();
        if !params.is_regtest() && !sync.blockchain_synced {
            self.state = ActiveState::SyncInProcess;
            info!(state = self.state.as_str(), "{}", self.get_status());
            return Vec::new();
        }
        if self.state == ActiveState::SyncInProcess {
            self.state = ActiveState::Initial;
        }

        if self.ty == ActiveType::Unknown {
            self.manage_state_initial(chain, registry, wallet, probe, peers, now, sync);
        }
        match self.ty {
            ActiveType::Remote => {
                self.manage_state_remote(chain, registry, now, sync);
            }
            ActiveType::Local => {
                // Remote-Start zuerst: ein bereits bekannter Eintrag erspart
                // den neuen Announce
                self.manage_state_remote(chain, registry, now, sync);
                if self.state != ActiveState::Started {
                    self.manage_state_local(chain, registry, wallet, now, sync);
                }
            }
            ActiveType::Unknown => {}
        }

        match self.send_heartbeat(chain, registry, now) {
            Some(step) => vec![step],
            None => Vec::new(),
        }
    }

    fn manage_state_initial(
        &mut self,
        chain: &dyn ChainView,
        registry: &mut OperatorRegistry,
        wallet: &mut dyn WalletAccess,
        probe: &dyn NetProbe,
        peers: &[PeerInfo],
        _now: i64,
        _sync: SyncFlags,
    ) {
        let params = registry.options().params.clone();

        // zuerst die konfigurierte bzw. lokal erkannte Adresse
        let mut found = probe
            .local_address()
            .filter(|a| params.is_valid_operator_addr(a));
        if found.is_none() {
            if peers.is_empty() {
                self.not_capable(
                    "Can't detect valid external address. Will retry when there are some connections available."
                        .to_string(),
                );
                return;
            }
            // danach die von Peers gespiegelte Adresse
            for peer in peers {
                if let Some(addr) = probe.reflected_address(&peer.addr) {
                    if params.is_valid_operator_addr(&addr) {
                        found = Some(addr);
                        break;
                    }
                }
            }
        }
        let Some(service) = found else {
            self.not_capable(
                "Can't detect valid external address. Please consider using the externaladdr configuration option if problem persists."
                    .to_string(),
            );
            return;
        };

        if !params.is_valid_operator_port(service.port) {
            if params.is_main() {
                self.not_capable(format!(
                    "Invalid port: {} - only {} is supported on mainnet.",
                    service.port, params.default_port
                ));
            } else {
                self.not_capable(format!(
                    "Invalid port: {} - {} is only supported on mainnet.",
                    service.port,
                    sn_types::ChainParams::main().default_port
                ));
            }
            return;
        }

        info!(addr = %service, "checking inbound connection to self");
        if !probe.can_connect(&service) {
            self.not_capable(format!("Could not connect to {service}"));
            return;
        }
        self.service = service;

        // ohne weitere Informationen gehen wir von Fernstart aus
        self.ty = ActiveType::Remote;

        if !wallet.is_available() {
            info!("wallet not available");
            return;
        }
        if wallet.is_locked() {
            info!("wallet is locked");
            return;
        }
        if wallet.balance() < params.collateral {
            info!("wallet balance below collateral denomination");
            return;
        }
        if wallet.collateral_source().is_some() {
            self.ty = ActiveType::Local;
        }
        debug!(ty = self.ty.as_str(), "initial state resolved");
    }

    fn manage_state_remote(
        &mut self,
        chain: &dyn ChainView,
        registry: &mut OperatorRegistry,
        now: i64,
        sync: SyncFlags,
    ) {
        let pk = self.operator_key();
        registry.force_check_by_operator_key(&pk, chain, now, sync);

        let Some(info) = registry.get_info_by_operator_key(&pk) else {
            self.not_capable("Operator not in operator list".to_string());
            return;
        };
        if info.protocol_version != PROTOCOL_VERSION {
            self.not_capable("Invalid protocol version".to_string());
            return;
        }
        if self.service != info.addr {
            self.not_capable(
                "Broadcasted address doesn't match our external address. Make sure you issued a new announce if the address of this operator changed recently."
                    .to_string(),
            );
            return;
        }
        if !OperatorRecord::is_valid_state_for_auto_start(info.state) {
            self.not_capable(format!("Operator in {} state", info.state));
            return;
        }
        if self.state != ActiveState::Started {
            info!("remote activation confirmed, STARTED");
            self.vin = info.vin.clone();
            self.service = info.addr;
            self.pinger_enabled = true;
            self.state = ActiveState::Started;
            registry.set_local_operator(LocalOperator {
                vin: self.vin.clone(),
                service: self.service,
                keypair: self.keypair.clone(),
            });
        }
    }

    fn manage_state_local(
        &mut self,
        chain: &dyn ChainView,
        registry: &mut OperatorRegistry,
        wallet: &mut dyn WalletAccess,
        now: i64,
        sync: SyncFlags,
    ) {
        if self.state == ActiveState::Started {
            return;
        }
        let Some(source) = wallet.collateral_source() else {
            return;
        };
        let params = registry.options().params.clone();

        let confirmations = match chain.utxo(&source.vin.prev_out) {
            Ok(UtxoQuery::Active(utxo)) => match chain.height() {
                Ok(tip) => tip - utxo.height + 1,
                Err(_) => return,
            },
            Ok(_) => {
                self.not_capable("Collateral outpoint not found in the UTXO set".to_string());
                return;
            }
            Err(ChainError::Busy) => return,
            Err(_) => return,
        };
        if confirmations < params.min_confirmations {
            self.state = ActiveState::InputTooNew;
            self.not_capable_reason = format!(
                "Operator input must have at least {} confirmations - {} present",
                params.min_confirmations, confirmations
            );
            warn!("{}", self.not_capable_reason);
            return;
        }

        wallet.lock_coin(&source.vin.prev_out);

        let Some(mnb) = self.create_announce(&source, chain, now) else {
            self.not_capable("Error creating operator announce".to_string());
            return;
        };

        info!(operator = %source.vin.prev_out, "publishing own announce");
        match registry.submit_announce(mnb, None, chain, now, sync) {
            Admission::Accepted { .. } | Admission::AlreadyKnown => {
                self.vin = source.vin;
                self.pinger_enabled = true;
                self.state = ActiveState::Started;
                registry.set_local_operator(LocalOperator {
                    vin: self.vin.clone(),
                    service: self.service,
                    keypair: self.keypair.clone(),
                });
            }
            other => {
                self.not_capable(format!("Own announce was not accepted: {other:?}"));
            }
        }
    }

    fn create_announce(
        &self,
        source: &CollateralSource,
        chain: &dyn ChainView,
        now: i64,
    ) -> Option<Announce> {
        let tip = chain.tip().ok()?;
        if tip.height < HEARTBEAT_BLOCK_DEPTH {
            return None;
        }
        let block_hash = chain.block_hash(tip.height - HEARTBEAT_BLOCK_DEPTH).ok()?;
        let mut hb = Heartbeat::new(source.vin.clone(), block_hash, now);
        hb.sign(&self.keypair, now);

        let mut mnb = Announce {
            vin: source.vin.clone(),
            addr: self.service,
            pk_collateral: source.pk_collateral.clone(),
            pk_operator: self.operator_key(),
            sig: SigBytes::default(),
            sig_time: now,
            protocol_version: PROTOCOL_VERSION,
            last_heartbeat: hb,
            active_state: OperatorState::PreEnabled,
            recovery: false,
        };
        mnb.sign(&source.key_collateral, now);
        if !mnb.verify_sig() {
            return None;
        }
        Some(mnb)
    }

    /// Heartbeat im MIN_MNP-Takt; zu frühe Versuche werden verworfen.
    fn send_heartbeat(
        &mut self,
        chain: &dyn ChainView,
        registry: &mut OperatorRegistry,
        now: i64,
    ) -> Option<ActiveStep> {
        if !self.pinger_enabled {
            debug!("pinger disabled, skipping heartbeat");
            return None;
        }
        if !registry.has(&self.vin.prev_out) {
            self.not_capable("Operator not in operator list".to_string());
            return None;
        }

        let tip = chain.tip().ok()?;
        if tip.height < HEARTBEAT_BLOCK_DEPTH {
            return None;
        }
        let block_hash = chain.block_hash(tip.height - HEARTBEAT_BLOCK_DEPTH).ok()?;
        let mut hb = Heartbeat::new(self.vin.clone(), block_hash, now);
        hb.sign(&self.keypair, now);

        if registry.heartbeat_within(&self.vin.prev_out, MIN_MNP_SECONDS, hb.sig_time) {
            debug!("too early to send a heartbeat");
            return None;
        }

        registry.set_last_heartbeat(&self.vin.prev_out, hb.clone());
        info!(operator = %self.vin.prev_out, "relaying own heartbeat");
        Some(ActiveStep::RelayHeartbeat(hb))
    }
}

// ============================
// Test-Doubles für Wallet und Netzprobe
// ============================

/// Statische Netzprobe (Tests und Demo-Betrieb).
pub struct StaticProbe {
    pub local: Option<NetAddress>,
    pub reflected: Option<NetAddress>,
    pub reachable: bool,
}

impl NetProbe for StaticProbe {
    fn local_address(&self) -> Option<NetAddress> {
        self.local
    }
    fn reflected_address(&self, _peer: &NetAddress) -> Option<NetAddress> {
        self.reflected
    }
    fn can_connect(&self, _addr: &NetAddress) -> bool {
        self.reachable
    }
}

/// In-Memory-Wallet (Tests und Demo-Betrieb).
pub struct MemoryWallet {
    pub available: bool,
    pub locked: bool,
    pub balance: Amount,
    pub source: Option<CollateralSource>,
    pub locked_coins: Vec<OutPoint>,
}

impl MemoryWallet {
    pub fn empty() -> Self {
        Self {
            available: true,
            locked: false,
            balance: 0,
            source: None,
            locked_coins: Vec::new(),
        }
    }

    pub fn with_collateral(balance: Amount, source: CollateralSource) -> Self {
        Self {
            available: true,
            locked: false,
            balance,
            source: Some(source),
            locked_coins: Vec::new(),
        }
    }
}

impl WalletAccess for MemoryWallet {
    fn is_available(&self) -> bool {
        self.available
    }
    fn is_locked(&self) -> bool {
        self.locked
    }
    fn balance(&self) -> Amount {
        self.balance
    }
    fn collateral_source(&mut self) -> Option<CollateralSource> {
        self.source.clone()
    }
    fn lock_coin(&mut self, outpoint: &OutPoint) {
        if !self.locked_coins.contains(outpoint) {
            self.locked_coins.push(*outpoint);
        }
    }
}
