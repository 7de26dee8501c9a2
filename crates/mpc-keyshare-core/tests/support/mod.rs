//! Shared fakes for the test suite

#![allow(dead_code)]

use async_trait::async_trait;
use mpc_keyshare_core::{
    engine::{
        EngineError, EngineSession, KeyMaterial, LoopbackCosigner, LoopbackEngine,
        ProtocolEngine, RoundOutcome, SignatureOutput,
    },
    storage::{
        KeyShareStore, MemorySecureStorage, PresenceGate, PresenceOutcome, Protection,
        SecureStorage, StorageStatus,
    },
    Algorithm, Error, KeyShare, MpcWallet, ProtocolMessage, SessionId, SessionManager,
    SessionManagerConfig, Transport, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use zeroize::Zeroizing;

pub const SCRIPTED_PUBLIC_KEY: &str =
    "02a1633cafcc01ebfb6d78e39f687a1f0995c62fc95f51ead10a02ee0be551b5dc";

// ============================================================================
// Scripted engine
// ============================================================================

/// Engine that finishes after a fixed number of rounds without any crypto
///
/// Every outbound payload is `[round]`. A reject round makes `process` fail
/// with `EngineError::Rejected` at that round.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    pub rounds: u32,
    pub reject_round: Option<u32>,
    pub releases: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds,
            ..Self::default()
        }
    }

    pub fn rejecting_at(mut self, round: u32) -> Self {
        self.reject_round = Some(round);
        self
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn session<T: Send + 'static>(
        &self,
        finish: impl Fn() -> T + Send + 'static,
    ) -> Box<dyn EngineSession<Output = T>> {
        Box::new(ScriptedSession {
            rounds: self.rounds,
            reject_round: self.reject_round,
            releases: self.releases.clone(),
            finish: Box::new(finish),
            released: false,
        })
    }
}

pub struct ScriptedSession<T> {
    rounds: u32,
    reject_round: Option<u32>,
    releases: Arc<AtomicUsize>,
    finish: Box<dyn Fn() -> T + Send>,
    released: bool,
}

impl<T> EngineSession for ScriptedSession<T> {
    type Output = T;

    fn initial_message(&mut self) -> Result<Vec<u8>, EngineError> {
        Ok(vec![1])
    }

    fn process(&mut self, round: u32, _payload: &[u8]) -> Result<RoundOutcome<T>, EngineError> {
        if self.reject_round == Some(round) {
            return Err(EngineError::Rejected(format!("scripted rejection at round {round}")));
        }
        if round >= self.rounds {
            return Ok(RoundOutcome::Finished((self.finish)()));
        }
        Ok(RoundOutcome::Continue(vec![(round + 1) as u8]))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn keygen(
        &self,
        _algorithm: Algorithm,
        _cloud_public_key: &[u8],
        _session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = KeyMaterial>>, EngineError> {
        Ok(self.session(|| KeyMaterial {
            share_data: Zeroizing::new(vec![7u8; 32]),
            public_key: hex::decode(SCRIPTED_PUBLIC_KEY).unwrap_or_default(),
        }))
    }

    fn signing(
        &self,
        _share: &KeyShare,
        _digest: &[u8; 32],
        _session_id: &SessionId,
    ) -> Result<Box<dyn EngineSession<Output = SignatureOutput>>, EngineError> {
        Ok(self.session(|| SignatureOutput {
            bytes: vec![9u8; 65],
        }))
    }
}

// ============================================================================
// Transports
// ============================================================================

/// Answers every message with a message for the same round
#[derive(Clone, Default)]
pub struct EchoTransport {
    pub sent: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&self, message: ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(ProtocolMessage::new(
            message.session_id,
            message.round,
            message.message_type,
            vec![0xEC],
        ))
    }
}

/// Holds the exchange for one round until the test opens the gate
pub struct GatedTransport<T> {
    inner: T,
    round: u32,
    pub entered: Arc<Notify>,
    pub gate: Arc<Notify>,
}

impl<T: Transport> GatedTransport<T> {
    pub fn new(inner: T, round: u32) -> Self {
        Self {
            inner,
            round,
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
        }
    }

    /// Wait until a session is parked at the gated round
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.gate.notify_waiters();
    }
}

#[async_trait]
impl<T: Transport> Transport for GatedTransport<T> {
    async fn send(&self, message: ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        if message.round == self.round {
            let opened = self.gate.notified();
            self.entered.notify_one();
            opened.await;
        }
        self.inner.send(message).await
    }
}

/// Fails every exchange with the given error
pub struct FailingTransport(pub TransportError);

#[async_trait]
impl Transport for FailingTransport {
    async fn send(&self, _message: ProtocolMessage) -> Result<ProtocolMessage, TransportError> {
        Err(self.0.clone())
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Memory vault whose writes or removals fail for accounts containing a marker
#[derive(Clone, Default)]
pub struct FlakyStorage {
    pub inner: MemorySecureStorage,
    pub fail_marker: Arc<parking_lot::Mutex<Option<String>>>,
    pub remove_marker: Arc<parking_lot::Mutex<Option<String>>>,
    pub failing: Arc<AtomicBool>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, marker: &str) {
        *self.fail_marker.lock() = Some(marker.to_string());
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn fail_removes_of(&self, marker: &str) {
        *self.remove_marker.lock() = Some(marker.to_string());
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn blocks(&self, marker: &parking_lot::Mutex<Option<String>>, account: &str) -> bool {
        self.failing.load(Ordering::SeqCst)
            && marker
                .lock()
                .as_deref()
                .is_some_and(|marker| account.contains(marker))
    }
}

#[async_trait]
impl SecureStorage for FlakyStorage {
    async fn read(&self, account: &str) -> mpc_keyshare_core::Result<Option<Vec<u8>>> {
        self.inner.read(account).await
    }

    async fn write(
        &self,
        account: &str,
        data: &[u8],
        protection: Protection,
    ) -> mpc_keyshare_core::Result<()> {
        if self.blocks(&self.fail_marker, account) {
            return Err(Error::storage(StorageStatus::Other(-34018), "write refused"));
        }
        self.inner.write(account, data, protection).await
    }

    async fn remove(&self, account: &str) -> mpc_keyshare_core::Result<()> {
        if self.blocks(&self.remove_marker, account) {
            return Err(Error::storage(StorageStatus::Other(-25308), "remove refused"));
        }
        self.inner.remove(account).await
    }

    async fn contains(&self, account: &str) -> mpc_keyshare_core::Result<bool> {
        self.inner.contains(account).await
    }
}

/// Presence gate answering with a fixed outcome and counting prompts
pub struct FixedPresence {
    pub outcome: PresenceOutcome,
    pub prompts: AtomicUsize,
}

impl FixedPresence {
    pub fn new(outcome: PresenceOutcome) -> Self {
        Self {
            outcome,
            prompts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PresenceGate for FixedPresence {
    async fn confirm(&self, _reason: &str) -> PresenceOutcome {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.outcome
    }
}

// ============================================================================
// Wallet builders
// ============================================================================

pub fn loopback_manager<T: Transport + 'static>(transport: Arc<T>) -> SessionManager {
    SessionManager::new(
        Arc::new(LoopbackEngine::new()),
        transport,
        SessionManagerConfig::default(),
    )
}

/// Wallet over a memory vault talking to `cosigner`
pub fn loopback_wallet(cosigner: Arc<LoopbackCosigner>) -> (MpcWallet, MemorySecureStorage) {
    let vault = MemorySecureStorage::new();
    let store = KeyShareStore::new(Arc::new(vault.clone()));
    let wallet = MpcWallet::new(
        loopback_manager(cosigner.clone()),
        store,
        cosigner.public_key(),
    );
    (wallet, vault)
}

/// Accounts a vault holds for one profile
pub fn profile_records(vault: &MemorySecureStorage, profile_id: &str) -> Vec<String> {
    let suffix = format!(".{profile_id}");
    vault
        .accounts()
        .into_iter()
        .filter(|a| a.ends_with(&suffix))
        .collect()
}
