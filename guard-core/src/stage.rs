//! Boot-stage entry points.
//!
//! The trust-establishing stage builds the context from the store and publishes it. The
//! update stage adopts it, keeps the keys and republishes a scrubbed copy so nothing after
//! it can see them. A read-only stage adopts whatever it finds and serves verified reads.
use alloc::vec::Vec;

use shared::{
    GuardError, GuardResult, HandoffTransport, Namespace, ReplayCounters, RootKeySource,
    StorePosition, VariableName, VariableStore,
};
use zeroize::Zeroizing;

use crate::access::EntryInfo;
use crate::config::GuardConfig;
use crate::context::ProtectedContext;
use crate::crypto::{CryptoProvider, RustCryptoProvider};
use crate::handoff::ContextBlob;
use crate::pipeline::{CommitBatch, CommitPhase, UpdateRequest};

/// Stage that owns the root of trust: builds, reconciles and publishes.
pub struct TrustStage<P: CryptoProvider = RustCryptoProvider> {
    context: ProtectedContext<P>,
}

impl<P: CryptoProvider> TrustStage<P> {
    pub fn establish<S, C, K>(
        store: &mut S,
        counters: &mut C,
        key_source: &mut K,
        provider: P,
        config: GuardConfig,
    ) -> GuardResult<Self>
    where
        S: VariableStore,
        C: ReplayCounters,
        K: RootKeySource,
    {
        let context = ProtectedContext::build(store, counters, key_source, provider, config)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &ProtectedContext<P> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ProtectedContext<P> {
        &mut self.context
    }

    /// Publish the full context, keys included, for the update stage.
    pub fn publish<T: HandoffTransport>(&self, transport: &mut T, base: u64) -> GuardResult<()> {
        self.context.capture(base)?.publish(transport)
    }
}

/// Stage that performs writes on an adopted context.
pub struct UpdateStage<P: CryptoProvider = RustCryptoProvider> {
    context: ProtectedContext<P>,
}

impl<P: CryptoProvider> UpdateStage<P> {
    /// Adopt the published context and replace it with a copy carrying no keys.
    pub fn enter<T: HandoffTransport>(
        transport: &mut T,
        base: u64,
        provider: P,
        config: GuardConfig,
    ) -> GuardResult<Self> {
        let mut blob = ContextBlob::take(transport)?;
        let context = ProtectedContext::adopt(&blob, base, provider, config)?;
        if !context.has_keys() {
            log::error!("update stage entered without key material");
            return Err(GuardError::AccessDenied);
        }
        blob.scrub_secrets()?;
        blob.publish(transport)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &ProtectedContext<P> {
        &self.context
    }

    pub fn phase(&self) -> CommitPhase {
        self.context.phase()
    }

    pub fn write_init<S: VariableStore, C: ReplayCounters>(
        &mut self,
        store: &mut S,
        counters: &mut C,
    ) -> GuardResult<()> {
        self.context.write_init(store, counters)
    }

    pub fn update<S: VariableStore, C: ReplayCounters>(
        &mut self,
        store: &mut S,
        counters: &mut C,
        request: UpdateRequest,
    ) -> GuardResult<CommitBatch> {
        self.context.update(store, counters, request)
    }

    pub fn write_final<S: VariableStore, C: ReplayCounters>(
        &mut self,
        store: &mut S,
        counters: &mut C,
        written: StorePosition,
    ) -> GuardResult<()> {
        self.context.write_final(store, counters, written)
    }

    pub fn abandon<S: VariableStore>(&mut self, store: &mut S) -> GuardResult<()> {
        self.context.abandon(store)
    }

    pub fn commit<S: VariableStore, C: ReplayCounters>(
        &mut self,
        store: &mut S,
        counters: &mut C,
        request: UpdateRequest,
    ) -> GuardResult<StorePosition> {
        self.context.commit(store, counters, request)
    }

    pub fn read<S: VariableStore>(
        &mut self,
        store: &S,
        name: &VariableName,
        namespace: &Namespace,
    ) -> GuardResult<Zeroizing<Vec<u8>>> {
        self.context.read(store, name, namespace)
    }

    /// Publish the current directory without keys.
    pub fn publish<T: HandoffTransport>(&self, transport: &mut T, base: u64) -> GuardResult<()> {
        let mut blob = self.context.capture(base)?;
        blob.scrub_secrets()?;
        blob.publish(transport)
    }
}

/// Stage that may only read.
pub struct ReadOnlyStage<P: CryptoProvider = RustCryptoProvider> {
    context: ProtectedContext<P>,
}

impl<P: CryptoProvider> ReadOnlyStage<P> {
    pub fn enter<T: HandoffTransport>(
        transport: &T,
        base: u64,
        provider: P,
        config: GuardConfig,
    ) -> GuardResult<Self> {
        let blob = ContextBlob::take(transport)?;
        let context = ProtectedContext::adopt(&blob, base, provider, config)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &ProtectedContext<P> {
        &self.context
    }

    pub fn read<S: VariableStore>(
        &mut self,
        store: &S,
        name: &VariableName,
        namespace: &Namespace,
    ) -> GuardResult<Zeroizing<Vec<u8>>> {
        self.context.read(store, name, namespace)
    }

    pub fn read_into<S: VariableStore>(
        &mut self,
        store: &S,
        name: &VariableName,
        namespace: &Namespace,
        output: &mut [u8],
    ) -> GuardResult<usize> {
        self.context.read_into(store, name, namespace, output)
    }

    pub fn entry_info(&self, name: &VariableName, namespace: &Namespace) -> GuardResult<EntryInfo> {
        self.context.entry_info(name, namespace)
    }

    pub fn next_entry(&self, cursor: Option<StorePosition>) -> Option<EntryInfo> {
        self.context.next_entry(cursor, false)
    }

    pub fn update<S: VariableStore, C: ReplayCounters>(
        &mut self,
        _store: &mut S,
        _counters: &mut C,
        request: UpdateRequest,
    ) -> GuardResult<CommitBatch> {
        log::warn!("write of {} refused in a read-only stage", request.name);
        Err(GuardError::AccessDenied)
    }
}
