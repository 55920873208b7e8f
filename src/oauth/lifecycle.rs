//! Token Lifecycle Manager
//!
//! The single source of truth for which credential to attach for an
//! origin. All token mutations for an origin go through one in-flight
//! record (single-flight): concurrent callers join the running operation
//! and observe the same outcome.
//!
//! Operations run in spawned tasks. A caller that stops waiting does not
//! abort the operation for others; when the last waiter of an interactive
//! authorization leaves, its browser wait is cancelled. Results are
//! committed to the cache in the same critical section that retires the
//! in-flight record; the [`CredentialStore`] write is staged there with a
//! per-origin version and applied on the blocking pool afterwards, so a
//! slow store never holds up other origins.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::TimeDelta;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::authorizer::InteractiveAuthorizer;
use super::flow::{AuthorizationRequest, PkceFlow};
use super::metadata::{AuthorizationServerMetadata, Discovery};
use super::storage::CredentialStore;
use super::token::{TokenEndpoint, TokenSet};
use crate::config::Config;
use crate::{Error, Result};

/// Longest refresh margin honoured; keeps expiry arithmetic in range
const MAX_REFRESH_MARGIN: TimeDelta = TimeDelta::days(365);

/// Everything needed to obtain tokens from one authorization server
#[derive(Debug, Clone)]
pub struct OriginRegistration {
    /// Authorization server metadata
    pub server: Arc<AuthorizationServerMetadata>,
    /// RFC 8707 resource indicator
    pub resource: Option<String>,
    /// Scopes the resource advertises
    pub scopes_supported: Vec<String>,
}

impl From<&Discovery> for OriginRegistration {
    fn from(discovery: &Discovery) -> Self {
        Self {
            server: Arc::clone(&discovery.server),
            resource: Some(discovery.resource.resource.clone()),
            scopes_supported: discovery.resource.scopes_supported.clone(),
        }
    }
}

type Outcome = Shared<BoxFuture<'static, Result<TokenSet>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Refresh,
    Authorize,
}

/// In-flight operation for one origin
struct Flight {
    id: u64,
    kind: FlightKind,
    outcome: Outcome,
    waiters: usize,
    cancel: CancellationToken,
}

/// Serializes store writes for one origin; holds the newest version applied
type WriteSlot = Arc<Mutex<u64>>;

#[derive(Default)]
struct OriginState {
    /// Bumped by `invalidate` and `clear`; results started under an older
    /// epoch are dropped
    epoch: u64,
    loaded: bool,
    cached: Option<TokenSet>,
    flight: Option<Flight>,
    /// Version of the last staged store write
    version: u64,
    slot: WriteSlot,
}

enum StoreWrite {
    Save(TokenSet),
    Remove,
}

/// Store write decided under the state lock, applied after it is released
struct PendingWrite {
    origin: String,
    version: u64,
    slot: WriteSlot,
    write: StoreWrite,
}

/// What a caller needs from the manager
#[derive(Debug)]
enum Want {
    /// A valid token; `rejected` is an access token the resource refused
    Current { rejected: Option<String> },
    /// Redeem the refresh token, no fallback
    Refresh,
    /// New interactive authorization including `extra` scopes
    Authorize { extra: BTreeSet<String> },
}

enum Operation {
    Refresh {
        server: Arc<AuthorizationServerMetadata>,
        tokens: TokenSet,
        resource: Option<String>,
    },
    Authorize(AuthorizationRequest),
}

enum Plan {
    Ready(TokenSet),
    Wait(Waiter),
}

struct Inner {
    margin: TimeDelta,
    default_scopes: Vec<String>,
    tokens: TokenEndpoint,
    flow: PkceFlow,
    store: Arc<dyn CredentialStore>,
    authorizer: Arc<dyn InteractiveAuthorizer>,
    origins: DashMap<String, OriginRegistration>,
    states: Mutex<HashMap<String, OriginState>>,
    next_flight: AtomicU64,
    shutdown: CancellationToken,
}

/// Handle to the token lifecycle; cheap to clone, share it with every caller
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    /// Create a manager.
    ///
    /// `http` must carry the request timeout; `authorizer` performs the
    /// interactive part of new authorizations.
    #[must_use]
    pub fn new(
        config: &Config,
        http: Client,
        store: Arc<dyn CredentialStore>,
        authorizer: Arc<dyn InteractiveAuthorizer>,
    ) -> Self {
        let tokens = TokenEndpoint::new(http.clone(), config.tokens.default_lifetime);
        let flow = PkceFlow::new(
            http,
            config.client.clone(),
            tokens.clone(),
            config.timeouts.authorization,
        );
        let margin = TimeDelta::from_std(config.tokens.refresh_margin)
            .unwrap_or(MAX_REFRESH_MARGIN)
            .min(MAX_REFRESH_MARGIN);

        Self {
            inner: Arc::new(Inner {
                margin,
                default_scopes: config.client.scopes.clone(),
                tokens,
                flow,
                store,
                authorizer,
                origins: DashMap::new(),
                states: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Make an authorization server known; returns its origin
    pub fn register(&self, registration: OriginRegistration) -> String {
        let origin = registration.server.issuer.clone();
        debug!(origin = %origin, resource = ?registration.resource, "Registered authorization server");
        self.inner.origins.insert(origin.clone(), registration);
        origin
    }

    /// Whether `origin` has been registered
    pub fn is_registered(&self, origin: &str) -> bool {
        self.inner.origins.contains_key(origin)
    }

    /// Safety margin before expiry at which tokens are renewed
    pub fn refresh_margin(&self) -> TimeDelta {
        self.inner.margin
    }

    /// Cached token set for `origin`, without any network activity
    pub fn cached(&self, origin: &str) -> Option<TokenSet> {
        let mut states = self.inner.states.lock();
        let state = self.inner.state_mut(&mut states, origin);
        state.cached.clone()
    }

    /// A token set valid for at least the refresh margin.
    ///
    /// Refreshes when the cached token is close to expiry, and falls back
    /// to a new interactive authorization when there is no token, no
    /// refresh token, or the refresh token was rejected.
    pub async fn current(&self, origin: &str) -> Result<TokenSet> {
        self.acquire(origin, Want::Current { rejected: None }).await
    }

    /// Replace an access token the resource rejected with 401.
    ///
    /// Returns a newer token if one already exists, otherwise refreshes or
    /// re-authorizes like [`current`](Self::current).
    pub async fn recover(&self, origin: &str, rejected_access_token: &str) -> Result<TokenSet> {
        self.acquire(
            origin,
            Want::Current {
                rejected: Some(rejected_access_token.to_string()),
            },
        )
        .await
    }

    /// Redeem the cached refresh token.
    ///
    /// On rejection the stored credentials are cleared and
    /// [`Error::ReauthorizationRequired`] is returned.
    pub async fn refresh(&self, origin: &str) -> Result<TokenSet> {
        self.acquire(origin, Want::Refresh).await
    }

    /// Run a new interactive authorization requesting `extra_scopes` on top
    /// of the configured and already granted ones
    pub async fn authorize(&self, origin: &str, extra_scopes: &[String]) -> Result<TokenSet> {
        let extra = extra_scopes.iter().cloned().collect();
        self.acquire(origin, Want::Authorize { extra }).await
    }

    /// Revoke and forget the credentials for `origin`.
    ///
    /// Local clearing always happens; the revocation request is best effort.
    /// Operations already in flight are cancelled or their results dropped.
    pub async fn invalidate(&self, origin: &str) -> Result<()> {
        let (tokens, pending) = {
            let mut states = self.inner.states.lock();
            let state = self.inner.state_mut(&mut states, origin);
            state.epoch += 1;
            if let Some(flight) = state.flight.take() {
                flight.cancel.cancel();
            }
            let tokens = state.cached.take();
            (tokens, Inner::stage(state, origin, StoreWrite::Remove))
        };
        let removed = self.inner.persist(pending).await;
        info!(origin = %origin, "Credentials invalidated");

        let server = self
            .inner
            .origins
            .get(origin)
            .map(|entry| Arc::clone(&entry.value().server));
        if let (Some(tokens), Some(server)) = (tokens, server) {
            if let Err(e) = self.inner.tokens.revoke(&server, &tokens).await {
                warn!(origin = %origin, error = %e, "Token revocation failed");
            }
        }

        removed
    }

    /// Forget the credentials of every origin and empty the store.
    ///
    /// Nothing is revoked remotely. Operations in flight are cancelled or
    /// their results dropped, as with [`invalidate`](Self::invalidate).
    pub async fn clear(&self) -> Result<()> {
        let slots: Vec<(WriteSlot, u64)> = {
            let mut states = self.inner.states.lock();
            states
                .values_mut()
                .map(|state| {
                    state.epoch += 1;
                    if let Some(flight) = state.flight.take() {
                        flight.cancel.cancel();
                    }
                    state.cached = None;
                    state.loaded = true;
                    state.version += 1;
                    (Arc::clone(&state.slot), state.version)
                })
                .collect()
        };
        info!(origins = slots.len(), "Clearing all credentials");

        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || {
            // hold every slot so no older write lands after the clear
            let _held: Vec<_> = slots
                .iter()
                .map(|(slot, version)| {
                    let mut applied = slot.lock();
                    *applied = (*applied).max(*version);
                    applied
                })
                .collect();
            store.clear()
        })
        .await
        .unwrap_or_else(|e| Err(Error::Internal(format!("credential store task failed: {e}"))))
    }

    /// Cancel every pending interactive authorization
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn acquire(&self, origin: &str, want: Want) -> Result<TokenSet> {
        // a rejected refresh clears the cache, so the next round authorizes
        let mut rounds = 0;
        loop {
            rounds += 1;
            let waiter = match self.inner.plan(origin, &want)? {
                Plan::Ready(tokens) => return Ok(tokens),
                Plan::Wait(waiter) => waiter,
            };

            match waiter.outcome().await {
                Ok(tokens) => {
                    if let Want::Authorize { extra } = &want {
                        if !waiter.started && !tokens.covers(extra) && rounds < 3 {
                            continue;
                        }
                    }
                    return Ok(tokens);
                }
                Err(Error::ReauthorizationRequired { .. })
                    if matches!(want, Want::Current { .. })
                        && waiter.kind == FlightKind::Refresh
                        && rounds < 3 =>
                {
                    debug!(origin = %origin, "Refresh rejected, starting new authorization");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Inner {
    fn state_mut<'a>(&self, states: &'a mut HashMap<String, OriginState>, origin: &str) -> &'a mut OriginState {
        let state = states.entry(origin.to_string()).or_default();
        if !state.loaded {
            state.cached = match self.store.load(origin) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(origin = %origin, error = %e, "Failed to load stored credentials");
                    None
                }
            };
            state.loaded = true;
        }
        state
    }

    fn is_fresh(&self, tokens: &TokenSet) -> bool {
        !tokens.expires_within(self.margin)
    }

    /// Decide, under the lock, whether to answer, join, or start an operation
    fn plan(self: &Arc<Self>, origin: &str, want: &Want) -> Result<Plan> {
        let mut states = self.states.lock();
        let state = self.state_mut(&mut states, origin);

        // an abandoned authorization is only waiting to retire; never join it
        let joinable = state
            .flight
            .as_mut()
            .filter(|f| !(f.kind == FlightKind::Authorize && f.cancel.is_cancelled()));
        if let Some(flight) = joinable {
            debug!(origin = %origin, kind = ?flight.kind, "Joining in-flight operation");
            flight.waiters += 1;
            return Ok(Plan::Wait(Waiter {
                inner: Arc::clone(self),
                origin: origin.to_string(),
                id: flight.id,
                kind: flight.kind,
                outcome: flight.outcome.clone(),
                started: false,
            }));
        }

        let operation = match want {
            Want::Current { rejected } => match &state.cached {
                Some(tokens)
                    if self.is_fresh(tokens)
                        && rejected.as_deref() != Some(tokens.access_token.as_str()) =>
                {
                    return Ok(Plan::Ready(tokens.clone()));
                }
                Some(tokens) if tokens.refresh_token.is_some() => self.refresh_operation(origin, tokens)?,
                cached => self.authorize_operation(origin, cached.as_ref(), &BTreeSet::new())?,
            },
            Want::Refresh => match &state.cached {
                Some(tokens) if tokens.refresh_token.is_some() => self.refresh_operation(origin, tokens)?,
                _ => {
                    return Err(Error::ReauthorizationRequired {
                        origin: origin.to_string(),
                        reason: "no refresh token available".to_string(),
                    });
                }
            },
            Want::Authorize { extra } => self.authorize_operation(origin, state.cached.as_ref(), extra)?,
        };

        Ok(Plan::Wait(self.start(state, origin, operation)))
    }

    fn registration(&self, origin: &str) -> Result<OriginRegistration> {
        self.origins
            .get(origin)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::DiscoveryFailed {
                resource: origin.to_string(),
                reason: "authorization server has not been discovered".to_string(),
            })
    }

    fn refresh_operation(&self, origin: &str, tokens: &TokenSet) -> Result<Operation> {
        let registration = self.registration(origin)?;
        Ok(Operation::Refresh {
            server: registration.server,
            tokens: tokens.clone(),
            resource: registration.resource,
        })
    }

    fn authorize_operation(
        &self,
        origin: &str,
        cached: Option<&TokenSet>,
        extra: &BTreeSet<String>,
    ) -> Result<Operation> {
        let registration = self.registration(origin)?;
        let base = if self.default_scopes.is_empty() {
            &registration.scopes_supported
        } else {
            &self.default_scopes
        };

        let mut scopes: BTreeSet<String> = base.iter().cloned().collect();
        if let Some(tokens) = cached {
            scopes.extend(tokens.granted_scopes.iter().cloned());
        }
        scopes.extend(extra.iter().cloned());

        Ok(Operation::Authorize(AuthorizationRequest {
            server: registration.server,
            resource: registration.resource,
            scopes,
        }))
    }

    fn start(self: &Arc<Self>, state: &mut OriginState, origin: &str, operation: Operation) -> Waiter {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let kind = match operation {
            Operation::Refresh { .. } => FlightKind::Refresh,
            Operation::Authorize(_) => FlightKind::Authorize,
        };
        let cancel = self.shutdown.child_token();

        let task = tokio::spawn(Arc::clone(self).run(
            origin.to_string(),
            operation,
            state.epoch,
            id,
            cancel.clone(),
        ));
        let outcome: Outcome = async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Internal(format!("token operation aborted: {e}"))))
        }
        .boxed()
        .shared();

        state.flight = Some(Flight {
            id,
            kind,
            outcome: outcome.clone(),
            waiters: 1,
            cancel,
        });

        Waiter {
            inner: Arc::clone(self),
            origin: origin.to_string(),
            id,
            kind,
            outcome,
            started: true,
        }
    }

    async fn run(
        self: Arc<Self>,
        origin: String,
        operation: Operation,
        epoch: u64,
        id: u64,
        cancel: CancellationToken,
    ) -> Result<TokenSet> {
        let (kind, result) = match operation {
            Operation::Refresh {
                server,
                tokens,
                resource,
            } => {
                info!(origin = %origin, "Refreshing access token");
                let result = self
                    .tokens
                    .refresh(&server, &tokens, resource.as_deref())
                    .await;
                (FlightKind::Refresh, result)
            }
            Operation::Authorize(request) => {
                let result = self
                    .flow
                    .run(request, self.authorizer.as_ref(), &cancel)
                    .await;
                (FlightKind::Authorize, result)
            }
        };

        let result = result.and_then(|tokens| self.check_lifetime(tokens));
        let (result, pending) = self.commit(&origin, epoch, id, kind, result);
        if let Some(pending) = pending {
            if let Err(e) = self.persist(pending).await {
                warn!(origin = %origin, error = %e, "Failed to update stored credentials");
            }
        }
        result
    }

    fn stage(state: &mut OriginState, origin: &str, write: StoreWrite) -> PendingWrite {
        state.version += 1;
        PendingWrite {
            origin: origin.to_string(),
            version: state.version,
            slot: Arc::clone(&state.slot),
            write,
        }
    }

    /// Apply a staged write unless a newer one for the same origin landed first
    fn apply(&self, pending: PendingWrite) -> Result<()> {
        let mut applied = pending.slot.lock();
        if pending.version < *applied {
            debug!(origin = %pending.origin, "Skipping superseded credential write");
            return Ok(());
        }
        *applied = pending.version;
        match &pending.write {
            StoreWrite::Save(tokens) => self.store.save(tokens),
            StoreWrite::Remove => self.store.remove(&pending.origin),
        }
    }

    async fn persist(self: &Arc<Self>, pending: PendingWrite) -> Result<()> {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.apply(pending))
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("credential store task failed: {e}"))))
    }

    /// Reject tokens that would be due for renewal immediately
    fn check_lifetime(&self, tokens: TokenSet) -> Result<TokenSet> {
        if self.is_fresh(&tokens) {
            return Ok(tokens);
        }
        Err(Error::TokenExchangeFailed {
            origin: tokens.origin.clone(),
            status: None,
            error_code: "lifetime_below_refresh_margin".to_string(),
            description: Some(format!(
                "token expires at {}, within the {}s refresh margin",
                tokens.expires_at,
                self.margin.num_seconds()
            )),
        })
    }

    fn commit(
        &self,
        origin: &str,
        epoch: u64,
        id: u64,
        kind: FlightKind,
        result: Result<TokenSet>,
    ) -> (Result<TokenSet>, Option<PendingWrite>) {
        let mut states = self.states.lock();
        let state = self.state_mut(&mut states, origin);

        if state.flight.as_ref().is_some_and(|f| f.id == id) {
            state.flight = None;
        }

        if state.epoch != epoch {
            debug!(origin = %origin, "Discarding result of operation started before invalidation");
            let discarded = Err(Error::ReauthorizationRequired {
                origin: origin.to_string(),
                reason: "credentials were invalidated while the operation was in flight".to_string(),
            });
            return (discarded, None);
        }

        let pending = match &result {
            Ok(tokens) => {
                state.cached = Some(tokens.clone());
                if kind == FlightKind::Refresh {
                    info!(origin = %origin, expires_at = %tokens.expires_at, "Access token refreshed");
                }
                Some(Self::stage(state, origin, StoreWrite::Save(tokens.clone())))
            }
            Err(Error::ReauthorizationRequired { reason, .. }) if kind == FlightKind::Refresh => {
                warn!(origin = %origin, reason = %reason, "Refresh token rejected, clearing credentials");
                state.cached = None;
                Some(Self::stage(state, origin, StoreWrite::Remove))
            }
            Err(e) => {
                debug!(origin = %origin, kind = ?kind, error = %e, "Token operation failed");
                None
            }
        };
        (result, pending)
    }
}

/// One caller's interest in an in-flight operation
struct Waiter {
    inner: Arc<Inner>,
    origin: String,
    id: u64,
    kind: FlightKind,
    outcome: Outcome,
    started: bool,
}

impl Waiter {
    async fn outcome(&self) -> Result<TokenSet> {
        self.outcome.clone().await
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut states = self.inner.states.lock();
        let Some(flight) = states
            .get_mut(&self.origin)
            .and_then(|s| s.flight.as_mut())
            .filter(|f| f.id == self.id)
        else {
            return;
        };

        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 && flight.kind == FlightKind::Authorize {
            debug!(origin = %self.origin, "No callers left waiting, abandoning authorization");
            flight.cancel.cancel();
        }
    }
}
