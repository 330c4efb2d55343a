//! Reconciliation of `Redis` and `BlobStorage` requests
//!
//! One pass reads the request fresh, resolves its tier to a strategy, picks the
//! provider registered for that strategy and either deletes the external
//! resource (tombstoned requests) or creates/discovers it. Connection details
//! are written to the request's secret before the status reports `Complete`.
//!
//! The kube runtime serializes passes per object, so there is never more than
//! one in-flight pass for a given request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use cro_common::crd::{
    CloudResource, CloudResourceStatus, ConditionStatus, RequestId, ResourcePhase,
    ResourceRequest, SecretRef,
};
use cro_common::metrics::record_reconcile;
use cro_common::retry::BackoffConfig;
use cro_common::{Error, REQUEUE_CONFIG_ERROR_SECS, REQUEUE_PROVISIONING_SECS};
use cro_provider::{
    Provider, ProviderOutcome, ProviderRegistry, StrategyConfig, StrategyResolver,
};

use crate::store::{KubeRequestStore, KubeSecretSink, RequestStore, SecretSink};

/// Condition reasons written on `Ready`
mod reason {
    pub const PROVISIONING: &str = "Provisioning";
    pub const AVAILABLE: &str = "Available";
    pub const DELETING: &str = "Deleting";
}

/// Timing knobs for the reconcile loop
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Requeue interval while provisioning and after success
    pub requeue_after: Duration,
    /// Fixed resync interval for configuration errors
    pub config_error_resync: Duration,
    /// Upper bound on one pass; external calls are cancelled past it
    pub pass_timeout: Duration,
    /// Backoff between failed passes
    pub backoff: BackoffConfig,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(REQUEUE_PROVISIONING_SECS),
            config_error_resync: Duration::from_secs(REQUEUE_CONFIG_ERROR_SECS),
            pass_timeout: Duration::from_secs(600),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Shared state for every reconcile pass
pub struct Context {
    /// Request reads, finalizers and status writes
    pub store: Arc<dyn RequestStore>,
    /// Connection secret writes
    pub secrets: Arc<dyn SecretSink>,
    /// Tier to strategy lookup
    pub resolver: Arc<dyn StrategyResolver>,
    /// Providers keyed by (kind, strategy)
    pub registry: Arc<ProviderRegistry>,
    /// Timing knobs
    pub settings: ControllerSettings,
    /// Cancelled on operator shutdown; every pass derives its token from it
    pub shutdown: CancellationToken,
    /// Consecutive failures per request
    failures: DashMap<RequestId, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        registry: Arc<ProviderRegistry>,
        resolver: Arc<dyn StrategyResolver>,
    ) -> ContextBuilder {
        ContextBuilder::new(client, registry, resolver)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn RequestStore>,
        secrets: Arc<dyn SecretSink>,
        resolver: Arc<dyn StrategyResolver>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            secrets,
            resolver,
            registry,
            settings: ControllerSettings::default(),
            shutdown: CancellationToken::new(),
            failures: DashMap::new(),
        }
    }

    /// Record a failed pass and return how long to wait before the next one
    ///
    /// Configuration errors resync on a fixed interval and do not grow the
    /// backoff; everything else backs off exponentially with jitter.
    pub fn next_retry_delay(&self, id: &RequestId, error: &Error) -> Duration {
        if error.is_configuration() {
            self.failures.remove(id);
            return self.settings.config_error_resync;
        }
        let failures = {
            let mut entry = self.failures.entry(id.clone()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        self.settings.backoff.delay_for(failures)
    }

    /// Forget the failure count of a request after a successful pass
    pub fn reset_backoff(&self, id: &RequestId) {
        self.failures.remove(id);
    }

    /// Consecutive failures recorded for a request
    pub fn failure_count(&self, id: &RequestId) -> u32 {
        self.failures.get(id).map(|v| *v).unwrap_or(0)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    registry: Arc<ProviderRegistry>,
    resolver: Arc<dyn StrategyResolver>,
    store: Option<Arc<dyn RequestStore>>,
    secrets: Option<Arc<dyn SecretSink>>,
    settings: ControllerSettings,
    shutdown: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(
        client: Client,
        registry: Arc<ProviderRegistry>,
        resolver: Arc<dyn StrategyResolver>,
    ) -> Self {
        Self {
            client,
            registry,
            resolver,
            store: None,
            secrets: None,
            settings: ControllerSettings::default(),
            shutdown: None,
        }
    }

    /// Override the request store
    pub fn store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the secret sink
    pub fn secrets(mut self, secrets: Arc<dyn SecretSink>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Set timing knobs
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the shutdown token
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeRequestStore::new(self.client.clone()))),
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(KubeSecretSink::new(self.client.clone()))),
            resolver: self.resolver,
            registry: self.registry,
            settings: self.settings,
            shutdown: self.shutdown.unwrap_or_default(),
            failures: DashMap::new(),
        }
    }
}

/// What the loop should do after a successful pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do for this request
    Done,
    /// Run again after the given delay
    RequeueAfter(Duration),
}

impl ReconcileOutcome {
    /// Convert to a kube runtime action
    pub fn into_action(self) -> Action {
        match self {
            Self::Done => Action::await_change(),
            Self::RequeueAfter(d) => Action::requeue(d),
        }
    }
}

/// Reconcile entry point for the kube runtime
#[instrument(
    skip(obj, ctx),
    fields(kind = %K::KIND, request = %obj.name_any(), namespace = ?obj.namespace())
)]
pub async fn reconcile<K: CloudResource>(
    obj: Arc<K>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let namespace = obj.namespace().ok_or_else(|| {
        Error::validation_for(format!("{}/{}", K::KIND, obj.name_any()), "request has no namespace")
    })?;
    let id = RequestId::new(K::KIND, namespace, obj.name_any());

    let cancel = ctx.shutdown.child_token();
    let deadline = {
        let cancel = cancel.clone();
        let timeout = ctx.settings.pass_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };

    let start = Instant::now();
    let result = reconcile_request(&id, &ctx, &cancel).await;
    deadline.abort();

    record_reconcile(
        K::KIND.as_str(),
        start.elapsed(),
        result.as_ref().err().map(Error::class),
    );

    let outcome = result?;
    ctx.reset_backoff(&id);
    Ok(outcome.into_action())
}

/// Error policy for the kube runtime
pub fn error_policy<K: CloudResource>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let id = RequestId::new(K::KIND, obj.namespace().unwrap_or_default(), obj.name_any());
    let delay = ctx.next_retry_delay(&id, error);

    if error.is_configuration() {
        warn!(%error, request = %id, retry_after = ?delay, "request needs a configuration change");
    } else {
        error!(
            %error,
            request = %id,
            class = error.class(),
            failures = ctx.failure_count(&id),
            retry_after = ?delay,
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}

/// Run one pass for a request
///
/// `cancel` is checked by providers at every external call. A cancelled pass
/// returns [`Error::Cancelled`] without writing status.
pub async fn reconcile_request(
    id: &RequestId,
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome, Error> {
    let Some(request) = ctx.store.get(id).await? else {
        debug!(request = %id, "request no longer exists");
        return Ok(ReconcileOutcome::Done);
    };

    if request.deletion_requested && !request.has_finalizer() {
        debug!(request = %id, "request is being deleted and holds no finalizer");
        return Ok(ReconcileOutcome::Done);
    }

    let (strategy, provider) = match select_provider(ctx, &request).await {
        Ok(selected) => selected,
        Err(e) => return Err(surface_failure(ctx, &request, e).await),
    };

    if request.deletion_requested {
        delete_external(ctx, &request, provider.as_ref(), &strategy, cancel).await
    } else {
        provision(ctx, &request, provider.as_ref(), &strategy, cancel).await
    }
}

async fn select_provider(
    ctx: &Context,
    request: &ResourceRequest,
) -> Result<(StrategyConfig, Arc<dyn Provider>), Error> {
    let strategy = ctx.resolver.resolve(request.kind(), &request.tier).await?;
    let provider = ctx.registry.select(request.kind(), &strategy.strategy)?;
    debug!(
        request = %request.id,
        tier = %request.tier,
        strategy = %strategy.strategy,
        provider = provider.name(),
        "selected provider"
    );
    Ok((strategy, provider))
}

async fn delete_external(
    ctx: &Context,
    request: &ResourceRequest,
    provider: &dyn Provider,
    strategy: &StrategyConfig,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome, Error> {
    let message = format!("deleting {} {}", request.kind(), request.name());
    update_status(ctx, &request.id, |status| {
        status.phase = ResourcePhase::Deleting;
        status.message = Some(message.clone());
        status.set_ready(ConditionStatus::False, reason::DELETING, &message);
    })
    .await?;

    if let Err(e) = provider.delete(request, strategy, cancel).await {
        return Err(surface_failure(ctx, request, e).await);
    }

    ctx.store.remove_finalizer(&request.id).await?;
    info!(request = %request.id, provider = provider.name(), "external resource deleted");
    Ok(ReconcileOutcome::Done)
}

async fn provision(
    ctx: &Context,
    request: &ResourceRequest,
    provider: &dyn Provider,
    strategy: &StrategyConfig,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome, Error> {
    // The finalizer must be in place before anything external exists
    if !request.has_finalizer() {
        if let Err(e) = ctx.store.add_finalizer(&request.id).await {
            return Err(surface_failure(ctx, request, e).await);
        }
        debug!(request = %request.id, "added finalizer");
    }

    let outcome = match provider.create_or_discover(request, strategy, cancel).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(surface_failure(ctx, request, e).await),
    };

    let instance = match outcome {
        ProviderOutcome::Pending { reason: why } => {
            debug!(request = %request.id, reason = %why, "external resource not ready");
            update_status(ctx, &request.id, |status| {
                status.phase = ResourcePhase::InProgress;
                status.message = Some(why.clone());
                status.set_ready(ConditionStatus::False, reason::PROVISIONING, &why);
            })
            .await?;
            return Ok(ReconcileOutcome::RequeueAfter(ctx.settings.requeue_after));
        }
        ProviderOutcome::Ready(instance) => instance,
    };

    if instance.details.is_empty() {
        let e = Error::invariant(
            request.id.to_string(),
            format!("provider {} reported ready without connection details", instance.provider),
        );
        return Err(surface_failure(ctx, request, e).await);
    }

    if let Err(e) = ctx
        .secrets
        .materialize(request, &instance.details.secret_data())
        .await
    {
        return Err(surface_failure(ctx, request, e).await);
    }

    let message = format!("{} {} is available", request.kind(), request.name());
    update_status(ctx, &request.id, |status| {
        status.phase = ResourcePhase::Complete;
        status.message = Some(message.clone());
        status.provider = Some(instance.provider.clone());
        status.strategy = Some(request.tier.clone());
        status.secret_ref = Some(SecretRef {
            name: request.secret_name.clone(),
        });
        status.set_ready(ConditionStatus::True, reason::AVAILABLE, &message);
    })
    .await?;

    info!(
        request = %request.id,
        provider = %instance.provider,
        secret = %request.secret_name,
        "external resource available"
    );
    Ok(ReconcileOutcome::RequeueAfter(ctx.settings.requeue_after))
}

/// Re-read the request, apply `mutate` to its status and write it back
/// unless nothing a user would see has changed
async fn update_status<F>(ctx: &Context, id: &RequestId, mutate: F) -> Result<(), Error>
where
    F: FnOnce(&mut CloudResourceStatus),
{
    let Some(current) = ctx.store.get(id).await? else {
        debug!(request = %id, "request disappeared before status write");
        return Ok(());
    };

    let mut next = current.status.clone();
    mutate(&mut next);
    if next.same_observation(&current.status) {
        return Ok(());
    }

    next.last_reconciled = Some(chrono::Utc::now());
    ctx.store.patch_status(id, &next).await
}

/// Report a failed pass on the request status and hand the error back
///
/// Only `phase`, `message` and `Ready` change, so the fields recording the
/// last successful provisioning survive the failure.
async fn surface_failure(ctx: &Context, request: &ResourceRequest, error: Error) -> Error {
    if matches!(error, Error::Cancelled { .. }) {
        debug!(request = %request.id, %error, "pass cancelled");
        return error;
    }

    let phase = if request.deletion_requested {
        ResourcePhase::Deleting
    } else {
        ResourcePhase::Failed
    };
    let message = error.to_string();
    let class = error.class();
    let write = update_status(ctx, &request.id, |status| {
        status.phase = phase;
        status.message = Some(message.clone());
        status.set_ready(ConditionStatus::False, class, &message);
    })
    .await;

    if let Err(status_error) = write {
        warn!(request = %request.id, error = %status_error, "failed to record failure on status");
    }
    error
}
