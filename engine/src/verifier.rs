//! Per-entity-kind verification worker.
//!
//! A `Verifier` answers "is entity X currently in a consistent, usable
//! state?" over the bus. The verify side walks the entity's prerequisite
//! graph, then runs the kind's own checks; the process side additionally
//! runs post-verification side effects under a claim protocol so concurrent
//! workers never run them twice.
//!
//! Recursion across the bus is bounded two ways: the TTL cache
//! short-circuits entities that already settled, and every request carries
//! the in-flight chain of `(kind, id)` pairs; a verifier that finds itself
//! on the chain answers `NotReady` instead of recursing.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use gradebus_bus::{Bus, BusError, Failure};
use gradebus_storage::{create_diagnostic, Storage, StorageError};
use gradebus_types::{
    process_address, verify_address, EntityId, EntityKind, EntityRecord, EntityRef, Schema,
    VerificationData, VerificationStatus, VerifyRequest,
};

use crate::cache::VerifyCache;
use crate::codes;
use crate::prereq::check_prerequisites;

pub type CheckFut<'a> = Pin<Box<dyn Future<Output = Result<VerificationData, StorageError>> + Send + 'a>>;

/// Shared collaborators handed to entity checks and the prerequisite
/// walker.
#[derive(Clone)]
pub struct CheckCtx {
    pub bus: Bus,
    pub storage: Arc<dyn Storage>,
    pub schema: Arc<Schema>,
    pub rpc_timeout: Duration,
}

/// Entity-specific verification logic: a capability, not a shared base
/// behavior. Kinds with nothing to check use [`DefaultCheck`].
pub trait EntityCheck: Send + Sync {
    /// Foreign-key columns excluded from prerequisite checking.
    fn skipped_references(&self) -> &[&str] {
        &[]
    }

    /// Is this entity itself valid? Runs only once all prerequisites are
    /// `Processed`. `Invalid` outcomes must reference a persisted
    /// diagnostic.
    fn verify<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        let _ = (record, ctx);
        Box::pin(async { Ok(VerificationData::processed()) })
    }

    /// Post-verification side effects. Invoked under the process claim
    /// protocol; must be idempotent (a retry after a crashed claim may run
    /// it again).
    fn process<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        let _ = (record, ctx);
        Box::pin(async { Ok(VerificationData::processed()) })
    }
}

/// No entity-specific checks; prerequisites alone decide the outcome.
#[derive(Debug, Default)]
pub struct DefaultCheck;

impl EntityCheck for DefaultCheck {}

/// Verification worker for one entity kind, registered under
/// `verify.<kind>` and `process.<kind>`.
pub struct Verifier {
    kind: EntityKind,
    check: Box<dyn EntityCheck>,
    ctx: CheckCtx,
    cache: VerifyCache,
    cache_ttl: Duration,
    in_flight: Mutex<HashMap<EntityId, broadcast::Sender<VerificationData>>>,
    /// Ids whose side effects already ran to completion on this worker.
    processed: Mutex<HashSet<EntityId>>,
}

impl Verifier {
    #[must_use]
    pub fn new(
        kind: EntityKind,
        check: Box<dyn EntityCheck>,
        ctx: CheckCtx,
        cache_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            check,
            ctx,
            cache: VerifyCache::new(),
            cache_ttl,
            in_flight: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    /// Register this verifier's bus endpoints and start serving.
    pub fn spawn(self: &Arc<Self>) -> Result<(), BusError> {
        let this = Arc::clone(self);
        self.ctx
            .bus
            .serve(&verify_address(&self.kind), move |payload| {
                let this = Arc::clone(&this);
                async move { this.verify_rpc(payload).await }
            })?;

        let this = Arc::clone(self);
        self.ctx
            .bus
            .serve(&process_address(&self.kind), move |payload| {
                let this = Arc::clone(&this);
                async move { this.process_rpc(payload).await }
            })?;

        Ok(())
    }

    async fn verify_rpc(&self, payload: Value) -> Result<Value, Failure> {
        let request: VerifyRequest = serde_json::from_value(payload)
            .map_err(|e| Failure::new(codes::BAD_REQUEST, format!("malformed verify request: {e}")))?;
        let data = self
            .verify(request)
            .await
            .map_err(|e| Failure::new(codes::INTERNAL, e.to_string()))?;
        Ok(serde_json::to_value(data).expect("verification data serialization is infallible"))
    }

    async fn process_rpc(&self, payload: Value) -> Result<Value, Failure> {
        let request: VerifyRequest = serde_json::from_value(payload)
            .map_err(|e| Failure::new(codes::BAD_REQUEST, format!("malformed process request: {e}")))?;
        let data = self
            .process(request)
            .await
            .map_err(|e| Failure::new(codes::INTERNAL, e.to_string()))?;
        Ok(serde_json::to_value(data).expect("verification data serialization is infallible"))
    }

    /// Full verify pipeline: cycle guard, cache, in-flight de-duplication,
    /// then the uncached walk.
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerificationData, StorageError> {
        let here = EntityRef {
            kind: self.kind.clone(),
            id: request.id,
        };
        if request.path.contains(&here) {
            tracing::debug!(
                "cycle in dependency graph at {} {}; answering NotReady",
                self.kind,
                request.id
            );
            return Ok(VerificationData::not_ready());
        }

        if let Some(hit) = self.cache.get(request.id) {
            return Ok(hit);
        }

        // Concurrent verifies for the same id: one leader computes, the
        // rest await its broadcast.
        let role = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            match in_flight.get(&request.id) {
                Some(tx) => Err(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    in_flight.insert(request.id, tx.clone());
                    Ok(tx)
                }
            }
        };
        let leader_tx = match role {
            Err(mut rx) => {
                return Ok(match rx.recv().await {
                    Ok(data) => data,
                    // Leader failed before publishing; retryable.
                    Err(_) => VerificationData::not_ready(),
                });
            }
            Ok(tx) => tx,
        };

        let result = self.verify_uncached(&request).await;

        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .remove(&request.id);
        if let Ok(data) = &result {
            let _ = leader_tx.send(data.clone());
        }

        result
    }

    async fn verify_uncached(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerificationData, StorageError> {
        let Some(record) = self
            .ctx
            .storage
            .find_by_id(&self.kind, request.id)
            .await?
        else {
            return self.missing_entity(request.id).await;
        };

        let path = self.extend_path(&request.path, request.id);
        let prereq = check_prerequisites(
            &record,
            self.check.skipped_references(),
            &path,
            &self.ctx,
        )
        .await?;

        // Entity-specific checks never run against unresolved prerequisites.
        if !prereq.is_processed() {
            self.cache_terminal(request.id, &prereq);
            return Ok(prereq);
        }

        let own = self.check.verify(&record, &self.ctx).await?;
        self.cache_terminal(request.id, &own);
        Ok(own)
    }

    /// Process pipeline: verify first, and only a `Processed` verification
    /// admits the entity's side effects. Side effects run at most once per
    /// worker for an entity that stays settled; a non-`Processed` process
    /// outcome releases the claim so a deliberate retry can run them again.
    pub async fn process(&self, request: VerifyRequest) -> Result<VerificationData, StorageError> {
        let Some(record) = self
            .ctx
            .storage
            .find_by_id(&self.kind, request.id)
            .await?
        else {
            return self.missing_entity(request.id).await;
        };

        let verified = self.verify(request).await?;
        if !verified.is_processed() {
            return Ok(verified);
        }

        // Claim before running: concurrent process calls for the same id
        // must not duplicate the side effects.
        {
            let mut processed = self.processed.lock().expect("processed set poisoned");
            if !processed.insert(record.id) {
                return Ok(verified);
            }
        }

        let outcome = self.check.process(&record, &self.ctx).await;
        match &outcome {
            Ok(data) if data.is_processed() => {}
            _ => {
                // Side effects did not complete; release the claim.
                self.processed
                    .lock()
                    .expect("processed set poisoned")
                    .remove(&record.id);
            }
        }
        let outcome = outcome?;
        self.cache_terminal(record.id, &outcome);
        Ok(outcome)
    }

    async fn missing_entity(&self, id: EntityId) -> Result<VerificationData, StorageError> {
        let diag = create_diagnostic(
            self.ctx.storage.as_ref(),
            &self.kind,
            id,
            json!({ "error": format!("{} {} not found", self.kind, id) }),
        )
        .await?;
        // Not cached: the entity is usually about to be created, and a
        // cached NotFound would mask it for a full TTL.
        Ok(VerificationData::invalid_one(diag))
    }

    fn extend_path(&self, path: &[EntityRef], id: EntityId) -> Vec<EntityRef> {
        let mut extended = path.to_vec();
        extended.push(EntityRef {
            kind: self.kind.clone(),
            id,
        });
        extended
    }

    /// Terminal statuses are cached; transient ones are recomputed on the
    /// next request so retries can observe progress.
    fn cache_terminal(&self, id: EntityId, data: &VerificationData) {
        match data.status {
            VerificationStatus::Processed | VerificationStatus::Invalid => {
                self.cache.put(id, data.clone(), self.cache_ttl);
            }
            VerificationStatus::Unknown | VerificationStatus::NotReady => {}
        }
    }
}
