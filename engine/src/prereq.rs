//! Dependency-graph checker.
//!
//! For a given entity this discovers its single-column foreign keys from
//! the schema registry, dispatches a verify request to each referenced
//! entity's verifier, and folds the outcomes through the status lattice.
//! Composite keys never reach this point; the schema rejects them at
//! registration.
//!
//! Failure mapping is deliberate and asymmetric:
//! - no handler at the referenced kind's address is vacuous success, since
//!   a kind without a registered verifier has nothing to say;
//! - a timeout or a handler that vanished without replying is also treated
//!   as success for prerequisites (fail-open);
//! - a handler that executed and failed is a real `Invalid`, recorded as a
//!   diagnostic against the entity whose prerequisite walk failed.

use futures_util::future::join_all;
use serde_json::json;

use gradebus_bus::BusError;
use gradebus_storage::create_diagnostic;
use gradebus_types::{
    merge, verify_address, EntityRecord, EntityRef, ForeignKey, VerificationData, VerifyRequest,
};

use crate::verifier::CheckCtx;

/// Verification outcomes of every resolvable prerequisite of `record`, in
/// foreign-key declaration order. Null and absent FK columns are skipped.
async fn prerequisite_results(
    record: &EntityRecord,
    skipped_columns: &[&str],
    path: &[EntityRef],
    ctx: &CheckCtx,
) -> Result<Vec<VerificationData>, gradebus_storage::StorageError> {
    let references: Vec<(&ForeignKey, gradebus_types::EntityId)> = ctx
        .schema
        .foreign_keys(&record.kind)
        .iter()
        .filter(|fk| !skipped_columns.contains(&fk.column.as_str()))
        .filter_map(|fk| record.foreign_id(&fk.column).map(|id| (fk, id)))
        .collect();

    let checks = references
        .into_iter()
        .map(|(fk, id)| verify_one(record, fk, id, path, ctx));

    join_all(checks).await.into_iter().collect()
}

/// Fold of [`prerequisite_results`] through the lattice meet. An entity with
/// no foreign keys vacuously yields `Processed`.
pub(crate) async fn check_prerequisites(
    record: &EntityRecord,
    skipped_columns: &[&str],
    path: &[EntityRef],
    ctx: &CheckCtx,
) -> Result<VerificationData, gradebus_storage::StorageError> {
    let results = prerequisite_results(record, skipped_columns, path, ctx).await?;
    Ok(results
        .iter()
        .fold(VerificationData::processed(), |acc, r| merge(&acc, r)))
}

async fn verify_one(
    record: &EntityRecord,
    fk: &ForeignKey,
    id: gradebus_types::EntityId,
    path: &[EntityRef],
    ctx: &CheckCtx,
) -> Result<VerificationData, gradebus_storage::StorageError> {
    let address = verify_address(&fk.references);
    let request = VerifyRequest {
        id,
        path: path.to_vec(),
    };
    let payload = serde_json::to_value(&request)
        .expect("verify request serialization is infallible");

    match ctx.bus.request(&address, payload, ctx.rpc_timeout).await {
        Ok(reply) => match serde_json::from_value::<VerificationData>(reply) {
            Ok(data) => Ok(data),
            Err(e) => {
                let diag = create_diagnostic(
                    ctx.storage.as_ref(),
                    &record.kind,
                    record.id,
                    json!({
                        "error": format!("malformed verify reply from {address}: {e}"),
                        "column": fk.column,
                    }),
                )
                .await?;
                Ok(VerificationData::invalid_one(diag))
            }
        },
        // A kind with no registered verifier has nothing to check.
        Err(BusError::NoHandler { .. }) => Ok(VerificationData::processed()),
        // Fail-open: an unanswered prerequisite is not a failure.
        Err(e @ (BusError::Timeout { .. } | BusError::NoReply { .. })) => {
            tracing::debug!(
                "prerequisite {}.{} for {} {} unanswered, failing open: {e}",
                record.kind,
                fk.column,
                record.kind,
                record.id
            );
            Ok(VerificationData::processed())
        }
        // The handler executed and failed: a real verification failure.
        Err(e @ (BusError::Recipient { .. } | BusError::DuplicateHandler { .. })) => {
            let diag = create_diagnostic(
                ctx.storage.as_ref(),
                &record.kind,
                record.id,
                json!({
                    "error": format!("prerequisite verify at {address} failed: {e}"),
                    "column": fk.column,
                }),
            )
            .await?;
            Ok(VerificationData::invalid_one(diag))
        }
    }
}
