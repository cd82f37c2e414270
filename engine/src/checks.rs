//! Entity-specific checks for the course → project → submission graph.
//!
//! External collaborators (the build service and the VCS fetcher) are
//! reached through bus addresses; their internals are out of scope here.
//! Unlike prerequisite fan-out, these checks are required: an unreachable
//! service or a failed probe is a real `Invalid`, persisted as a diagnostic
//! against the entity.

use std::collections::HashSet;
use std::sync::Mutex;

use serde_json::{json, Value};

use gradebus_storage::{create_diagnostic, StorageError};
use gradebus_types::{EntityId, EntityKind, EntityRecord, VerificationData};

use crate::verifier::{CheckCtx, CheckFut, EntityCheck};

/// Addresses of the external services the checks poll.
pub mod external {
    /// HEAD-style probe of a course's build endpoint. Reply: `{"status": n}`.
    pub const BUILD_ENDPOINT_HEAD: &str = "build.endpoint.head";
    /// HEAD-style probe of a project's build scheduler. Reply: `{"status": n}`.
    pub const BUILD_SCHEDULER_HEAD: &str = "build.scheduler.head";
    /// Register a project with the build service.
    pub const BUILD_PROJECT_CREATE: &str = "build.project.create";
    /// Trigger a build for a submission. Reply: `{"build_id": n}`.
    pub const BUILD_SUBMISSION_REQUEST: &str = "build.submission.request";
    /// Clone-state poll for a repository. Reply:
    /// `{"status": "pending" | "done" | "failed"}`.
    pub const VCS_CLONE: &str = "vcs.clone";
}

const HTTP_OK: i64 = 200;

#[must_use]
pub fn course_kind() -> EntityKind {
    EntityKind::new("course").expect("static kind is valid")
}

#[must_use]
pub fn project_kind() -> EntityKind {
    EntityKind::new("project").expect("static kind is valid")
}

#[must_use]
pub fn submission_kind() -> EntityKind {
    EntityKind::new("submission").expect("static kind is valid")
}

#[must_use]
pub fn build_kind() -> EntityKind {
    EntityKind::new("build").expect("static kind is valid")
}

fn field_str<'a>(record: &'a EntityRecord, key: &str) -> &'a str {
    record.fields.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Probe an external endpoint; `Ok(true)` means it answered HTTP OK. Bus
/// failures surface as `Err` so callers can fail closed.
async fn head_ok(ctx: &CheckCtx, address: &str, payload: Value) -> Result<bool, String> {
    match ctx.bus.request(address, payload, ctx.rpc_timeout).await {
        Ok(reply) => Ok(reply["status"].as_i64() == Some(HTTP_OK)),
        Err(e) => Err(e.to_string()),
    }
}

async fn invalid_with_diagnostic(
    ctx: &CheckCtx,
    record: &EntityRecord,
    data: Value,
) -> Result<VerificationData, StorageError> {
    let diag = create_diagnostic(ctx.storage.as_ref(), &record.kind, record.id, data).await?;
    Ok(VerificationData::invalid_one(diag))
}

/// A course is usable when its build endpoint exists.
#[derive(Debug, Default)]
pub struct CourseCheck;

impl CourseCheck {
    async fn probe(
        &self,
        record: &EntityRecord,
        ctx: &CheckCtx,
    ) -> Result<VerificationData, StorageError> {
        let name = field_str(record, "name");
        match head_ok(
            ctx,
            external::BUILD_ENDPOINT_HEAD,
            json!({ "endpoint": name }),
        )
        .await
        {
            Ok(true) => Ok(VerificationData::processed()),
            Ok(false) => {
                invalid_with_diagnostic(
                    ctx,
                    record,
                    json!({ "error": format!("build endpoint for course {name} not available") }),
                )
                .await
            }
            Err(e) => {
                invalid_with_diagnostic(
                    ctx,
                    record,
                    json!({ "error": format!("build endpoint probe failed: {e}") }),
                )
                .await
            }
        }
    }
}

impl EntityCheck for CourseCheck {
    fn verify<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(self.probe(record, ctx))
    }

    // Processing a course is re-verifying it; there is nothing else to set
    // up on the build side.
    fn process<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(self.probe(record, ctx))
    }
}

/// A project is usable when its build scheduler exists; processing
/// registers it with the build service.
#[derive(Debug, Default)]
pub struct ProjectCheck;

impl ProjectCheck {
    async fn register_project(
        &self,
        record: &EntityRecord,
        ctx: &CheckCtx,
    ) -> Result<VerificationData, StorageError> {
        let Some(course_id) = record.foreign_id("course_id") else {
            return invalid_with_diagnostic(
                ctx,
                record,
                json!({ "error": "project has no course" }),
            )
            .await;
        };
        let Some(course) = ctx.storage.find_by_id(&course_kind(), course_id).await? else {
            return invalid_with_diagnostic(
                ctx,
                record,
                json!({ "error": format!("course {course_id} not found") }),
            )
            .await;
        };

        let payload = json!({
            "project_id": record.id,
            "course": field_str(&course, "name"),
            "name": field_str(record, "name"),
            "repo_url": field_str(record, "repo_url"),
            "repo_type": field_str(record, "repo_type"),
        });
        match ctx
            .bus
            .request(external::BUILD_PROJECT_CREATE, payload, ctx.rpc_timeout)
            .await
        {
            Ok(_) => Ok(VerificationData::processed()),
            Err(e) => {
                invalid_with_diagnostic(
                    ctx,
                    record,
                    json!({ "error": format!("error in build service: {e}") }),
                )
                .await
            }
        }
    }
}

impl EntityCheck for ProjectCheck {
    fn verify<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(async move {
            let name = field_str(record, "name");
            match head_ok(
                ctx,
                external::BUILD_SCHEDULER_HEAD,
                json!({ "scheduler": name }),
            )
            .await
            {
                Ok(true) => Ok(VerificationData::processed()),
                Ok(false) => {
                    invalid_with_diagnostic(
                        ctx,
                        record,
                        json!({ "error": format!("build scheduler for {name} not available") }),
                    )
                    .await
                }
                Err(e) => {
                    invalid_with_diagnostic(
                        ctx,
                        record,
                        json!({ "error": format!("build scheduler probe failed: {e}") }),
                    )
                    .await
                }
            }
        })
    }

    fn process<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(self.register_project(record, ctx))
    }
}

/// A submission is usable once its repository clone has completed;
/// processing triggers a build exactly once.
#[derive(Debug, Default)]
pub struct SubmissionCheck {
    /// Submissions whose build was already triggered by this worker. The
    /// storage contract has no query-by-field, so idempotency is kept here;
    /// a restarted worker re-triggers at most one extra build, which the
    /// build service deduplicates by submission id.
    triggered: Mutex<HashSet<EntityId>>,
}

impl SubmissionCheck {
    async fn clone_status(
        &self,
        record: &EntityRecord,
        ctx: &CheckCtx,
    ) -> Result<VerificationData, StorageError> {
        let Some(project_id) = record.foreign_id("project_id") else {
            return invalid_with_diagnostic(
                ctx,
                record,
                json!({ "failure": "submission has no project" }),
            )
            .await;
        };
        let Some(project) = ctx.storage.find_by_id(&project_kind(), project_id).await? else {
            return invalid_with_diagnostic(
                ctx,
                record,
                json!({ "failure": format!("project {project_id} not found") }),
            )
            .await;
        };

        let payload = json!({
            "url": field_str(&project, "repo_url"),
            "repo_type": field_str(&project, "repo_type"),
        });
        match ctx
            .bus
            .request(external::VCS_CLONE, payload, ctx.rpc_timeout)
            .await
        {
            Ok(reply) => match reply["status"].as_str() {
                Some("done") => Ok(VerificationData::processed()),
                Some("pending") => Ok(VerificationData::not_ready()),
                _ => {
                    invalid_with_diagnostic(
                        ctx,
                        record,
                        json!({
                            "failure": "fetching remote repository failed",
                            "details": reply,
                        }),
                    )
                    .await
                }
            },
            Err(e) => {
                invalid_with_diagnostic(
                    ctx,
                    record,
                    json!({ "failure": format!("vcs service unreachable: {e}") }),
                )
                .await
            }
        }
    }

    async fn trigger_build(
        &self,
        record: &EntityRecord,
        ctx: &CheckCtx,
    ) -> Result<VerificationData, StorageError> {
        let vcs = self.clone_status(record, ctx).await?;
        if !vcs.is_processed() {
            return Ok(vcs);
        }

        if self
            .triggered
            .lock()
            .expect("triggered set poisoned")
            .contains(&record.id)
        {
            return Ok(VerificationData::processed());
        }

        match ctx
            .bus
            .request(
                external::BUILD_SUBMISSION_REQUEST,
                json!({ "submission_id": record.id }),
                ctx.rpc_timeout,
            )
            .await
        {
            Ok(ack) => {
                let mut fields = serde_json::Map::new();
                fields.insert("submission_id".to_string(), Value::from(record.id.value()));
                fields.insert("build_request_id".to_string(), ack["build_id"].clone());
                ctx.storage.create(&build_kind(), fields).await?;
                self.triggered
                    .lock()
                    .expect("triggered set poisoned")
                    .insert(record.id);
                Ok(VerificationData::processed())
            }
            Err(e) => {
                invalid_with_diagnostic(
                    ctx,
                    record,
                    json!({
                        "failure": format!("triggering build for submission {} failed", record.id),
                        "details": e.to_string(),
                    }),
                )
                .await
            }
        }
    }
}

impl EntityCheck for SubmissionCheck {
    // A parent submission may legitimately be invalid or obsolete; it is
    // history, not a prerequisite.
    fn skipped_references(&self) -> &[&str] {
        &["parent_submission_id"]
    }

    fn verify<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(self.clone_status(record, ctx))
    }

    fn process<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(self.trigger_build(record, ctx))
    }
}
