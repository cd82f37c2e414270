//! gradebus - demo wiring of the verification pipeline.
//!
//! Builds a self-contained deployment on one bus: in-memory storage seeded
//! with a course -> project -> submission chain, stub build and VCS
//! services, one verifier per entity kind, and the delay scheduler. The
//! submission starts with a pending repository clone, so the run exercises
//! the whole loop: verify settles `NotReady`, the caller schedules a
//! re-verify through the timetable, the clone completes, and the forwarded
//! result comes back `Processed`, after which the process side triggers a
//! build exactly once.

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use gradebus_bus::Bus;
use gradebus_engine::checks::{CourseCheck, ProjectCheck, SubmissionCheck, external};
use gradebus_engine::{
    CheckCtx, EngineConfig, EntityCheck, Timetable, Verifier, checks, load_config,
    schedule_reverify,
};
use gradebus_storage::{MemoryStorage, Storage};
use gradebus_types::{
    EntityId, EntityKind, Schema, VerificationData, VerifyRequest, process_address, verify_address,
};

/// Re-verify attempts before the demo gives up on a `NotReady` entity.
const MAX_RETRIES: usize = 10;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_engine_config() -> Result<EngineConfig> {
    match env::args().nth(1) {
        Some(path) => load_config(&path).with_context(|| format!("loading config from {path}")),
        // Demo defaults: a tight tick so the retry loop finishes promptly.
        None => Ok(EngineConfig {
            tick_interval_ms: 250,
            rpc_timeout_ms: 2_000,
            cache_ttl_secs: 300,
        }),
    }
}

fn build_schema() -> Result<Schema> {
    let mut schema = Schema::new();
    schema.register(checks::course_kind(), vec![])?;
    schema.register(
        checks::project_kind(),
        vec![(vec!["course_id".to_string()], checks::course_kind())],
    )?;
    schema.register(
        checks::submission_kind(),
        vec![
            (vec!["project_id".to_string()], checks::project_kind()),
            (
                vec!["parent_submission_id".to_string()],
                checks::submission_kind(),
            ),
        ],
    )?;
    schema.register(checks::build_kind(), vec![])?;
    Ok(schema)
}

fn seed_entities(storage: &MemoryStorage) -> EntityId {
    storage.seed(
        &checks::course_kind(),
        EntityId::new(1),
        fields(&[("name", json!("rust101"))]),
    );
    storage.seed(
        &checks::project_kind(),
        EntityId::new(1),
        fields(&[
            ("name", json!("hw-parsers")),
            ("course_id", json!(1)),
            ("repo_url", json!("https://git.example.com/hw-parsers.git")),
            ("repo_type", json!("git")),
        ]),
    );
    let submission = EntityId::new(1);
    storage.seed(
        &checks::submission_kind(),
        submission,
        fields(&[("project_id", json!(1))]),
    );
    submission
}

/// Stub external collaborators. The clone reports `pending` for its first
/// two polls, then `done`, which is what forces the retry path.
fn serve_external_stubs(bus: &Bus) -> Result<()> {
    bus.serve(external::BUILD_ENDPOINT_HEAD, |_| async {
        Ok(json!({"status": 200}))
    })?;
    bus.serve(external::BUILD_SCHEDULER_HEAD, |_| async {
        Ok(json!({"status": 200}))
    })?;
    bus.serve(external::BUILD_PROJECT_CREATE, |payload| async move {
        tracing::info!("build service registered project: {payload}");
        Ok(json!({"result": "ok"}))
    })?;
    bus.serve(external::BUILD_SUBMISSION_REQUEST, |payload| async move {
        tracing::info!("build service accepted build request: {payload}");
        Ok(json!({"build_id": 1}))
    })?;

    let polls = Arc::new(AtomicUsize::new(0));
    bus.serve(external::VCS_CLONE, move |_| {
        let polls = Arc::clone(&polls);
        async move {
            let n = polls.fetch_add(1, Ordering::SeqCst);
            let status = if n < 2 { "pending" } else { "done" };
            Ok(json!({"status": status}))
        }
    })?;
    Ok(())
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn spawn_verifier(
    kind: EntityKind,
    check: Box<dyn EntityCheck>,
    ctx: CheckCtx,
    config: &EngineConfig,
) -> Result<()> {
    Verifier::new(kind, check, ctx, config.cache_ttl()).spawn()?;
    Ok(())
}

async fn rpc(bus: &Bus, address: &str, id: EntityId, config: &EngineConfig) -> Result<VerificationData> {
    let payload = serde_json::to_value(VerifyRequest::new(id))?;
    let reply = bus.request(address, payload, config.rpc_timeout()).await?;
    Ok(serde_json::from_value(reply)?)
}

/// Verify `(kind, id)`, rescheduling through the timetable while the result
/// is `NotReady`. Returns the first settled result.
async fn verify_until_settled(
    bus: &Bus,
    kind: &EntityKind,
    id: EntityId,
    config: &EngineConfig,
) -> Result<VerificationData> {
    let mut data = rpc(bus, &verify_address(kind), id, config).await?;
    if data.is_processed() || data.is_invalid() {
        return Ok(data);
    }

    let mut results = bus.register("verify.results")?;
    for attempt in 1..=MAX_RETRIES {
        tracing::info!("{kind} {id} not ready, scheduling re-verify (attempt {attempt})");
        schedule_reverify(
            bus,
            kind,
            id,
            Utc::now() + chrono::Duration::milliseconds(300),
            Some("verify.results"),
            config.rpc_timeout(),
        )
        .await?;
        let forwarded = results
            .recv()
            .await
            .context("scheduler dropped the forwarded verify result")?;
        data = serde_json::from_value(forwarded.payload)?;
        if data.is_processed() || data.is_invalid() {
            return Ok(data);
        }
    }
    bail!("{kind} {id} still not ready after {MAX_RETRIES} re-verifies")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = load_engine_config()?;

    let bus = Bus::new();
    let storage = Arc::new(MemoryStorage::new());
    let schema = Arc::new(build_schema()?);
    let submission_id = seed_entities(&storage);
    serve_external_stubs(&bus)?;

    let ctx = CheckCtx {
        bus: bus.clone(),
        storage: Arc::clone(&storage) as Arc<dyn Storage>,
        schema: Arc::clone(&schema),
        rpc_timeout: config.rpc_timeout(),
    };
    spawn_verifier(checks::course_kind(), Box::new(CourseCheck), ctx.clone(), &config)?;
    spawn_verifier(checks::project_kind(), Box::new(ProjectCheck), ctx.clone(), &config)?;
    spawn_verifier(
        checks::submission_kind(),
        Box::new(SubmissionCheck::default()),
        ctx,
        &config,
    )?;

    let timetable = Timetable::new(bus.clone(), config.rpc_timeout());
    timetable.spawn(config.tick_interval())?;

    let submission = checks::submission_kind();
    let verified = verify_until_settled(&bus, &submission, submission_id, &config).await?;
    tracing::info!("submission {submission_id} verified: {:?}", verified.status);
    if !verified.is_processed() {
        bail!("submission {submission_id} settled {:?}: {:?}", verified.status, verified.errors);
    }

    let processed = rpc(&bus, &process_address(&submission), submission_id, &config).await?;
    tracing::info!("submission {submission_id} processed: {:?}", processed.status);
    tracing::info!(
        "build records created: {}",
        storage.count(&checks::build_kind())
    );
    Ok(())
}
