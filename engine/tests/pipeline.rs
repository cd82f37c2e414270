//! End-to-end pipeline scenarios: recursive fan-out over the bus, retry
//! through the scheduler, cycle termination, and the process side.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use gradebus_bus::Bus;
use gradebus_engine::{
    schedule_reverify, CheckCtx, CheckFut, DefaultCheck, EntityCheck, Timetable, Verifier,
};
use gradebus_storage::{create_diagnostic, MemoryStorage, Storage};
use gradebus_types::{
    verify_address, EntityId, EntityKind, EntityRecord, Schema, VerificationData,
    VerificationStatus, VerifyRequest,
};

const RPC: Duration = Duration::from_secs(2);
const TTL: Duration = Duration::from_secs(300);

fn kind(s: &str) -> EntityKind {
    EntityKind::new(s).unwrap()
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn ctx(bus: &Bus, storage: &Arc<MemoryStorage>, schema: &Arc<Schema>) -> CheckCtx {
    CheckCtx {
        bus: bus.clone(),
        storage: Arc::clone(storage) as Arc<dyn Storage>,
        schema: Arc::clone(schema),
        rpc_timeout: RPC,
    }
}

async fn verify_over_bus(bus: &Bus, target: &EntityKind, id: i64) -> VerificationData {
    let reply = bus
        .request(
            &verify_address(target),
            serde_json::to_value(VerifyRequest::new(EntityId::new(id))).unwrap(),
            RPC,
        )
        .await
        .unwrap();
    serde_json::from_value(reply).unwrap()
}

/// Entity check that polls an external readiness flag over the bus.
struct ReadinessCheck;

impl EntityCheck for ReadinessCheck {
    fn verify<'a>(&'a self, _record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(async move {
            match ctx.bus.request("ready.flag", json!({}), ctx.rpc_timeout).await {
                Ok(reply) if reply["ready"] == json!(true) => Ok(VerificationData::processed()),
                _ => Ok(VerificationData::not_ready()),
            }
        })
    }
}

#[tokio::test]
async fn not_ready_then_retry_through_scheduler_settles_processed() {
    let bus = Bus::new();
    let storage = Arc::new(MemoryStorage::new());

    let course = kind("course");
    let submission = kind("submission");
    let mut schema = Schema::new();
    schema.register(course.clone(), vec![]).unwrap();
    schema
        .register(
            submission.clone(),
            vec![(vec!["course_id".to_string()], course.clone())],
        )
        .unwrap();
    let schema = Arc::new(schema);

    storage.seed(&course, EntityId::new(1), Map::new());
    storage.seed(
        &submission,
        EntityId::new(2),
        fields(&[("course_id", json!(1))]),
    );

    // External readiness flag: initially false.
    let ready = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ready);
    bus.serve("ready.flag", move |_| {
        let flag = Arc::clone(&flag);
        async move { Ok(json!({"ready": flag.load(Ordering::SeqCst)})) }
    })
    .unwrap();

    Verifier::new(
        course.clone(),
        Box::new(DefaultCheck),
        ctx(&bus, &storage, &schema),
        TTL,
    )
    .spawn()
    .unwrap();
    Verifier::new(
        submission.clone(),
        Box::new(ReadinessCheck),
        ctx(&bus, &storage, &schema),
        TTL,
    )
    .spawn()
    .unwrap();

    let timetable = Timetable::new(bus.clone(), RPC);
    timetable.spawn(Duration::from_secs(3600)).unwrap();

    // First verify: prerequisites resolve but the external flag is down.
    let first = verify_over_bus(&bus, &submission, 2).await;
    assert_eq!(first.status, VerificationStatus::NotReady);

    // Caller schedules a retry and asks for the result to be forwarded.
    let mut results = bus.register("verify.results").unwrap();
    schedule_reverify(
        &bus,
        &submission,
        EntityId::new(2),
        Utc::now() + chrono::Duration::seconds(5),
        Some("verify.results"),
        RPC,
    )
    .await
    .unwrap();
    assert_eq!(timetable.len(), 1);

    // The flag flips before the trigger time elapses.
    ready.store(true, Ordering::SeqCst);
    timetable
        .run_due(Utc::now() + chrono::Duration::seconds(10))
        .await;

    let forwarded = results.recv().await.unwrap();
    let second: VerificationData = serde_json::from_value(forwarded.payload).unwrap();
    assert_eq!(second.status, VerificationStatus::Processed);

    // And the settled result is cached: a direct verify answers Processed
    // even after the flag goes back down.
    ready.store(false, Ordering::SeqCst);
    let third = verify_over_bus(&bus, &submission, 2).await;
    assert_eq!(third.status, VerificationStatus::Processed);
}

#[tokio::test]
async fn cyclic_foreign_keys_terminate_with_a_status() {
    let bus = Bus::new();
    let storage = Arc::new(MemoryStorage::new());

    let a = kind("alpha");
    let b = kind("beta");
    let mut schema = Schema::new();
    schema
        .register(a.clone(), vec![(vec!["beta_id".to_string()], b.clone())])
        .unwrap();
    schema
        .register(b.clone(), vec![(vec!["alpha_id".to_string()], a.clone())])
        .unwrap();
    let schema = Arc::new(schema);

    storage.seed(&a, EntityId::new(1), fields(&[("beta_id", json!(2))]));
    storage.seed(&b, EntityId::new(2), fields(&[("alpha_id", json!(1))]));

    Verifier::new(a.clone(), Box::new(DefaultCheck), ctx(&bus, &storage, &schema), TTL)
        .spawn()
        .unwrap();
    Verifier::new(b.clone(), Box::new(DefaultCheck), ctx(&bus, &storage, &schema), TTL)
        .spawn()
        .unwrap();

    // Must terminate rather than recurse forever; the cycle resolves to
    // NotReady at the point where the chain closes.
    let data = verify_over_bus(&bus, &a, 1).await;
    assert_eq!(data.status, VerificationStatus::NotReady);
}

#[tokio::test]
async fn unverified_referenced_kind_fails_open() {
    let bus = Bus::new();
    let storage = Arc::new(MemoryStorage::new());

    let project = kind("project");
    let course = kind("course");
    let mut schema = Schema::new();
    schema
        .register(
            project.clone(),
            vec![(vec!["course_id".to_string()], course.clone())],
        )
        .unwrap();
    let schema = Arc::new(schema);

    storage.seed(&project, EntityId::new(1), fields(&[("course_id", json!(9))]));
    // No verifier registered for `course`, and no course record either:
    // absence of a handler is vacuous success, so the project settles on
    // its own check alone.
    Verifier::new(
        project.clone(),
        Box::new(DefaultCheck),
        ctx(&bus, &storage, &schema),
        TTL,
    )
    .spawn()
    .unwrap();

    let data = verify_over_bus(&bus, &project, 1).await;
    assert_eq!(data.status, VerificationStatus::Processed);
}

/// Entity check that always fails with a fresh diagnostic.
struct AlwaysInvalid;

impl EntityCheck for AlwaysInvalid {
    fn verify<'a>(&'a self, record: &'a EntityRecord, ctx: &'a CheckCtx) -> CheckFut<'a> {
        Box::pin(async move {
            let diag = create_diagnostic(
                ctx.storage.as_ref(),
                &record.kind,
                record.id,
                json!({"error": "broken"}),
            )
            .await?;
            Ok(VerificationData::invalid_one(diag))
        })
    }
}

#[tokio::test]
async fn invalid_prerequisites_union_their_errors() {
    let bus = Bus::new();
    let storage = Arc::new(MemoryStorage::new());

    let left = kind("left");
    let right = kind("right");
    let root = kind("root");
    let mut schema = Schema::new();
    schema.register(left.clone(), vec![]).unwrap();
    schema.register(right.clone(), vec![]).unwrap();
    schema
        .register(
            root.clone(),
            vec![
                (vec!["left_id".to_string()], left.clone()),
                (vec!["right_id".to_string()], right.clone()),
            ],
        )
        .unwrap();
    let schema = Arc::new(schema);

    storage.seed(&left, EntityId::new(1), Map::new());
    storage.seed(&right, EntityId::new(2), Map::new());
    storage.seed(
        &root,
        EntityId::new(3),
        fields(&[("left_id", json!(1)), ("right_id", json!(2))]),
    );

    for k in [&left, &right] {
        Verifier::new(
            k.clone(),
            Box::new(AlwaysInvalid),
            ctx(&bus, &storage, &schema),
            TTL,
        )
        .spawn()
        .unwrap();
    }
    Verifier::new(
        root.clone(),
        Box::new(DefaultCheck),
        ctx(&bus, &storage, &schema),
        TTL,
    )
    .spawn()
    .unwrap();

    let data = verify_over_bus(&bus, &root, 3).await;
    assert_eq!(data.status, VerificationStatus::Invalid);
    assert_eq!(data.errors.len(), 2, "both prerequisite diagnostics kept");
}

/// Check whose process side counts its invocations.
struct CountingProcess(Arc<AtomicUsize>);

impl EntityCheck for CountingProcess {
    fn process<'a>(&'a self, _record: &'a EntityRecord, _ctx: &'a CheckCtx) -> CheckFut<'a> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(VerificationData::processed()) })
    }
}

#[tokio::test]
async fn process_side_effects_run_once_for_a_settled_entity() {
    let bus = Bus::new();
    let storage = Arc::new(MemoryStorage::new());

    let course = kind("course");
    let mut schema = Schema::new();
    schema.register(course.clone(), vec![]).unwrap();
    let schema = Arc::new(schema);
    storage.seed(&course, EntityId::new(1), Map::new());

    let runs = Arc::new(AtomicUsize::new(0));
    let verifier = Verifier::new(
        course.clone(),
        Box::new(CountingProcess(Arc::clone(&runs))),
        ctx(&bus, &storage, &schema),
        TTL,
    );
    verifier.spawn().unwrap();

    for _ in 0..3 {
        let reply = bus
            .request(
                &gradebus_types::process_address(&course),
                serde_json::to_value(VerifyRequest::new(EntityId::new(1))).unwrap(),
                RPC,
            )
            .await
            .unwrap();
        let data: VerificationData = serde_json::from_value(reply).unwrap();
        assert_eq!(data.status, VerificationStatus::Processed);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
