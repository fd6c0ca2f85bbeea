#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Utc;
use concord_agent::{ToolDescriptor, ToolProvider, ToolRegistry, UPSTREAM_PREFIX};
use concord_core::*;
use concord_cost::{BudgetPolicy, CostController};
use concord_mesh::{CognitiveMesh, MEMORY_AGENT};
use concord_orchestrator::*;
use concord_store::{Archive, FileStateStore, MemoryStateStore, StateStore};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Answers after an optional delay; counts invocations.
struct FixtureTool {
    descriptor: ToolDescriptor,
    response: String,
    latency: Duration,
    calls: AtomicU32,
}

impl FixtureTool {
    fn new(name: &str, response: &str) -> Arc<Self> {
        Self::slow(name, response, Duration::ZERO)
    }

    fn slow(name: &str, response: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ToolDescriptor::new(name, "fixture").with_domains(vec![name.to_string()]),
            response: response.to_string(),
            latency,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for FixtureTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: serde_json::Value) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(format!(
            "{} ({})",
            self.response,
            params["query"].as_str().unwrap_or_default()
        ))
    }
}

fn registry(tools: &[Arc<FixtureTool>]) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool.clone());
    }
    Arc::new(registry)
}

fn config() -> ConcordConfig {
    ConcordConfig {
        prefer_local_when_available: true,
        iteration_backoff_ms: 1,
        ..ConcordConfig::default()
    }
}

fn orchestrator(
    config: ConcordConfig,
    store: Arc<dyn StateStore>,
    tools: Arc<ToolRegistry>,
) -> Orchestrator {
    Orchestrator::builder(config, store, tools).build().unwrap()
}

async fn stored_items(store: &dyn StateStore, ids: &[uuid::Uuid]) -> Vec<WorkSpecification> {
    let mut items = Vec::new();
    for id in ids {
        items.push(store.load_work(*id).await.unwrap().unwrap());
    }
    items
}

fn assert_legal_history(spec: &WorkSpecification) {
    let mut current = WorkStatus::Pending;
    for step in spec.status_history() {
        assert_eq!(step.from, current, "work {} history is not contiguous", spec.id);
        assert!(
            step.from.can_transition_to(step.to),
            "work {} made an illegal transition {} -> {}",
            spec.id,
            step.from,
            step.to
        );
        current = step.to;
    }
    assert_eq!(current, spec.status());
}

fn never_started(spec: &WorkSpecification) -> bool {
    spec.status_history()
        .iter()
        .all(|t| t.to != WorkStatus::InProgress)
}

// ---------------------------------------------------------------------------
// 1. Direct requests are answered inline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn arithmetic_is_answered_without_work_items() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let orch = orchestrator(
        ConcordConfig {
            quality_mode: QualityMode::Economy,
            ..config()
        },
        store.clone(),
        registry(&[]),
    );

    let response = orch.handle(Request::new("What's 2+2?")).await;

    assert_eq!(response.outcome, Outcome::Direct);
    assert_eq!(response.strategy, Strategy::Direct);
    assert!(!response.requires_confirmation);
    assert!(response.work_items.is_empty());
    assert!(store.list_active().await.unwrap().is_empty());
    assert!(store.list_archive(Archive::Completed).await.unwrap().is_empty());
    assert!(store.list_archive(Archive::Failed).await.unwrap().is_empty());
}

#[tokio::test]
async fn single_tool_call_runs_inline() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let weather = FixtureTool::new("weather", "sunny");
    let orch = orchestrator(config(), store.clone(), registry(&[weather.clone()]));

    let response = orch.handle(Request::new("Weather in Lisbon?")).await;

    assert_eq!(response.outcome, Outcome::Direct);
    assert_eq!(response.response_text, "weather: sunny (Weather in Lisbon?)");
    assert_eq!(weather.calls(), 1);
    assert!(store.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn emotional_request_keeps_the_persona_voice() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let weather = FixtureTool::new("weather", "sunny");
    let orch = orchestrator(config(), store.clone(), registry(&[weather.clone()]));

    let response = orch
        .handle(Request::new("I feel lonely, can you check the weather?"))
        .await;

    assert_eq!(response.outcome, Outcome::Direct);
    assert!(response.response_text.starts_with("I'm here with you."));
    assert_eq!(weather.calls(), 0);
    assert!(response.work_items.is_empty());
}

// ---------------------------------------------------------------------------
// 2. Parallel decomposition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn four_domains_run_in_parallel() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let latency = Duration::from_millis(200);
    let tools = [
        FixtureTool::slow("flights", "LH123", latency),
        FixtureTool::slow("hotels", "Hotel Central", latency),
        FixtureTool::slow("activities", "Colosseum tour", latency),
        FixtureTool::slow("restaurants", "Da Enzo", latency),
    ];
    let orch = orchestrator(config(), store.clone(), registry(&tools));

    let started = Instant::now();
    let response = orch
        .handle(Request::new(
            "Flights, hotels, activities and restaurants in Rome",
        ))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(response.strategy, Strategy::Parallel);
    assert_eq!(response.outcome, Outcome::Complete, "{}", response.response_text);
    assert_eq!(response.work_items.len(), 4);
    assert!(response.caveats.is_empty());
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
    for tool in &tools {
        assert_eq!(tool.calls(), 1);
    }
    for line in ["flights: ", "hotels: ", "activities: ", "restaurants: "] {
        assert!(response.response_text.contains(line), "missing {line}");
    }

    let items = stored_items(store.as_ref(), &response.work_items).await;
    assert!(items.iter().all(|s| s.status() == WorkStatus::Completed));
    assert!(items.iter().all(|s| s.plan_id == response.plan_id));
    items.iter().for_each(assert_legal_history);
    assert!(store.list_active().await.unwrap().is_empty());

    let metrics = orch.monitor().aggregate_metrics().await;
    assert_eq!(metrics.dispatched, 4);
    assert_eq!(metrics.completed, 4);
    assert_eq!(orch.monitor().active_count().await, 0);
}

#[tokio::test]
async fn unsupported_tool_fails_only_its_item() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let weather = FixtureTool::new("weather", "sunny");
    let orch = orchestrator(config(), store.clone(), registry(&[weather.clone()]));

    let response = orch
        .handle(Request::new("Check my email inbox and the weather"))
        .await;

    assert_eq!(response.outcome, Outcome::Partial);
    assert!(response.response_text.starts_with("Partial result:"));
    assert!(response.caveats.iter().any(|c| c.contains("unsupported tool 'mail'")));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    let mail = items.iter().find(|s| s.domain.as_deref() == Some("mail")).unwrap();
    assert_eq!(mail.status(), WorkStatus::Failed);
    assert!(never_started(mail));
    items.iter().for_each(assert_legal_history);
}

// ---------------------------------------------------------------------------
// 3. Hybrid plans feed upstream results into synthesis
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hybrid_plan_synthesizes_after_dependencies() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let tools = [
        FixtureTool::new("weather", "sunny"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = orchestrator(config(), store.clone(), registry(&tools));

    let response = orch
        .handle(Request::new("Check the weather then pick hotels based on it"))
        .await;

    assert_eq!(response.strategy, Strategy::Hybrid);
    assert_eq!(response.outcome, Outcome::Complete, "{}", response.response_text);
    assert_eq!(response.work_items.len(), 3);

    let items = stored_items(store.as_ref(), &response.work_items).await;
    let synthesis = items.iter().find(|s| s.kind == TaskKind::Synthesis).unwrap();
    assert_eq!(synthesis.status(), WorkStatus::Completed);
    assert!(synthesis
        .context
        .facts
        .contains_key(&format!("{UPSTREAM_PREFIX}weather")));
    assert!(synthesis
        .context
        .facts
        .contains_key(&format!("{UPSTREAM_PREFIX}hotels")));

    // Synthesis started only after both dependencies were terminal.
    let synthesis_start = synthesis.status_history()[0].at;
    for upstream in items.iter().filter(|s| s.kind != TaskKind::Synthesis) {
        let finished = upstream.status_history().last().unwrap().at;
        assert!(finished <= synthesis_start);
    }
    items.iter().for_each(assert_legal_history);
}

// ---------------------------------------------------------------------------
// 4. Crash recovery resumes from the stored checkpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recovery_resumes_in_progress_and_dispatches_pending() {
    let tmp = tempfile::tempdir().unwrap();
    let flights = FixtureTool::new("flights", "LH123");
    let hotels = FixtureTool::new("hotels", "Hotel Central");
    let plan_id = uuid::Uuid::new_v4();

    let (resumed_id, pending_id) = {
        let store = FileStateStore::new(tmp.path()).await.unwrap();
        let constraints = Constraints {
            allowed_tools: BTreeSet::from(["flights".to_string(), "hotels".to_string()]),
            ..Constraints::default()
        };
        let trip = WorkSpecification::new(TaskKind::Research, "trip to Rome")
            .with_domain("trip")
            .in_plan(plan_id)
            .with_constraints(constraints)
            .with_criteria(vec![
                SuccessCriterion::tool_succeeded("flights"),
                SuccessCriterion::tool_succeeded("hotels"),
            ]);
        let mut trip = store.insert_work(&trip).await.unwrap();
        trip.assign(Tier::Local).unwrap();
        let mut trip = store.update_work(&trip).await.unwrap();
        trip.begin().unwrap();
        let mut trip = store.update_work(&trip).await.unwrap();
        let mut cp = Checkpoint::at(2);
        cp.record_output("flights", "LH123 (trip to Rome)");
        trip.record_checkpoint(2, cp).unwrap();
        let trip = store.update_work(&trip).await.unwrap();

        let stay = WorkSpecification::new(TaskKind::Research, "hotel in Rome")
            .with_domain("hotels")
            .in_plan(plan_id)
            .with_constraints(Constraints {
                allowed_tools: BTreeSet::from(["hotels".to_string()]),
                ..Constraints::default()
            })
            .with_criteria(vec![SuccessCriterion::tool_succeeded("hotels")]);
        let stay = store.insert_work(&stay).await.unwrap();
        (trip.id, stay.id)
    };

    // A new process over the same data directory.
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(tmp.path()).await.unwrap());
    let orch = orchestrator(config(), store.clone(), registry(&[flights.clone(), hotels.clone()]));
    let report = orch.recover().await.unwrap();

    assert_eq!(report.resumed, 1);
    assert!(report.awaiting_confirmation.is_empty());
    assert_eq!(report.responses.len(), 1);
    assert_eq!(report.responses[0].outcome, Outcome::Complete);
    assert_eq!(report.responses[0].plan_id, Some(plan_id));

    let resumed = store.load_work(resumed_id).await.unwrap().unwrap();
    assert_eq!(resumed.status(), WorkStatus::Completed);
    assert_eq!(resumed.result().unwrap().iterations, 3);
    assert_eq!(flights.calls(), 0);
    // Once for the resumed item, once for the pending one.
    assert_eq!(hotels.calls(), 2);

    let pending = store.load_work(pending_id).await.unwrap().unwrap();
    assert_eq!(pending.status(), WorkStatus::Completed);
    assert_legal_history(&resumed);
    assert_legal_history(&pending);
    assert!(store.list_active().await.unwrap().is_empty());

    // Nothing left to do on a second pass.
    let again = orch.recover().await.unwrap();
    assert!(again.responses.is_empty());
}

// ---------------------------------------------------------------------------
// 5. Cost gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_budget_denies_without_starting_work() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let tools = [
        FixtureTool::new("flights", "LH123"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = orchestrator(
        ConcordConfig {
            monthly_budget: 0.0,
            ..config()
        },
        store.clone(),
        registry(&tools),
    );

    let response = orch
        .handle(Request::new("Flights and hotels for Rome").requiring_remote())
        .await;

    assert_eq!(response.outcome, Outcome::Denied);
    assert!(!response.requires_confirmation);
    assert_eq!(response.work_items.len(), 2);
    assert!(tools.iter().all(|t| t.calls() == 0));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    for item in &items {
        assert_eq!(item.status(), WorkStatus::Failed);
        assert!(never_started(item));
        assert!(item.result().unwrap().summary.contains("budget denied"));
        assert_legal_history(item);
    }
    assert_eq!(orch.cost_report().await.unwrap().spent, 0.0);
}

#[tokio::test]
async fn remote_request_over_partial_budget_asks_instead_of_denying() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let tools = [
        FixtureTool::new("flights", "LH123"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = orchestrator(
        ConcordConfig {
            monthly_budget: 0.05,
            ..config()
        },
        store.clone(),
        registry(&tools),
    );

    // The first remote item fits; the second would overrun what is left.
    let response = orch
        .handle(Request::new("Flights and hotels for Rome").requiring_remote())
        .await;

    assert_eq!(response.outcome, Outcome::AwaitingConfirmation);
    assert!(response.requires_confirmation);
    let details = response.confirmation_details.clone().unwrap();
    assert_eq!(details.charges.len(), 1);
    assert_eq!(details.charges[0].tier, Tier::Remote);
    assert!(details.charges[0].reason.contains("remaining monthly budget"));
    assert!(tools.iter().all(|t| t.calls() == 0));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    assert!(items.iter().all(|s| s.status() == WorkStatus::Pending));
}

#[tokio::test]
async fn estimates_use_spend_history_from_earlier_runs() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let config = ConcordConfig {
        confirmation_threshold: 0.01,
        ..config()
    };

    // A previous process recorded one remote research item at $0.12.
    let earlier = CostController::new(store.clone(), BudgetPolicy::from(&config));
    let mut past = WorkSpecification::new(TaskKind::Research, "earlier trip");
    past.tier = Some(Tier::Remote);
    earlier.record_actual(&past, 0.12).await.unwrap();

    let tools = [
        FixtureTool::new("flights", "LH123"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = orchestrator(config, store.clone(), registry(&tools));
    let response = orch
        .handle(Request::new("Flights and hotels for Rome").requiring_remote())
        .await;

    let details = response.confirmation_details.unwrap();
    assert_eq!(details.charges.len(), 2);
    // (base 0.04 + 1 * 0.12) / 2
    for charge in &details.charges {
        assert!((charge.amount - 0.08).abs() < 1e-9, "{}", charge.amount);
    }
}

#[tokio::test]
async fn expensive_plan_waits_for_confirmation() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let tools = [
        FixtureTool::new("flights", "LH123"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = orchestrator(
        ConcordConfig {
            confirmation_threshold: 0.01,
            ..config()
        },
        store.clone(),
        registry(&tools),
    );

    let response = orch
        .handle(Request::new("Flights and hotels for Rome").requiring_remote())
        .await;

    assert_eq!(response.outcome, Outcome::AwaitingConfirmation);
    assert!(response.requires_confirmation);
    let details = response.confirmation_details.clone().unwrap();
    assert_eq!(details.charges.len(), 2);
    assert!((details.total_estimate - 0.08).abs() < 1e-9);
    assert!(details.charges.iter().all(|c| c.tier == Tier::Remote));
    assert!(tools.iter().all(|t| t.calls() == 0));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    assert!(items.iter().all(|s| s.status() == WorkStatus::Pending));
    assert!(items.iter().all(|s| s.awaiting_confirmation()));

    let confirmed = orch.confirm(details.plan_id).await;
    assert_eq!(confirmed.outcome, Outcome::Complete, "{}", confirmed.response_text);

    let items = stored_items(store.as_ref(), &response.work_items).await;
    for item in &items {
        assert_eq!(item.status(), WorkStatus::Completed);
        assert_eq!(item.effective_tier(), Tier::Remote);
        assert!(item.confirmation.is_some());
        assert_legal_history(item);
    }

    let report = orch.cost_report().await.unwrap();
    assert!((report.spent - 0.08).abs() < 1e-9);
    assert_eq!(report.per_task.len(), 2);
}

#[tokio::test]
async fn declined_plan_never_runs() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let tools = [
        FixtureTool::new("flights", "LH123"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = orchestrator(
        ConcordConfig {
            confirmation_threshold: 0.01,
            ..config()
        },
        store.clone(),
        registry(&tools),
    );

    let response = orch
        .handle(Request::new("Flights and hotels for Rome").requiring_remote())
        .await;
    let plan_id = response.plan_id.unwrap();

    let declined = orch.decline(plan_id).await;
    assert_eq!(declined.outcome, Outcome::Cancelled);
    assert!(tools.iter().all(|t| t.calls() == 0));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    for item in &items {
        assert_eq!(item.status(), WorkStatus::Failed);
        assert!(never_started(item));
        assert_legal_history(item);
    }
}

// ---------------------------------------------------------------------------
// 6. Join timeout and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_timeout_yields_partial_result() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let latency = Duration::from_millis(1500);
    let tools = [
        FixtureTool::slow("flights", "LH123", latency),
        FixtureTool::slow("hotels", "Hotel Central", latency),
    ];
    let orch = orchestrator(
        ConcordConfig {
            max_parallel_agents: 1,
            join_timeout_secs: 1,
            ..config()
        },
        store.clone(),
        registry(&tools),
    );

    let response = orch.handle(Request::new("Flights and hotels for Rome")).await;

    assert_eq!(response.outcome, Outcome::Partial, "{}", response.response_text);
    assert!(response.caveats.iter().any(|c| c.contains("timed out")));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    let skipped: Vec<_> = items
        .iter()
        .filter(|s| {
            s.result()
                .and_then(|r| r.reason.as_deref())
                .is_some_and(|r| r == "timed out before dispatch")
        })
        .collect();
    assert_eq!(skipped.len(), 1);
    assert!(never_started(skipped[0]));
    assert!(items.iter().all(|s| s.is_terminal()));
    items.iter().for_each(assert_legal_history);
    // Only the dispatched item ever called its tool.
    assert_eq!(tools.iter().map(|t| t.calls()).sum::<u32>(), 1);
}

#[tokio::test]
async fn cancelling_a_running_plan() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let latency = Duration::from_millis(400);
    let tools = [
        FixtureTool::slow("flights", "LH123", latency),
        FixtureTool::slow("hotels", "Hotel Central", latency),
    ];
    let orch = orchestrator(config(), store.clone(), registry(&tools));

    let canceller = async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let active = store.list_active().await.unwrap();
            if let Some(plan_id) = active.iter().find_map(|s| s.plan_id) {
                if orch.cancel(plan_id) {
                    return plan_id;
                }
            }
        }
    };
    let (response, plan_id) = tokio::join!(
        orch.handle(Request::new("Flights and hotels for Rome")),
        canceller
    );

    assert_eq!(response.plan_id, Some(plan_id));
    assert_eq!(response.outcome, Outcome::Cancelled);
    assert!(!orch.cancel(plan_id));

    let items = stored_items(store.as_ref(), &response.work_items).await;
    assert!(items.iter().all(|s| s.is_terminal()));
    items.iter().for_each(assert_legal_history);
}

// ---------------------------------------------------------------------------
// 7. Context comes from the cognitive mesh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn work_items_copy_filtered_mesh_context() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let mesh = CognitiveMesh::builder(store.clone(), CognitiveConfig::default())
        .with_default_agents()
        .build()
        .unwrap();
    let board = mesh.board();
    board
        .publish(CognitiveSnapshot {
            agent_id: MEMORY_AGENT.to_string(),
            version: 1,
            data: serde_json::json!({
                "facts": {
                    "flights.airline": { "value": "TAP", "strength": 1.0, "reinforced": 1 },
                    "hotels.chain": { "value": "Ibis", "strength": 1.0, "reinforced": 1 }
                }
            }),
            published_at: Utc::now(),
        })
        .unwrap();

    let tools = [
        FixtureTool::new("flights", "LH123"),
        FixtureTool::new("hotels", "Hotel Central"),
    ];
    let orch = Orchestrator::builder(config(), store.clone(), registry(&tools))
        .with_mesh(board, mesh.observer())
        .build()
        .unwrap();

    let response = orch.handle(Request::new("Flights and hotels for Rome")).await;
    assert_eq!(response.outcome, Outcome::Complete);

    let items = stored_items(store.as_ref(), &response.work_items).await;
    let flights = items.iter().find(|s| s.domain.as_deref() == Some("flights")).unwrap();
    assert_eq!(flights.context.facts["memory.flights.airline"], "TAP");
    assert!(!flights.context.facts.contains_key("memory.hotels.chain"));
    assert_eq!(flights.context.source_versions[MEMORY_AGENT], 1);
}
