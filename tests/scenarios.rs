//! End-to-end scenarios over a real SQLite database: ingestion, chat
//! routing, nurturing and the HTTP surface, all wired through `Harness`.

use std::sync::Arc;

use base64::Engine;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use estate_harness::config::{parse_config, Config};
use estate_harness::harness::Harness;
use estate_harness::nurture::PassOutcome;
use estate_harness::server;
use estate_harness_core::models::{Category, Lead, NurtureState, TriggerReason};

const TRANSACTIONS_CSV: &str = "price,date,buyer,seller,property,area\n\
    950000,2024-01-15,Alice,Bob,P-1,Dubai Marina\n\
    ,2024-02-01,Carol,Dan,P-2,Dubai Marina\n\
    1200000,2024-03-15,Eve,Frank,P-3,Downtown Dubai\n";

const LEGAL_TEXT: &str = "This agreement is governed by the laws of Dubai. \
    Golden visa rules: an investor who owns property worth AED 2 million shall qualify for residency. \
    The tenant shall pay rent quarterly to the landlord.";

const MARKET_TEXT: &str = "Dubai Market Report Q1 2024\n\n\
    In Dubai Marina, rental yields reached 6.8% in Q1 2024. \
    The average price in Dubai Marina was AED 1.9m. \
    Occupancy stood at 91% across Downtown Dubai. \
    There were 4,210 transactions in Dubai Marina.";

fn test_config(tmp: &TempDir) -> Config {
    let content = format!(
        r#"
[db]
path = "{}"

[ingest.retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 5

[server]
bind = "127.0.0.1:0"
"#,
        tmp.path().join("estate.sqlite").display()
    );
    parse_config(&content).unwrap()
}

async fn open(tmp: &TempDir) -> Harness {
    Harness::open(&test_config(tmp)).await.unwrap()
}

// ─── Ingestion ──────────────────────────────────────────────────────

#[tokio::test]
async fn csv_with_one_invalid_row_writes_two_records() {
    let tmp = TempDir::new().unwrap();
    let harness = open(&tmp).await;

    let result = harness.pipeline.ingest(TRANSACTIONS_CSV.as_bytes(), "csv").await.unwrap();
    assert_eq!(result.category, Category::Transaction);
    assert_eq!(result.records_written, 2);
    let validation: Vec<&String> = result
        .warnings
        .iter()
        .filter(|w| w.starts_with("validation_failed"))
        .collect();
    assert_eq!(validation.len(), 1);
    assert!(validation[0].contains("row 3"));

    let stored = harness
        .stores
        .relational
        .transactions(&Default::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|t| t.price > 0.0));
}

#[tokio::test]
async fn reingesting_identical_documents_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let harness = open(&tmp).await;

    for (text, format) in [(TRANSACTIONS_CSV, "csv"), (LEGAL_TEXT, "text"), (MARKET_TEXT, "text")] {
        let first = harness.pipeline.ingest(text.as_bytes(), format).await.unwrap();
        assert!(first.records_written + first.chunks_written > 0, "{} wrote nothing", first.category);
        let second = harness.pipeline.ingest(text.as_bytes(), format).await.unwrap();
        assert_eq!(second.records_written, 0, "{}", second.category);
        assert_eq!(second.chunks_written, 0, "{}", second.category);
    }
}

#[tokio::test]
async fn legal_text_lands_in_the_vector_store_only() {
    let tmp = TempDir::new().unwrap();
    let harness = open(&tmp).await;

    let result = harness.pipeline.ingest(LEGAL_TEXT.as_bytes(), "text").await.unwrap();
    assert_eq!(result.category, Category::Legal);
    assert_eq!(result.records_written, 0);
    assert!(result.chunks_written >= 1);
    assert!(harness
        .stores
        .relational
        .transactions(&Default::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unsupported_format_is_reported() {
    let tmp = TempDir::new().unwrap();
    let harness = open(&tmp).await;
    let err = harness.pipeline.ingest(b"PK..", "docx").await.unwrap_err();
    assert_eq!(err.code(), "unsupported_format");
}

// ─── Chat ───────────────────────────────────────────────────────────

#[tokio::test]
async fn multi_intent_turn_merges_sections_from_both_handlers() {
    let tmp = TempDir::new().unwrap();
    let harness = open(&tmp).await;
    harness.pipeline.ingest(MARKET_TEXT.as_bytes(), "text").await.unwrap();
    harness.pipeline.ingest(LEGAL_TEXT.as_bytes(), "text").await.unwrap();

    let response = harness
        .router
        .route("show rental yield in Dubai Marina and golden visa rules", "session-1")
        .await;

    assert!(response.intents.len() >= 2);
    assert_eq!(response.sections.len(), 2);
    assert_eq!(response.sections[0].handler, "market_analysis");
    assert_eq!(response.sections[1].handler, "legal");
    assert_eq!(response.degraded_count(), 0);

    let marina = response
        .entities
        .iter()
        .find(|m| m.entity.entity_id == "dubai marina")
        .expect("market area mentioned");
    assert!(marina.context.is_some());
    assert!(!harness.context.cached_refs("session-1").is_empty());
}

// ─── Nurturing ──────────────────────────────────────────────────────

#[tokio::test]
async fn inactive_warm_lead_goes_cold_once() {
    let tmp = TempDir::new().unwrap();
    let harness = open(&tmp).await;
    let now = Utc::now();

    let mut lead = Lead::new("L-40", now - Duration::days(90));
    lead.nurture_state = NurtureState::Warm;
    lead.last_contacted_at = Some(now - Duration::days(40));
    harness.stores.leads.save_lead(&lead).await.unwrap();

    let PassOutcome::Completed(first) = harness.scheduler.run_pass_at(now).await.unwrap() else {
        panic!("first pass skipped");
    };
    assert_eq!(first.transitions, 1);
    assert_eq!(first.events_emitted, 1);

    let stored = harness.stores.leads.lead("L-40").await.unwrap().unwrap();
    assert_eq!(stored.nurture_state, NurtureState::Cold);
    let pending = harness.stores.leads.pending_events().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].trigger_reason, TriggerReason::Inactivity);

    let PassOutcome::Completed(second) = harness.scheduler.run_pass_at(now).await.unwrap() else {
        panic!("second pass skipped");
    };
    assert_eq!(second.events_emitted, 0);
    assert_eq!(harness.stores.leads.pending_events().await.unwrap().len(), 1);
}

// ─── HTTP ───────────────────────────────────────────────────────────

async fn spawn_server(tmp: &TempDir) -> String {
    let harness = Arc::new(open(tmp).await);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, harness));
    format!("http://{}", addr)
}

#[tokio::test]
async fn http_ingest_chat_and_ledger() {
    let tmp = TempDir::new().unwrap();
    let base = spawn_server(&tmp).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let resp = client
        .post(format!("{}/ingest", base))
        .json(&serde_json::json!({
            "format": "csv",
            "content_base64": base64::engine::general_purpose::STANDARD.encode(TRANSACTIONS_CSV),
            "source_name": "q1.csv",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["records_written"], 2);
    assert_eq!(body["category"], "transaction");

    let resp = client
        .post(format!("{}/ingest", base))
        .json(&serde_json::json!({"format": "docx", "content_base64": "aGVsbG8="}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unsupported_format");

    let resp = client
        .post(format!("{}/chat", base))
        .json(&serde_json::json!({"session_id": "s", "utterance": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let chat: serde_json::Value = client
        .post(format!("{}/chat", base))
        .json(&serde_json::json!({"session_id": "s", "utterance": "transaction history for P-1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chat["session_id"], "s");
    assert!(!chat["sections"].as_array().unwrap().is_empty());

    let lead: serde_json::Value = client
        .post(format!("{}/leads/L-9/actions", base))
        .json(&serde_json::json!({"action": "contacted"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lead["lead_id"], "L-9");
    assert_eq!(lead["recent_contacts"], 1);

    let resp = client
        .post(format!("{}/leads/L-404/actions", base))
        .json(&serde_json::json!({"action": "closed"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let pass: serde_json::Value = client
        .post(format!("{}/nurture/run", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(pass["status"] == "completed" || pass["status"] == "skipped");

    let pending: serde_json::Value = client
        .get(format!("{}/notifications/pending", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    for event in pending["events"].as_array().unwrap() {
        let id = event["event_id"].as_str().unwrap();
        let resp = client
            .post(format!("{}/notifications/{}/delivered", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
    }
    let resp = client
        .post(format!("{}/notifications/missing/delivered", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let invalidated: serde_json::Value = client
        .post(format!("{}/context/invalidate", base))
        .json(&serde_json::json!({"entity_type": "property", "entity_id": "P-1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(invalidated["invalidated"].is_number());
}
