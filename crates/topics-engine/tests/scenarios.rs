use std::collections::HashSet;
use std::sync::Arc;

use topics_core::{ApprovalStatus, NewTopicApproval, NewTopicRequest, PhaseId, TopicSubmission};
use topics_engine::{
    EngineError, ReconciliationReport, SimilarityOracle, TopicClusterer, TopicEngine,
};
use topics_storage::{ApprovalStore, BucketFilter, MemoryTopicStore, RequestStore};
use uuid::Uuid;

fn phase(n: i32) -> PhaseId {
    PhaseId::new(n).unwrap()
}

fn engine_with_store() -> (Arc<MemoryTopicStore>, TopicEngine) {
    let store = Arc::new(MemoryTopicStore::new());
    let engine = TopicEngine::new(store.clone(), TopicClusterer::default());
    (store, engine)
}

fn submission(domain: &str, phase_no: i32, topic: &str) -> TopicSubmission {
    TopicSubmission {
        email: "student@alumni.test".into(),
        domain: domain.into(),
        topic: topic.into(),
        reason: "would like a session on this".into(),
        phase: Some(phase_no),
    }
}

fn raw_request(domain: &str, phase_no: i32, topic: &str) -> NewTopicRequest {
    submission(domain, phase_no, topic).validate().unwrap()
}

fn assert_unique_topics(approvals: &[topics_core::TopicApproval]) {
    let mut seen = HashSet::new();
    for a in approvals {
        assert!(
            seen.insert((a.phase, a.domain.clone(), a.topic.clone())),
            "duplicate approval for {:?}",
            a.topic
        );
    }
}

#[tokio::test]
async fn near_duplicate_submissions_collapse_into_one_approval() {
    let (store, engine) = engine_with_store();
    for topic in ["Computer Vision Basics", "computer vision basics", "NLP intro"] {
        let receipt = engine.submit_request(submission("AI", 5, topic)).await.unwrap();
        assert!(matches!(receipt.reconciliation, ReconciliationReport::Completed(_)));
    }

    let approvals = store
        .list_approvals(&BucketFilter::bucket("AI", phase(5)))
        .await
        .unwrap();
    assert_eq!(approvals.len(), 2);
    assert_eq!(approvals[0].topic, "Computer Vision Basics");
    assert_eq!(approvals[0].total_requested, 2);
    assert_eq!(approvals[1].topic, "NLP intro");
    assert_eq!(approvals[1].total_requested, 1);
    assert!(approvals.iter().all(|a| a.approval == ApprovalStatus::OnHold));
}

#[tokio::test]
async fn approval_status_survives_when_representative_is_unchanged() {
    let (store, engine) = engine_with_store();
    engine
        .submit_request(submission("Tech", 2, "Web Development"))
        .await
        .unwrap();
    let first = engine.get_approvals("Phase 2").await.unwrap();
    engine
        .update_approval_status(first[0].id, ApprovalStatus::Approved)
        .await
        .unwrap();

    let receipt = engine
        .submit_request(submission("Tech", 2, "web development"))
        .await
        .unwrap();
    match receipt.reconciliation {
        ReconciliationReport::Completed(outcome) => assert_eq!(outcome.carried_over, 1),
        other => panic!("unexpected reconciliation report: {other:?}"),
    }

    let approvals = store
        .list_approvals(&BucketFilter::bucket("Tech", phase(2)))
        .await
        .unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].topic, "Web Development");
    assert_eq!(approvals[0].total_requested, 2);
    assert_eq!(approvals[0].approval, ApprovalStatus::Approved);
}

#[tokio::test]
async fn approval_status_is_lost_when_representative_text_differs() {
    let (store, engine) = engine_with_store();
    store
        .insert_approvals(&[NewTopicApproval {
            phase: phase(2),
            domain: "Tech".into(),
            topic: "Web Development".into(),
            total_requested: 1,
            approval: ApprovalStatus::Approved,
        }])
        .await
        .unwrap();
    store
        .insert_request(raw_request("Tech", 2, "Web Development Bootcamp"))
        .await
        .unwrap();

    let outcome = engine.reconcile("Tech", phase(2)).await.unwrap();
    assert_eq!(outcome.carried_over, 0);

    let approvals = store
        .list_approvals(&BucketFilter::bucket("Tech", phase(2)))
        .await
        .unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].topic, "Web Development Bootcamp");
    assert_eq!(approvals[0].approval, ApprovalStatus::OnHold);
}

#[tokio::test]
async fn reconciliation_keeps_topics_unique_and_counts_complete() {
    let (store, engine) = engine_with_store();
    let topics = [
        "Intro to Rust",
        "intro to rust",
        "Intro to Rust ",
        "Databases 101",
        "databases 101",
        "Cloud Security",
    ];
    for topic in topics {
        engine.submit_request(submission("CS", 3, topic)).await.unwrap();
    }

    let approvals = store
        .list_approvals(&BucketFilter::bucket("CS", phase(3)))
        .await
        .unwrap();
    assert_unique_topics(&approvals);
    assert_eq!(approvals.len(), 3);
    let total: i32 = approvals.iter().map(|a| a.total_requested).sum();
    assert_eq!(total, topics.len() as i32);
    assert!(approvals.iter().all(|a| a.total_requested >= 1));
}

#[tokio::test]
async fn buckets_are_reconciled_independently() {
    let (store, engine) = engine_with_store();
    engine.submit_request(submission("AI", 5, "Ethics of AI")).await.unwrap();
    engine.submit_request(submission("Law", 5, "Ethics of AI")).await.unwrap();
    engine.submit_request(submission("AI", 6, "Ethics of AI")).await.unwrap();

    let all = store.list_approvals(&BucketFilter::all()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|a| a.total_requested == 1));
}

#[tokio::test]
async fn concurrent_lazy_reads_leave_one_row_per_topic() {
    let (store, engine) = engine_with_store();
    store
        .insert_request(raw_request("Data", 7, "Intro to Pandas"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(engine.get_approvals("Phase 7"), engine.get_approvals("Phase 7"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 1);
    assert_eq!(a[0].topic, b[0].topic);

    let stored = store.list_approvals(&BucketFilter::phase(phase(7))).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].topic, "Intro to Pandas");
    assert_eq!(stored[0].approval, ApprovalStatus::OnHold);
}

#[tokio::test]
async fn lazy_regeneration_covers_every_domain_of_the_phase() {
    let (store, engine) = engine_with_store();
    for (domain, topic) in [
        ("AI", "Reinforcement Learning"),
        ("Finance", "Personal Budgeting"),
        ("AI", "reinforcement learning"),
        ("Finance", "Crypto Basics"),
    ] {
        store.insert_request(raw_request(domain, 4, topic)).await.unwrap();
    }
    store.insert_request(raw_request("AI", 9, "Other phase")).await.unwrap();

    let approvals = engine.get_approvals("phase 4").await.unwrap();
    assert_eq!(approvals.len(), 3);
    assert_unique_topics(&approvals);
    assert_eq!(approvals[0].domain, "AI");
    assert_eq!(approvals[0].total_requested, 2);
    assert!(approvals.iter().all(|a| a.phase == phase(4)));

    assert!(store
        .list_approvals(&BucketFilter::phase(phase(9)))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn existing_approvals_are_returned_without_recomputation() {
    let (store, engine) = engine_with_store();
    store
        .insert_approvals(&[NewTopicApproval {
            phase: phase(8),
            domain: "Arts".into(),
            topic: "Stale Topic".into(),
            total_requested: 4,
            approval: ApprovalStatus::Rejected,
        }])
        .await
        .unwrap();
    store.insert_request(raw_request("Arts", 8, "Watercolor")).await.unwrap();

    let approvals = engine.get_approvals("Phase 8").await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].topic, "Stale Topic");
    assert_eq!(approvals[0].approval, ApprovalStatus::Rejected);
}

#[tokio::test]
async fn lazy_read_of_phase_without_requests_writes_nothing() {
    let (store, engine) = engine_with_store();
    assert!(engine.get_approvals("Phase 11").await.unwrap().is_empty());
    assert!(store.list_approvals(&BucketFilter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_phase_selector_is_a_validation_error() {
    let (_store, engine) = engine_with_store();
    let err = engine.get_approvals("Semester 2").await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn failed_reconciliation_keeps_request_and_next_read_rebuilds() {
    let (store, engine) = engine_with_store();
    engine
        .submit_request(submission("Bio", 5, "Genetics 101"))
        .await
        .unwrap();

    store.fail_next_approval_inserts(1);
    let receipt = engine
        .submit_request(submission("Bio", 5, "Marine Biology"))
        .await
        .unwrap();
    match &receipt.reconciliation {
        ReconciliationReport::Failed { warning } => assert!(warning.contains("injected")),
        other => panic!("expected failure warning, got {other:?}"),
    }
    assert_eq!(receipt.request.topic, "Marine Biology");

    let bucket = BucketFilter::bucket("Bio", phase(5));
    assert_eq!(store.list_requests(&bucket).await.unwrap().len(), 2);
    assert!(store.list_approvals(&bucket).await.unwrap().is_empty());

    let rebuilt = engine.get_approvals("Phase 5").await.unwrap();
    let topics = rebuilt.iter().map(|a| a.topic.as_str()).collect::<Vec<_>>();
    assert_eq!(topics, vec!["Genetics 101", "Marine Biology"]);
}

#[tokio::test]
async fn concurrent_submissions_to_one_bucket_converge() {
    let (store, engine) = engine_with_store();
    let (a, b) = tokio::join!(
        engine.submit_request(submission("Physics", 1, "Quantum Computing")),
        engine.submit_request(submission("Physics", 1, "Art of Experiment Design"))
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(matches!(a.reconciliation, ReconciliationReport::Completed(_)));
    assert!(matches!(b.reconciliation, ReconciliationReport::Completed(_)));

    let approvals = store
        .list_approvals(&BucketFilter::bucket("Physics", phase(1)))
        .await
        .unwrap();
    assert_unique_topics(&approvals);
    let total: i32 = approvals.iter().map(|a| a.total_requested).sum();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn invalid_submission_persists_nothing() {
    let (store, engine) = engine_with_store();
    let mut bad = submission("AI", 5, "  ");
    bad.email.clear();
    let err = engine.submit_request(bad).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(store.list_requests(&BucketFilter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn status_update_of_unknown_approval_is_not_found() {
    let (_store, engine) = engine_with_store();
    let id = Uuid::new_v4();
    let err = engine
        .update_approval_status(id, ApprovalStatus::Approved)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(missing) if missing == id));
}

#[tokio::test]
async fn match_query_filters_by_domain_phase_and_similarity() {
    let (store, engine) = engine_with_store();
    for (domain, phase_no, topic) in [
        ("AI", 5, "Computer Vision Basics"),
        ("AI", 6, "computer vision basics"),
        ("AI", 5, "NLP intro"),
        ("Design", 5, "Computer Vision Basics"),
    ] {
        store
            .insert_request(raw_request(domain, phase_no, topic))
            .await
            .unwrap();
    }

    let any_phase = engine
        .find_requests_matching_topic("AI", "Computer Vision Basics", None)
        .await
        .unwrap();
    assert_eq!(any_phase.len(), 2);
    assert!(any_phase.iter().all(|r| r.domain == "AI"));

    let phase_five = engine
        .find_requests_matching_topic("AI", "computer vision basics", Some(phase(5)))
        .await
        .unwrap();
    assert_eq!(phase_five.len(), 1);
    assert_eq!(phase_five[0].topic, "Computer Vision Basics");

    let err = engine
        .find_requests_matching_topic("AI", " ", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

/// Scores by exact text only, so tests can place requests right at the threshold.
struct ScriptedSimilarity;

impl SimilarityOracle for ScriptedSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let score = |t: &str| match t {
            "at threshold" => 0.6,
            "just above" => 0.61,
            _ => 0.0,
        };
        if a == b {
            1.0
        } else if a == "query" {
            score(b)
        } else if b == "query" {
            score(a)
        } else {
            0.0
        }
    }
}

#[tokio::test]
async fn match_query_excludes_requests_exactly_at_threshold() {
    let store = Arc::new(MemoryTopicStore::new());
    let engine = TopicEngine::new(
        store.clone(),
        TopicClusterer::new(Arc::new(ScriptedSimilarity), 0.6),
    );
    for topic in ["at threshold", "just above", "unrelated"] {
        store.insert_request(raw_request("AI", 4, topic)).await.unwrap();
    }

    let matches = engine
        .find_requests_matching_topic("AI", "query", None)
        .await
        .unwrap();
    let topics = matches.iter().map(|r| r.topic.as_str()).collect::<Vec<_>>();
    assert_eq!(topics, vec!["just above"]);
}

#[tokio::test]
async fn submission_receipt_serializes_reconciliation_status() {
    let (store, engine) = engine_with_store();
    let receipt = engine
        .submit_request(submission("AI", 5, "Computer Vision Basics"))
        .await
        .unwrap();
    let json = serde_json::to_value(&receipt).unwrap();
    assert_eq!(json["request"]["topic"], "Computer Vision Basics");
    assert_eq!(json["request"]["phase"], 5);
    assert_eq!(json["reconciliation"]["status"], "completed");
    assert_eq!(json["reconciliation"]["domain"], "AI");
    assert_eq!(json["reconciliation"]["phase"], 5);
    assert_eq!(json["reconciliation"]["approvals"], 1);
    assert_eq!(json["reconciliation"]["attempts"], 1);

    store.fail_next_approval_inserts(1);
    let receipt = engine
        .submit_request(submission("AI", 5, "NLP intro"))
        .await
        .unwrap();
    let json = serde_json::to_value(&receipt).unwrap();
    assert_eq!(json["reconciliation"]["status"], "failed");
    assert!(json["reconciliation"]["warning"]
        .as_str()
        .unwrap()
        .contains("approvals were not refreshed"));
}

#[tokio::test]
async fn bulk_regeneration_ignores_phase_and_resets_status() {
    let (store, engine) = engine_with_store();
    engine.submit_request(submission("AI", 1, "Rust Basics")).await.unwrap();
    engine.submit_request(submission("AI", 2, "rust basics")).await.unwrap();
    engine.submit_request(submission("AI", 2, "Distributed Systems")).await.unwrap();
    engine.submit_request(submission("Law", 2, "Contract Law")).await.unwrap();

    let before = store.list_approvals(&BucketFilter::all()).await.unwrap();
    assert_eq!(before.len(), 4);
    engine
        .update_approval_status(before[0].id, ApprovalStatus::Approved)
        .await
        .unwrap();

    let summary = engine.regenerate_all().await.unwrap();
    assert_eq!(summary.deleted, 4);
    assert_eq!(summary.requests, 4);
    assert_eq!(summary.domains, 2);
    assert_eq!(summary.approvals, 3);

    let after = store.list_approvals(&BucketFilter::all()).await.unwrap();
    assert_unique_topics(&after);
    let rust = after.iter().find(|a| a.topic == "Rust Basics").unwrap();
    assert_eq!(rust.phase, phase(1));
    assert_eq!(rust.total_requested, 2);
    assert!(after.iter().all(|a| a.approval == ApprovalStatus::OnHold));
}
