use super::*;
use crate::cache::ResponseCache;
use crate::dispatch::CacheOptions;
use crate::dispatch::tests::{FakeService, dispatcher};
use crate::remote::{RemoteService, TransportError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn engine(service: &Arc<FakeService>, dir: &TempDir) -> QueryEngine {
    QueryEngine::new(dispatcher(service.clone(), dir, 0))
}

// ============================================================================
// Extraction and filtering
// ============================================================================

#[tokio::test]
async fn test_first_list_field_wins_in_declared_order() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "listThings",
        json!({}),
        json!({"total": 2, "zeta": [{"n": 1}], "alpha": [{"n": 2}]}),
    );

    let output = engine(&service, &dir)
        .query(&QuerySpec::new("listThings"))
        .await
        .unwrap();

    assert_eq!(output, QueryOutput::List(vec![json!({"n": 1})]));
}

#[tokio::test]
async fn test_response_without_list_is_single_record() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "getThing",
        json!({"id": "7"}),
        json!({"thing": {"id": "7"}, "count": 1}),
    );

    let output = engine(&service, &dir)
        .query(&QuerySpec::new("getThing").arg("id", "7"))
        .await
        .unwrap();

    assert_eq!(
        output,
        QueryOutput::Single(json!({"thing": {"id": "7"}, "count": 1}))
    );
}

#[tokio::test]
async fn test_result_path_selects_working_data() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "getThing",
        json!({}),
        json!({"thing": {"id": "7", "tags": ["a", "b"]}, "other": []}),
    );

    let engine = engine(&service, &dir);
    let single = engine
        .query(&QuerySpec::new("getThing").result_path("thing").unwrap())
        .await
        .unwrap();
    assert_eq!(single, QueryOutput::Single(json!({"id": "7", "tags": ["a", "b"]})));

    let missing = engine
        .query(&QuerySpec::new("getThing").result_path("nothing[]").unwrap())
        .await
        .unwrap();
    assert_eq!(missing, QueryOutput::List(Vec::new()));
}

#[tokio::test]
async fn test_filter_keeps_matching_records_in_order() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "listRepositories",
        json!({}),
        json!({"repositories": [{"name": "repo1"}, {"name": "other"}, {"name": "my-repo"}]}),
    );

    let spec = QuerySpec::new("listRepositories").filter(AttributeFilter::new("name", "repo").unwrap());
    let output = engine(&service, &dir).query(&spec).await.unwrap();

    assert_eq!(
        output,
        QueryOutput::List(vec![json!({"name": "repo1"}), json!({"name": "my-repo"})])
    );
}

#[tokio::test]
async fn test_filter_exact_example() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "listRepositories",
        json!({}),
        json!({"repositories": [{"name": "repo1"}, {"name": "other"}]}),
    );

    let spec = QuerySpec::new("listRepositories").filter(AttributeFilter::new("name", "repo").unwrap());
    let records = engine(&service, &dir).query(&spec).await.unwrap().into_records();
    assert_eq!(records, vec![json!({"name": "repo1"})]);
}

#[test]
fn test_filter_is_case_sensitive_and_regex() {
    let filter = AttributeFilter::new("meta.branch", "^feature/").unwrap();
    assert!(filter.matches(&json!({"meta": {"branch": "feature/login"}})));
    assert!(!filter.matches(&json!({"meta": {"branch": "Feature/login"}})));
    assert!(!filter.matches(&json!({"meta": {}})));

    let err = AttributeFilter::new("name", "(unclosed").unwrap_err();
    assert!(matches!(err, QueryError::ValidationFailed { .. }));
}

#[tokio::test]
async fn test_filter_drops_records_without_attribute() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "listRepositories",
        json!({}),
        json!({"repositories": [{"name": "web"}, {"other": 1}, {"name": ""}]}),
    );

    let engine = engine(&service, &dir);
    let any = QuerySpec::new("listRepositories").filter(AttributeFilter::new("name", ".*").unwrap());
    let records = engine.query(&any).await.unwrap().into_records();
    assert_eq!(records, vec![json!({"name": "web"}), json!({"name": ""})]);

    let empty = QuerySpec::new("listRepositories").filter(AttributeFilter::new("name", "^$").unwrap());
    let records = engine.query(&empty).await.unwrap().into_records();
    assert_eq!(records, vec![json!({"name": ""})]);
}

// ============================================================================
// Joins
// ============================================================================

#[tokio::test]
async fn test_join_enriches_matches_and_leaves_misses_untouched() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond("listKeys", json!({}), json!({"items": [{"k": "a"}, {"k": "b"}]}));
    service.respond("lookup", json!({"k": "a"}), json!({"k": "a", "v": 1}));
    service.respond("lookup", json!({"k": "b"}), json!({}));

    let spec = QuerySpec::new("listKeys").join(
        JoinSpec::new("lookup", &["k"])
            .unwrap()
            .with_store_root(true),
    );
    let output = engine(&service, &dir).query(&spec).await.unwrap();

    assert_eq!(
        output,
        QueryOutput::List(vec![json!({"k": "a", "v": 1}), json!({"k": "b"})])
    );
}

#[tokio::test]
async fn test_join_preserves_length_and_order() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    let ids: Vec<String> = (0..12).map(|i| format!("id-{i}")).collect();
    let items: Vec<Value> = ids.iter().map(|id| json!({"id": id})).collect();
    service.respond("listItems", json!({}), json!({ "items": items }));
    for id in ids.iter().filter(|id| id.ends_with(['0', '2', '4', '6', '8'])) {
        service.respond("getDetail", json!({"id": id}), json!({"detail": {"seen": id}}));
    }
    for id in ids.iter().filter(|id| id.ends_with(['1', '3', '5', '7', '9'])) {
        service.respond("getDetail", json!({"id": id}), json!({"detail": null}));
    }

    let spec = QuerySpec::new("listItems").join(JoinSpec::new("getDetail", &["id"]).unwrap());
    let records = engine(&service, &dir)
        .with_concurrency(3)
        .query(&spec)
        .await
        .unwrap()
        .into_records();

    assert_eq!(records.len(), ids.len());
    for (record, id) in records.iter().zip(&ids) {
        assert_eq!(record["id"], json!(id));
        if id.ends_with(['0', '2', '4', '6', '8']) {
            assert_eq!(record["seen"], json!(id));
        } else {
            assert!(record.get("seen").is_none());
        }
    }
    assert_eq!(service.call_count(), 1 + ids.len());
}

#[tokio::test]
async fn test_join_first_member_vs_store_root() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond("listItems", json!({}), json!({"items": [{"id": "1"}]}));
    service.respond(
        "getDetail",
        json!({"id": "1"}),
        json!({"detail": {"title": "A"}, "extra": true}),
    );
    service.respond(
        "listComments",
        json!({"id": "1"}),
        json!({"comments": [{"body": "hi"}], "nextToken": null}),
    );

    let engine = engine(&service, &dir);

    let member = engine
        .query(&QuerySpec::new("listItems").join(JoinSpec::new("getDetail", &["id"]).unwrap()))
        .await
        .unwrap();
    assert_eq!(member, QueryOutput::List(vec![json!({"id": "1", "title": "A"})]));

    let root = engine
        .query(
            &QuerySpec::new("listItems")
                .join(JoinSpec::new("getDetail", &["id"]).unwrap().with_store_root(true)),
        )
        .await
        .unwrap();
    assert_eq!(
        root,
        QueryOutput::List(vec![json!({"id": "1", "detail": {"title": "A"}, "extra": true})])
    );

    let list_member = engine
        .query(&QuerySpec::new("listItems").join(JoinSpec::new("listComments", &["id"]).unwrap()))
        .await
        .unwrap();
    assert_eq!(
        list_member,
        QueryOutput::List(vec![json!({"id": "1", "comments": [{"body": "hi"}]})])
    );
}

#[tokio::test]
async fn test_compound_key_and_extra_args() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "listPullRequests",
        json!({}),
        json!({"pullRequests": [
            {"target": {"repositoryName": "web", "destinationCommit": "c1", "sourceCommit": "c2"}}
        ]}),
    );
    service.respond(
        "getDifferences",
        json!({
            "afterCommitSpecifier": "c2",
            "beforeCommitSpecifier": "c1",
            "repositoryName": "web",
            "destinationCommit": "c1",
            "sourceCommit": "c2"
        }),
        json!({"differences": {"count": 3}}),
    );

    let mut extra = Map::new();
    extra.insert("beforeCommitSpecifier".into(), json!("c1"));
    extra.insert("afterCommitSpecifier".into(), json!("c2"));
    let join = JoinSpec::new(
        "getDifferences",
        &["target.repositoryName", "target.destinationCommit", "target.sourceCommit"],
    )
    .unwrap()
    .with_args(extra);

    let record = json!({"target": {"repositoryName": "web", "destinationCommit": "c1", "sourceCommit": "c2"}});
    assert_eq!(join.key_for(&record), "web|c1|c2");

    let records = engine(&service, &dir)
        .query(&QuerySpec::new("listPullRequests").join(join))
        .await
        .unwrap()
        .into_records();
    assert_eq!(records[0]["count"], 3);
}

#[tokio::test]
async fn test_missing_key_value_still_participates() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond("listItems", json!({}), json!({"items": [{"id": "1"}, {"name": "no id"}]}));
    service.respond("getDetail", json!({"id": "1"}), json!({"detail": {"title": "A"}}));
    service.respond("getDetail", json!({"id": null}), json!({}));

    let join = JoinSpec::new("getDetail", &["id"]).unwrap();
    assert_eq!(join.key_for(&json!({"name": "no id"})), "");

    let records = engine(&service, &dir)
        .query(&QuerySpec::new("listItems").join(join))
        .await
        .unwrap()
        .into_records();
    assert_eq!(records, vec![json!({"id": "1", "title": "A"}), json!({"name": "no id"})]);
}

#[tokio::test]
async fn test_join_on_single_record_unwraps() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond(
        "getPullRequest",
        json!({"pullRequestId": "42"}),
        json!({"pullRequest": {"pullRequestId": "42", "authorArn": "u1"}}),
    );
    service.respond("getUser", json!({"authorArn": "u1"}), json!({"user": {"userName": "dana"}}));

    let spec = QuerySpec::new("getPullRequest")
        .arg("pullRequestId", "42")
        .result_path("pullRequest")
        .unwrap()
        .join(JoinSpec::new("getUser", &["authorArn"]).unwrap());
    let output = engine(&service, &dir).query(&spec).await.unwrap();

    assert_eq!(
        output,
        QueryOutput::Single(json!({"pullRequestId": "42", "authorArn": "u1", "userName": "dana"}))
    );
}

#[tokio::test]
async fn test_failed_secondary_call_fails_whole_query() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond("listItems", json!({}), json!({"items": [{"id": "1"}, {"id": "2"}]}));
    service.respond("getDetail", json!({"id": "1"}), json!({"detail": {"title": "A"}}));
    service.fail("getDetail", json!({"id": "2"}), "InternalError", "detail unavailable");

    let spec = QuerySpec::new("listItems")
        .result_path("items[]")
        .unwrap()
        .join(JoinSpec::new("getDetail", &["id"]).unwrap());
    let err = engine(&service, &dir).query(&spec).await.unwrap_err();

    assert_eq!(
        err,
        QueryError::RemoteCallFailed {
            operation: "getDetail".to_string(),
            message: "InternalError: detail unavailable".to_string(),
        }
    );
}

#[tokio::test]
async fn test_root_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.fail("listItems", json!({}), "AccessDenied", "nope");

    let err = engine(&service, &dir)
        .query(&QuerySpec::new("listItems"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::RemoteCallFailed { ref operation, .. } if operation == "listItems"));
}

#[tokio::test]
async fn test_join_rejects_non_object_records() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond("listPullRequests", json!({}), json!({"pullRequestIds": ["1", "2"]}));

    let err = engine(&service, &dir)
        .query(&QuerySpec::new("listPullRequests").join(JoinSpec::new("getPullRequest", &["id"]).unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ValidationFailed { .. }));
}

#[test]
fn test_join_spec_validation() {
    assert!(JoinSpec::new("getDetail", &[]).is_err());
    assert!(JoinSpec::new("getDetail", &["items[0]"]).is_err());
    assert!(JoinSpec::new("getDetail", &["a.b"]).is_ok());
}

#[test]
fn test_store_root_defaults_by_position() {
    let join = JoinSpec::new("getDetail", &["id"]).unwrap();
    assert!(!join.stores_root(0));
    assert!(join.stores_root(1));

    let member = join.clone().with_store_root(false);
    assert!(!member.stores_root(3));
    let root = join.with_store_root(true);
    assert!(root.stores_root(0));
}

#[tokio::test]
async fn test_later_joins_merge_whole_response() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(FakeService::default());
    service.respond("listItems", json!({}), json!({"items": [{"id": "1"}]}));
    service.respond(
        "getDetail",
        json!({"id": "1"}),
        json!({"detail": {"id": "1", "revision": "r9"}}),
    );
    service.respond(
        "evaluateRules",
        json!({"id": "1", "revision": "r9"}),
        json!({"evaluation": {"approved": true}}),
    );

    let spec = QuerySpec::new("listItems")
        .join(JoinSpec::new("getDetail", &["id"]).unwrap())
        .join(JoinSpec::new("evaluateRules", &["id", "revision"]).unwrap());
    let records = engine(&service, &dir).query(&spec).await.unwrap().into_records();

    assert_eq!(
        records,
        vec![json!({"id": "1", "revision": "r9", "evaluation": {"approved": true}})]
    );
}

/// Answers every call after a short delay, tracking how many are in flight.
#[derive(Default)]
struct SlowService {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteService for SlowService {
    async fn invoke(
        &self,
        operation: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if operation == "listItems" {
            let items: Vec<Value> = (0..12).map(|i| json!({"id": i.to_string()})).collect();
            return Ok(json!({ "items": items }));
        }
        Ok(json!({"detail": {"seen": args.get("id").cloned().unwrap_or(Value::Null)}}))
    }
}

#[tokio::test]
async fn test_join_fan_out_is_bounded() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(SlowService::default());
    let dispatcher = Dispatcher::new(
        service.clone(),
        ResponseCache::new(dir.path()),
        CacheOptions { ttl_seconds: 0 },
    );

    let spec = QuerySpec::new("listItems").join(JoinSpec::new("getDetail", &["id"]).unwrap());
    let records = QueryEngine::new(dispatcher)
        .with_concurrency(3)
        .query(&spec)
        .await
        .unwrap()
        .into_records();

    assert_eq!(records.len(), 12);
    assert_eq!(records[11], json!({"id": "11", "seen": "11"}));
    assert_eq!(service.calls.load(Ordering::SeqCst), 13);

    let peak = service.peak.load(Ordering::SeqCst);
    assert!(peak > 1 && peak <= 3, "peak in flight: {peak}");
}
