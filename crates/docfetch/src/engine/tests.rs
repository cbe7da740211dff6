use crate::{
    ClientError, DecodeError, Decoder, Document, EngineConfig, Error, JsonDecoder, LookupStatus,
    PartitionState, PartitionedDataset, PathError, QueryRow, RawDocument, RetrievalEngine,
    RetrieveOptions, SpatialViewQuery, SpatialViewRow, Statement, SubdocLookupSpec, TaskContext,
    TypedDecoder, ViewQuery,
    memory::MemoryCluster,
};
use core::time::Duration;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

fn config() -> EngineConfig {
    EngineConfig {
        default_parallelism: 2,
        worker_threads: 2,
        connect_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn engine(cluster: &MemoryCluster) -> RetrievalEngine<MemoryCluster> {
    RetrievalEngine::new(config(), cluster.clone()).unwrap()
}

fn users(n: usize) -> MemoryCluster {
    let cluster = MemoryCluster::new();
    for i in 0..n {
        cluster.insert("default", &format!("u{i}"), &json!({"n": i}));
    }
    cluster
}

fn ids<T>(docs: &[Document<T>]) -> BTreeSet<String> {
    docs.iter().map(|d| d.id().to_owned()).collect()
}

#[test]
fn missing_keys_are_left_out() {
    let cluster = users(3);
    let dataset = engine(&cluster).retrieve_documents(["u1", "u2", "missing"], RetrieveOptions::new());

    let docs = dataset.collect().unwrap();
    assert_eq!(
        ids(&docs),
        BTreeSet::from(["u1".to_owned(), "u2".to_owned()])
    );
    let u1 = docs.iter().find(|d| d.id() == "u1").unwrap();
    assert_eq!(u1.content(), &json!({"n": 1}));
    assert!(u1.cas() > 0);
}

#[test]
fn empty_input_touches_nothing() {
    let cluster = users(1);
    let engine = engine(&cluster);

    let dataset = engine.retrieve_documents(Vec::<String>::new(), RetrieveOptions::new());
    assert!(dataset.partitions().is_empty());
    assert!(dataset.collect().unwrap().is_empty());

    let dataset = engine.lookup_subdocs(Vec::new(), RetrieveOptions::new());
    assert!(dataset.collect().unwrap().is_empty());

    assert_eq!(cluster.connect_attempts(), 0);
}

#[test]
fn partitions_cover_every_key_once() {
    let cluster = users(10);
    let engine = engine(&cluster);
    let keys: Vec<String> = (0..10).map(|i| format!("u{i}")).collect();

    let dataset = engine.retrieve_documents(keys.clone(), RetrieveOptions::new().parallelism(3));
    let ranges: Vec<_> = dataset.partitions().iter().map(|p| p.range()).collect();
    assert_eq!(ranges, vec![0..4, 4..8, 8..10]);

    let docs = dataset.collect().unwrap();
    assert_eq!(docs.len(), 10);
    assert_eq!(ids(&docs), keys.into_iter().collect());
}

#[test]
fn partitions_share_one_connection() {
    let cluster = users(64);
    let keys: Vec<String> = (0..64).map(|i| format!("u{i}")).collect();

    let docs = engine(&cluster)
        .retrieve_documents(keys, RetrieveOptions::new().parallelism(8))
        .collect()
        .unwrap();

    assert_eq!(docs.len(), 64);
    assert_eq!(cluster.connections_established(), 1);
}

#[test]
fn stats_count_what_was_skipped() {
    let cluster = users(3);
    cluster.insert_raw("default", "garbage", &b"{oops"[..], None);
    cluster.fail_key(
        "u2",
        ClientError::Timeout {
            operation: "get".into(),
        },
    );
    let dataset = engine(&cluster).retrieve_documents(
        ["u0", "u1", "u2", "garbage", "nope"],
        RetrieveOptions::new().parallelism(1),
    );

    let seq = dataset.compute(&dataset.partitions()[0], &TaskContext::new(0));
    let stats = seq.stats_handle();
    let docs: Vec<_> = seq.map(Result::unwrap).collect();

    assert_eq!(ids(&docs), BTreeSet::from(["u0".to_owned(), "u1".to_owned()]));
    assert_eq!(stats.yielded(), 2);
    assert_eq!(stats.not_found(), 1);
    assert_eq!(stats.failed(), 2);
    assert_eq!(stats.state(), PartitionState::Completed);
}

#[test]
fn typed_decoder_skips_mismatched_documents() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        name: String,
    }

    let cluster = MemoryCluster::new();
    cluster.insert("people", "ada", &json!({"name": "Ada"}));
    cluster.insert("people", "bob", &json!({"nom": "Bob"}));

    let docs = engine(&cluster)
        .retrieve_documents(
            ["ada", "bob"],
            RetrieveOptions::new()
                .collection("people")
                .with_decoder(TypedDecoder::<User>::new()),
        )
        .collect()
        .unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].content(), &User { name: "Ada".into() });
}

#[test]
fn subdoc_results_match_specs_one_to_one() {
    let cluster = MemoryCluster::new();
    cluster.insert("default", "u1", &json!({"a": {"b": 1}, "name": "ada"}));
    cluster.insert("default", "u2", &json!({"a": {"c": 2}, "name": "bob"}));

    let results = engine(&cluster)
        .retrieve_subdocs(
            ["u1", "u2", "u3"],
            ["a.b", "name"],
            ["a"],
            RetrieveOptions::new().parallelism(2),
        )
        .collect()
        .unwrap();

    let order: Vec<&str> = results.iter().map(|r| r.id()).collect();
    assert_eq!(order, ["u1", "u2", "u3"]);

    assert_eq!(results[0].status(), &LookupStatus::Success);
    assert_eq!(results[0].value("a.b"), Some(&Ok(json!(1))));

    assert_eq!(results[1].status(), &LookupStatus::PartialFailure);
    assert_eq!(results[1].value("a.b"), Some(&Err(PathError::PathNotFound)));
    assert_eq!(results[1].value("name"), Some(&Ok(json!("bob"))));
    assert_eq!(results[1].exists("a"), Some(&Ok(true)));

    assert_eq!(results[2].status(), &LookupStatus::DocumentNotFound);
    assert_eq!(results[2].cas(), None);
}

#[test]
fn per_spec_paths_are_honored() {
    let cluster = MemoryCluster::new();
    cluster.insert("default", "k", &json!({"tags": ["x", "y"], "meta": {"v": 3}}));

    let results = engine(&cluster)
        .lookup_subdocs(
            [
                SubdocLookupSpec::new("k", ["tags[1]"], Vec::<String>::new()),
                SubdocLookupSpec::new("k", ["meta.v"], ["meta.missing"]),
            ],
            RetrieveOptions::new(),
        )
        .collect()
        .unwrap();

    assert_eq!(results[0].value("tags[1]"), Some(&Ok(json!("y"))));
    assert_eq!(results[0].value("meta.v"), None);
    assert_eq!(results[1].value("meta.v"), Some(&Ok(json!(3))));
    assert_eq!(results[1].exists("meta.missing"), Some(&Ok(false)));
}

#[test]
fn cancellation_stops_fetching() {
    let cluster = users(200);
    cluster.set_latency(Duration::from_millis(10));
    let engine = RetrievalEngine::new(
        EngineConfig {
            max_concurrency: 1,
            sequence_buffer: 1,
            ..config()
        },
        cluster.clone(),
    )
    .unwrap();
    let keys: Vec<String> = (0..200).map(|i| format!("u{i}")).collect();
    let dataset = engine.retrieve_documents(keys, RetrieveOptions::new().parallelism(1));

    let ctx = TaskContext::new(0);
    let mut seq = dataset.compute(&dataset.partitions()[0], &ctx);
    assert!(seq.next().unwrap().is_ok());

    ctx.cancel();
    assert!(matches!(
        seq.next(),
        Some(Err(Error::Cancelled { partition: 0 }))
    ));
    assert!(seq.next().is_none());

    std::thread::sleep(Duration::from_millis(100));
    let issued = cluster.gets_issued();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(cluster.gets_issued(), issued, "fetching must stop");
    assert!(issued < 20);
    assert_eq!(seq.state(), PartitionState::Cancelled);
}

#[test]
fn fatal_item_error_fails_the_partition() {
    let cluster = users(4);
    cluster.fail_key(
        "u3",
        ClientError::ConnectionLost {
            reason: "node down".into(),
        },
    );

    let err = engine(&cluster)
        .retrieve_documents(["u0", "u1", "u2", "u3"], RetrieveOptions::new().parallelism(2))
        .collect()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Partition {
            partition: 1,
            source: ClientError::ConnectionLost { .. }
        }
    ));
}

#[test]
fn first_failure_cancels_sibling_partitions() {
    let cluster = users(200);
    cluster.set_latency(Duration::from_millis(5));
    cluster.fail_key(
        "u100",
        ClientError::ConnectionLost {
            reason: "node down".into(),
        },
    );
    let engine = RetrievalEngine::new(
        EngineConfig {
            max_concurrency: 1,
            ..config()
        },
        cluster.clone(),
    )
    .unwrap();
    let keys: Vec<String> = (0..200).map(|i| format!("u{i}")).collect();

    let err = engine
        .retrieve_documents(keys, RetrieveOptions::new().parallelism(2))
        .collect()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Partition {
            partition: 1,
            source: ClientError::ConnectionLost { .. }
        }
    ));
    // Partition 0 alone would have issued 100 gets.
    assert!(cluster.gets_issued() < 50, "issued {}", cluster.gets_issued());
}

struct PanicsOn(&'static str);

impl Decoder for PanicsOn {
    type Output = Document<serde_json::Value>;

    fn decode(&self, raw: RawDocument) -> Result<Self::Output, DecodeError> {
        assert_ne!(raw.id, self.0, "decoder blew up");
        JsonDecoder.decode(raw)
    }
}

#[test]
fn panicking_decoder_fails_the_partition() {
    let cluster = users(6);
    let engine = RetrievalEngine::new(
        EngineConfig {
            max_concurrency: 1,
            sequence_buffer: 1,
            ..config()
        },
        cluster.clone(),
    )
    .unwrap();
    let keys: Vec<String> = (0..6).map(|i| format!("u{i}")).collect();
    let dataset = engine.retrieve_documents(
        keys,
        RetrieveOptions::new()
            .parallelism(1)
            .with_decoder(PanicsOn("u3")),
    );

    let mut seq = dataset.compute(&dataset.partitions()[0], &TaskContext::new(0));
    let docs: Vec<_> = seq.by_ref().take(3).map(Result::unwrap).collect();
    assert_eq!(
        ids(&docs),
        BTreeSet::from(["u0".to_owned(), "u1".to_owned(), "u2".to_owned()])
    );
    assert!(matches!(seq.next(), Some(Err(Error::ChannelError { .. }))));
    assert!(seq.next().is_none());
    assert_eq!(seq.state(), PartitionState::Failed);

    assert!(dataset.collect().is_err());
}

#[test]
fn replayed_partition_yields_same_items() {
    let cluster = users(20);
    let keys: Vec<String> = (0..20).map(|i| format!("u{i}")).collect();
    let dataset = engine(&cluster).retrieve_documents(keys, RetrieveOptions::new().parallelism(4));
    let partition = dataset.partitions()[2].clone();

    let first: Vec<_> = dataset
        .compute(&partition, &TaskContext::new(2))
        .map(Result::unwrap)
        .collect();
    let replay: Vec<_> = dataset
        .compute(&partition, &TaskContext::new(2).with_attempt(1))
        .map(Result::unwrap)
        .collect();

    assert_eq!(first.len(), 5);
    assert_eq!(ids(&first), ids(&replay));
}

#[test]
fn transient_connect_failures_are_retried() {
    let cluster = users(1);
    cluster.fail_connects(
        2,
        ClientError::TemporaryFailure {
            reason: "warming up".into(),
        },
    );

    let docs = engine(&cluster)
        .retrieve_documents(["u0"], RetrieveOptions::new())
        .collect()
        .unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(cluster.connect_attempts(), 3);
}

#[test]
fn connect_gives_up_after_retries() {
    let cluster = users(1);
    cluster.fail_connects(
        10,
        ClientError::Timeout {
            operation: "connect".into(),
        },
    );
    let engine = RetrievalEngine::new(
        EngineConfig {
            connect_retries: 2,
            ..config()
        },
        cluster.clone(),
    )
    .unwrap();

    let err = engine
        .retrieve_documents(["u0"], RetrieveOptions::new())
        .collect()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Connection {
            attempts: 3,
            source: ClientError::Timeout { .. },
            ..
        }
    ));
    assert_eq!(cluster.connect_attempts(), 3);
}

#[test]
fn unknown_collection_fails_without_retry() {
    let cluster = users(1);

    let err = engine(&cluster)
        .retrieve_documents(["u0"], RetrieveOptions::new().collection("nope"))
        .collect()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Connection {
            attempts: 1,
            source: ClientError::Authentication { .. },
            ..
        }
    ));
}

#[test]
fn queries_distinguish_empty_from_failed() {
    let cluster = MemoryCluster::new();
    cluster.add_view_rows("default", "users", "none", vec![]);
    cluster.add_query_rows(
        "default",
        "SELECT n FROM default",
        vec![json!({"n": 1}), json!({"n": 2})],
    );
    let engine = engine(&cluster);

    let empty = engine
        .run_view(ViewQuery::from("users", "none"), RetrieveOptions::new())
        .collect()
        .unwrap();
    assert!(empty.is_empty());

    let err = engine
        .run_view(ViewQuery::from("users", "broken"), RetrieveOptions::new())
        .collect()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Query {
            kind: "View query",
            source: ClientError::QueryCompilation { .. }
        }
    ));

    let rows = engine
        .run_query(Statement::new("SELECT n FROM default"), RetrieveOptions::new())
        .collect()
        .unwrap();
    assert_eq!(rows, vec![QueryRow(json!({"n": 1})), QueryRow(json!({"n": 2}))]);

    let err = engine
        .run_query(Statement::new("SELEC"), RetrieveOptions::new())
        .collect()
        .unwrap_err();
    assert!(err.to_string().starts_with("Query failed"));
}

#[test]
fn spatial_view_rows_keep_cluster_order() {
    let cluster = MemoryCluster::new();
    let rows: Vec<SpatialViewRow> = (0..3)
        .map(|i| SpatialViewRow {
            id: Some(format!("p{i}")),
            key: json!([i, i]),
            value: json!(null),
            geometry: Some(json!({"type": "Point", "coordinates": [i, i]})),
        })
        .collect();
    cluster.add_spatial_view_rows("default", "geo", "points", rows.clone());

    let dataset = engine(&cluster).run_spatial_view(
        SpatialViewQuery::from("geo", "points"),
        RetrieveOptions::new(),
    );
    assert_eq!(dataset.partitions().len(), 1);
    assert_eq!(dataset.collect().unwrap(), rows);
}

#[test]
fn row_failure_terminates_query_partition() {
    let cluster = MemoryCluster::new();
    cluster.add_query_rows("default", "q", vec![json!(1), json!(2), json!(3)]);
    cluster.fail_rows_after(
        "q",
        2,
        ClientError::QueryExecution {
            reason: "timeout on index".into(),
        },
    );
    let dataset = engine(&cluster).run_query(Statement::new("q"), RetrieveOptions::new());

    let items: Vec<_> = dataset
        .compute(&dataset.partitions()[0], &TaskContext::new(0))
        .collect();
    assert_eq!(items.len(), 3);
    assert!(items[..2].iter().all(Result::is_ok));
    assert!(matches!(items[2], Err(Error::Query { kind: "Query", .. })));
}

#[test]
fn partitions_prefer_the_nodes_holding_their_keys() {
    let cluster = MemoryCluster::new().with_nodes(["n1", "n2", "n3"]);
    for i in 0..30 {
        cluster.insert("default", &format!("k{i}"), &json!(i));
    }
    let keys: Vec<String> = (0..30).map(|i| format!("k{i}")).collect();
    let dataset = engine(&cluster).retrieve_documents(keys, RetrieveOptions::new().parallelism(5));

    for partition in dataset.partitions() {
        let locations = dataset.preferred_locations(partition);
        assert_eq!(locations.len(), 1);
        assert!(["n1", "n2", "n3"].contains(&locations[0].as_str()));
    }

    let without = engine(&users(2)).retrieve_documents(["u0", "u1"], RetrieveOptions::new());
    assert!(without.preferred_locations(&without.partitions()[0]).is_empty());
}

#[test]
fn async_consumers_use_the_stream_view() {
    let cluster = users(5);
    let engine = engine(&cluster);
    let keys: Vec<String> = (0..5).map(|i| format!("u{i}")).collect();
    let dataset = engine.retrieve_documents(keys, RetrieveOptions::new().parallelism(1));

    let docs: Vec<_> = engine.handle().block_on(async {
        dataset
            .compute(&dataset.partitions()[0], &TaskContext::new(0))
            .into_stream()
            .map(Result::unwrap)
            .collect()
            .await
    });
    assert_eq!(docs.len(), 5);
}

#[test]
fn borrowed_runtime_drives_partitions() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let cluster = users(4);
    let engine = RetrievalEngine::with_handle(config(), cluster, rt.handle().clone()).unwrap();

    let docs = engine
        .retrieve_documents(["u0", "u1", "u2", "u3"], RetrieveOptions::new())
        .collect()
        .unwrap();
    assert_eq!(docs.len(), 4);
}

#[test]
fn shutdown_closes_connections_and_fails_new_work() {
    let cluster = users(2);
    let engine = engine(&cluster);
    engine
        .retrieve_documents(["u0"], RetrieveOptions::new())
        .collect()
        .unwrap();
    assert_eq!(engine.registry().len(), 1);

    engine.shutdown_blocking();

    assert!(engine.is_shutdown());
    assert_eq!(cluster.connections_closed(), 1);
    let err = engine
        .retrieve_documents(["u1"], RetrieveOptions::new())
        .collect()
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown));
}

#[test]
fn invalid_config_is_rejected() {
    let result = RetrievalEngine::new(
        EngineConfig {
            max_concurrency: 0,
            ..config()
        },
        MemoryCluster::new(),
    );
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));
}
