//! Drains a dataset the way a host engine would and prints its items as JSON
//! lines.

use docfetch::{
    Document, LookupStatus, PartitionedDataset, PathError, QueryRow, SpatialViewRow,
    SubdocLookupResult, TaskContext, ViewRow,
};
use serde_json::{Map, Value, json};
use std::io::Write;

/// Totals across every partition of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub partitions: usize,
    pub yielded: u64,
    pub not_found: u64,
    pub failed: u64,
}

/// Renders one dataset item as a JSON value.
pub trait Render {
    fn render(&self) -> Value;
}

impl Render for Document<Value> {
    fn render(&self) -> Value {
        json!({
            "id": self.id(),
            "cas": self.cas(),
            "content": self.content(),
        })
    }
}

impl Render for SubdocLookupResult {
    fn render(&self) -> Value {
        let content: Map<String, Value> = self
            .content()
            .iter()
            .map(|(path, res)| (path.clone(), outcome(res.as_ref())))
            .collect();
        let exists: Map<String, Value> = self
            .exists_map()
            .iter()
            .map(|(path, res)| (path.clone(), outcome(res.as_ref())))
            .collect();
        json!({
            "id": self.id(),
            "cas": self.cas(),
            "status": status(self.status()),
            "content": content,
            "exists": exists,
        })
    }
}

impl Render for ViewRow {
    fn render(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Render for SpatialViewRow {
    fn render(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Render for QueryRow {
    fn render(&self) -> Value {
        self.0.clone()
    }
}

fn status(status: &LookupStatus) -> Value {
    match status {
        LookupStatus::Success => json!("success"),
        LookupStatus::PartialFailure => json!("partial_failure"),
        LookupStatus::DocumentNotFound => json!("document_not_found"),
        LookupStatus::Failed { reason } => json!({ "failed": reason }),
    }
}

fn outcome<T: Into<Value> + Clone>(res: Result<&T, &PathError>) -> Value {
    match res {
        Ok(value) => json!({ "value": value.clone().into() }),
        Err(err) => json!({ "error": err.to_string() }),
    }
}

/// Computes every partition up front so they fetch concurrently, then drains
/// them in partition order, writing one line per item.
///
/// Stops at the first partition error, after everything before it has been
/// written; the remaining sequences are dropped, which cancels them.
pub fn drain<D, W>(dataset: &D, out: &mut W) -> anyhow::Result<Summary>
where
    D: PartitionedDataset,
    D::Item: Render,
    W: Write,
{
    let sequences: Vec<_> = dataset
        .partitions()
        .iter()
        .map(|partition| {
            tracing::debug!(
                partition = partition.index(),
                keys = partition.len(),
                locations = ?dataset.preferred_locations(partition),
                "Computing partition"
            );
            dataset.compute(partition, &TaskContext::new(partition.index()))
        })
        .collect();

    let mut summary = Summary {
        partitions: sequences.len(),
        ..Summary::default()
    };
    for mut sequence in sequences {
        for item in sequence.by_ref() {
            writeln!(out, "{}", item?.render())?;
        }
        out.flush()?;

        let stats = sequence.stats();
        tracing::debug!(
            partition = sequence.partition_index(),
            yielded = stats.yielded(),
            not_found = stats.not_found(),
            failed = stats.failed(),
            "Partition drained"
        );
        summary.yielded += stats.yielded();
        summary.not_found += stats.not_found();
        summary.failed += stats.failed();
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docfetch::{
        ClientError, EngineConfig, RetrievalEngine, RetrieveOptions, Statement,
        memory::MemoryCluster,
    };

    fn engine(cluster: MemoryCluster) -> RetrievalEngine<MemoryCluster> {
        let config = EngineConfig {
            default_parallelism: 2,
            worker_threads: 2,
            ..EngineConfig::default()
        };
        RetrievalEngine::new(config, cluster).unwrap()
    }

    fn lines(out: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn prints_documents_in_partition_order() {
        let cluster = MemoryCluster::new();
        for i in 0..5 {
            cluster.insert("default", &format!("k{i}"), &json!({ "n": i }));
        }
        let engine = engine(cluster);
        let keys = ["k0", "k1", "gone", "k3", "k4"];
        let dataset = engine.retrieve_documents(keys, RetrieveOptions::new());

        let mut out = Vec::new();
        let summary = drain(&dataset, &mut out).unwrap();
        assert_eq!(
            summary,
            Summary {
                partitions: 2,
                yielded: 4,
                not_found: 1,
                failed: 0,
            }
        );
        let ids: Vec<_> = lines(&out).iter().map(|v| v["id"].clone()).collect();
        assert_eq!(ids, [json!("k0"), json!("k1"), json!("k3"), json!("k4")]);
    }

    #[test]
    fn prints_path_errors_inline() {
        let cluster = MemoryCluster::new();
        cluster.insert("default", "u1", &json!({ "name": "ada" }));
        let engine = engine(cluster);
        let dataset =
            engine.retrieve_subdocs(["u1", "u2"], ["name", "age"], ["name"], RetrieveOptions::new());

        let mut out = Vec::new();
        drain(&dataset, &mut out).unwrap();
        let rows = lines(&out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["content"]["name"], json!({ "value": "ada" }));
        assert!(rows[0]["content"]["age"]["error"].is_string());
        assert_eq!(rows[0]["exists"]["name"], json!({ "value": true }));
        assert_eq!(rows[0]["status"], json!("partial_failure"));
        assert_eq!(rows[1]["status"], json!("document_not_found"));
    }

    #[test]
    fn stops_at_the_first_error() {
        let cluster = MemoryCluster::new();
        cluster.add_query_rows("default", "SELECT 1", vec![json!(1), json!(2), json!(3)]);
        cluster.fail_rows_after(
            "SELECT 1",
            2,
            ClientError::Timeout {
                operation: "query".into(),
            },
        );
        let engine = engine(cluster);
        let dataset = engine.run_query(Statement::new("SELECT 1"), RetrieveOptions::new());

        let mut out = Vec::new();
        assert!(drain(&dataset, &mut out).is_err());
        assert_eq!(lines(&out), [json!(1), json!(2)]);
    }
}
