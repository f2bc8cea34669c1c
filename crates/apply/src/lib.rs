//! kstage apply: split generated manifests into documents and server-side
//! apply them one at a time.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{api::{Patch, PatchParams}, Client};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub mod drift;

pub use drift::{extract_cluster_name, DriftDetector, DriftProbe};

pub const FIELD_MANAGER: &str = "kstage";

fn max_yaml_bytes() -> usize {
    std::env::var("KSTAGE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("KSTAGE_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// One document of a generated manifest stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestDoc {
    /// Position in the stream (0-based, empty documents skipped).
    pub index: usize,
    pub gvk: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub body: Json,
}

impl ManifestDoc {
    /// `Kind/name` label used in logs and per-artifact failure reports.
    pub fn label(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

/// Parse every non-empty YAML document in `yaml`.
pub fn split_documents(yaml: &str) -> Result<Vec<ManifestDoc>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (pos, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing YAML document #{}", pos))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document #{} too complex (>{} nodes)", pos, max_yaml_nodes()));
        }
        out.push(doc_from_json(out.len(), json).with_context(|| format!("YAML document #{}", pos))?);
    }
    Ok(out)
}

fn doc_from_json(index: usize, json: Json) -> Result<ManifestDoc> {
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?.to_string();
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?.to_string();
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("YAML missing metadata.name"))?
        .to_string();
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(ManifestDoc { index, gvk: kstage_kubehub::gvk_key(&api_version, &kind), kind, name, namespace, body: json })
}

/// Server-side apply of one document (forced, field manager `kstage`).
/// Returns the new resourceVersion.
pub async fn apply_document(client: Client, doc: &ManifestDoc) -> Result<Option<String>> {
    let t0 = std::time::Instant::now();
    let api = kstage_kubehub::dynamic_api(client, &doc.gvk, doc.namespace.as_deref()).await?;
    let pp = PatchParams::apply(FIELD_MANAGER).force();
    match api.patch(&doc.name, &pp, &Patch::Apply(&doc.body)).await {
        Ok(obj) => {
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("apply_ok", 1u64);
            debug!(doc = %doc.label(), rv = ?obj.metadata.resource_version, "applied");
            Ok(obj.metadata.resource_version)
        }
        Err(e) => {
            counter!("apply_err", 1u64);
            Err(anyhow!("server-side apply of {} failed: {}", doc.label(), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: kstage-1
---
# comment-only document
---
apiVersion: cluster.x-k8s.io/v1beta1
kind: Cluster
metadata:
  name: capz1
  namespace: kstage-1
spec:
  clusterNetwork:
    pods:
      cidrBlocks: ["192.168.0.0/16"]
"#;

    #[test]
    fn splits_and_skips_empty_documents() {
        let docs = split_documents(STREAM).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].gvk, "v1/Namespace");
        assert_eq!(docs[0].namespace, None);
        assert_eq!(docs[1].gvk, "cluster.x-k8s.io/v1beta1/Cluster");
        assert_eq!(docs[1].index, 1);
        assert_eq!(docs[1].label(), "Cluster/kstage-1/capz1");
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = split_documents("kind: Foo\nmetadata:\n  name: x\n").unwrap_err();
        assert!(format!("{:#}", e1).contains("missing apiVersion"), "{:#}", e1);

        let e2 = split_documents("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err();
        assert!(format!("{:#}", e2).contains("missing kind"));

        let e3 = split_documents("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err();
        assert!(format!("{:#}", e3).contains("missing metadata.name"));
    }

    #[test]
    fn node_budget_guard() {
        let v = serde_json::json!({"a": [1, 2, 3, {"b": 4}]});
        assert!(json_node_budget_exceeded(&v, 3));
        assert!(!json_node_budget_exceeded(&v, 100));
    }
}
