use std::error::Error;

use crate::stratus::k8s::node::Node;
use crate::stratus::k8s::pod::Pod;
use crate::stratus::k8s::quantity::{parse_cpu, parse_memory};
use crate::stratus::logger::log_warn;
use crate::stratus::util::{new_error, with_context};

const COMPONENT: &str = "scheduler";

/// Node selection strategy. Implementations receive the ready nodes for this
/// tick and pick exactly one for the pod.
pub trait PlacementPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select<'a>(
        &self,
        pod: &Pod,
        nodes: &'a [Node],
    ) -> Result<&'a Node, Box<dyn Error + Send + Sync>>;
}

/// Deterministic placement keyed by pod name: filter by the pod's node
/// selector, then index the eligible list with a polynomial hash of the name.
pub struct BasicPolicy;

impl PlacementPolicy for BasicPolicy {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn select<'a>(
        &self,
        pod: &Pod,
        nodes: &'a [Node],
    ) -> Result<&'a Node, Box<dyn Error + Send + Sync>> {
        let eligible = eligible_nodes(pod, nodes)?;
        Ok(hash_select(&pod.metadata.name, &eligible))
    }
}

/// Best-fit placement: among nodes with enough allocatable CPU and memory,
/// pick the one where the pod exerts the least pressure. Falls back to the
/// basic hash when the pod's own requests cannot be parsed.
pub struct ResourcePolicy;

impl PlacementPolicy for ResourcePolicy {
    fn name(&self) -> &'static str {
        "resource-aware"
    }

    fn select<'a>(
        &self,
        pod: &Pod,
        nodes: &'a [Node],
    ) -> Result<&'a Node, Box<dyn Error + Send + Sync>> {
        let eligible = eligible_nodes(pod, nodes)?;

        let (cpu_request, memory_request) = match pod_resource_requests(pod) {
            Ok(requests) => requests,
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Failed to compute pod resource requests; falling back to basic selection",
                    &[
                        ("pod", pod.metadata.name.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                return Ok(hash_select(&pod.metadata.name, &eligible));
            }
        };

        let mut best: Option<(&Node, f64)> = None;
        for &node in &eligible {
            let (cpu_alloc, memory_alloc) = match node_allocatable(node) {
                Ok(allocatable) => allocatable,
                Err(err) => {
                    log_warn(
                        COMPONENT,
                        "Skipping node with unusable allocatable resources",
                        &[
                            ("node", node.metadata.name.as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                    continue;
                }
            };

            if cpu_alloc < cpu_request || memory_alloc < memory_request {
                continue;
            }

            // Score by the dimension under higher pressure; lower is better.
            let cpu_score = cpu_request as f64 / cpu_alloc as f64;
            let memory_score = memory_request as f64 / memory_alloc as f64;
            let score = cpu_score.max(memory_score);

            if best.map(|(_, current)| score < current).unwrap_or(true) {
                best = Some((node, score));
            }
        }

        best.map(|(node, _)| node)
            .ok_or_else(|| new_error("no node with sufficient resources available"))
    }
}

/// Nodes passing the pod's node selector; all of them when no selector is
/// set.
fn eligible_nodes<'a>(
    pod: &Pod,
    nodes: &'a [Node],
) -> Result<Vec<&'a Node>, Box<dyn Error + Send + Sync>> {
    if pod.spec.node_selector.is_empty() {
        return Ok(nodes.iter().collect());
    }

    let eligible: Vec<&Node> = nodes
        .iter()
        .filter(|node| {
            pod.spec
                .node_selector
                .iter()
                .all(|(key, value)| node.metadata.labels.get(key) == Some(value))
        })
        .collect();

    if eligible.is_empty() {
        return Err(new_error(format!(
            "no nodes match node selector for pod {}",
            pod.metadata.name
        )));
    }
    Ok(eligible)
}

/// Polynomial name hash: h = 31*h + byte, seeded at zero.
pub fn name_hash(name: &str) -> usize {
    name.bytes()
        .fold(0usize, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as usize))
}

fn hash_select<'a>(pod_name: &str, eligible: &[&'a Node]) -> &'a Node {
    eligible[name_hash(pod_name) % eligible.len()]
}

/// Total CPU (millicores) and memory (bytes) requests across the pod's
/// containers. Containers without a request contribute zero.
pub fn pod_resource_requests(pod: &Pod) -> Result<(i64, i64), Box<dyn Error + Send + Sync>> {
    let mut total_cpu = 0;
    let mut total_memory = 0;

    for container in &pod.spec.containers {
        if let Some(cpu) = container.resources.requests.get("cpu") {
            total_cpu += parse_cpu(cpu).map_err(|e| with_context(e, "invalid CPU request"))?;
        }
        if let Some(memory) = container.resources.requests.get("memory") {
            total_memory +=
                parse_memory(memory).map_err(|e| with_context(e, "invalid memory request"))?;
        }
    }

    Ok((total_cpu, total_memory))
}

fn node_allocatable(node: &Node) -> Result<(i64, i64), Box<dyn Error + Send + Sync>> {
    let cpu = node
        .status
        .allocatable
        .get("cpu")
        .ok_or_else(|| new_error("node has no allocatable CPU"))?;
    let memory = node
        .status
        .allocatable
        .get("memory")
        .ok_or_else(|| new_error("node has no allocatable memory"))?;

    let cpu = parse_cpu(cpu).map_err(|e| with_context(e, "invalid CPU allocatable"))?;
    let memory = parse_memory(memory).map_err(|e| with_context(e, "invalid memory allocatable"))?;
    Ok((cpu, memory))
}
