use crate::graph::PortGraph;
use crate::port::PortOwner;
use crate::track::Tracklist;
use crate::transport::Transport;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::Hash;
use tracing::debug;

/// Timing info published to every node for one cycle. Never persisted.
#[derive(Clone, Copy, Debug)]
pub struct CycleContext {
    /// Monotonic sample counter since engine start.
    pub g_start_frame: u64,
    /// Sub-block start within the block, for split-cycle processing.
    pub local_offset: u32,
    pub nframes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Preparing,
    Running,
    Settled,
}

/// Orchestrates one processing cycle: buffer preparation, dependency-order
/// traversal, and the settled hand-off to whoever reads the master output.
///
/// The dependency order is recomputed only on topology changes, under the
/// pause handshake. A cycle that has entered `Running` always completes;
/// sequences of cycles are cancelled between cycles, never inside one.
pub struct Router {
    pub state: CycleState,
    order: Vec<String>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            state: CycleState::Idle,
            order: vec![],
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Recomputes the node-level dependency order and feedback marks.
    ///
    /// Connections are replayed in insertion order; an edge that would
    /// close a cycle at the node level is marked feedback and excluded from
    /// the traversal order. Feedback destinations read previous-cycle
    /// buffers, so every cycle terminates in time proportional to the node
    /// count.
    pub fn recalc_order(&mut self, graph: &mut PortGraph, tracks: &Tracklist) {
        let owner_of = |graph: &PortGraph, id| -> Option<String> {
            graph.port(id).and_then(|p| match &p.lock().owner {
                Some(PortOwner::Track(name)) => Some(name.clone()),
                _ => None,
            })
        };

        let endpoints: Vec<(Option<String>, Option<String>)> = graph
            .connections
            .iter()
            .map(|conn| (owner_of(graph, conn.src), owner_of(graph, conn.dest)))
            .collect();

        let mut adjacency: BTreeMap<String, Vec<String>> = tracks
            .names()
            .iter()
            .map(|name| (name.clone(), vec![]))
            .collect();
        let mut feedback = vec![false; endpoints.len()];
        for (i, (src_node, dest_node)) in endpoints.iter().enumerate() {
            let (Some(src_node), Some(dest_node)) = (src_node, dest_node) else {
                continue;
            };
            if src_node == dest_node
                || would_create_cycle(src_node, dest_node, |node: &String| {
                    adjacency.get(node).cloned().unwrap_or_default()
                })
            {
                feedback[i] = true;
                debug!(
                    "feedback edge {} -> {}, resolved with a one-cycle delay",
                    src_node, dest_node
                );
            } else {
                adjacency
                    .entry(src_node.clone())
                    .or_default()
                    .push(dest_node.clone());
            }
        }
        for (conn, flag) in graph.connections.iter_mut().zip(feedback) {
            conn.feedback = flag;
        }
        graph.sync_feedback_caches();

        let mut indegree: BTreeMap<String, usize> = adjacency
            .keys()
            .map(|name| (name.clone(), 0))
            .collect();
        for targets in adjacency.values() {
            for target in targets {
                if let Some(deg) = indegree.get_mut(target) {
                    *deg += 1;
                }
            }
        }

        let mut queue: VecDeque<String> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut order = Vec::with_capacity(adjacency.len());
        while let Some(name) = queue.pop_front() {
            if let Some(targets) = adjacency.get(&name) {
                for target in targets {
                    if let Some(deg) = indegree.get_mut(target) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(target.clone());
                        }
                    }
                }
            }
            order.push(name);
        }
        // feedback marking keeps the traversal graph acyclic, so nothing
        // should remain; keep stragglers processable regardless
        for name in adjacency.keys() {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        self.order = order;
    }

    /// Runs one processing cycle. By the time the router settles, the
    /// master track's stereo output holds fully-summed audio for the
    /// requested frame range.
    pub fn start_cycle(
        &mut self,
        ctx: CycleContext,
        graph: &PortGraph,
        tracks: &Tracklist,
        transport: &Transport,
    ) {
        self.state = CycleState::Preparing;
        for port in graph.ports() {
            port.lock().begin_cycle(ctx.nframes as usize);
        }

        self.state = CycleState::Running;
        for name in &self.order {
            if let Some(track) = tracks.get(name) {
                track.lock().process(&ctx, transport);
            }
        }

        self.state = CycleState::Settled;
    }
}

/// Whether adding the edge `from -> to` would close a cycle, given the
/// current outgoing-neighbor relation.
pub fn would_create_cycle<Node, Neighbors, Iter>(
    from: &Node,
    to: &Node,
    mut neighbors: Neighbors,
) -> bool
where
    Node: Clone + Eq + Hash,
    Neighbors: FnMut(&Node) -> Iter,
    Iter: IntoIterator<Item = Node>,
{
    if from == to {
        return true;
    }
    let mut visited = HashSet::new();
    has_path(to, from, &mut neighbors, &mut visited)
}

fn has_path<Node, Neighbors, Iter>(
    current: &Node,
    target: &Node,
    neighbors: &mut Neighbors,
    visited: &mut HashSet<Node>,
) -> bool
where
    Node: Clone + Eq + Hash,
    Neighbors: FnMut(&Node) -> Iter,
    Iter: IntoIterator<Item = Node>,
{
    if current == target {
        return true;
    }
    if !visited.insert(current.clone()) {
        return false;
    }
    for next in neighbors(current) {
        if has_path(&next, target, neighbors, visited) {
            return true;
        }
    }
    false
}
