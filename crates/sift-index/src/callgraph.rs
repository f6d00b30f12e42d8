//! Bounded breadth-first traversal over a snapshot's call edges.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use serde::Serialize;
use sift_store::{CallEdge, Callee, Symbol, SymbolId};

use crate::error::InputError;

/// Which edges to follow from a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Callees of the symbol.
    Out,
    /// Callers of the symbol.
    In,
    Both,
}

impl FromStr for Direction {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "out" => Ok(Self::Out),
            "in" => Ok(Self::In),
            "both" => Ok(Self::Both),
            _ => Err(InputError::InvalidDirection(s.to_owned())),
        }
    }
}

/// A node of a traversal result, tagged with its BFS depth from the seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphNode {
    Symbol { symbol: Symbol, depth: u32 },
    /// Callee that could not be resolved to a definition. Always a leaf.
    Unresolved { name: String, depth: u32 },
}

impl GraphNode {
    #[must_use]
    pub fn depth(&self) -> u32 {
        match self {
            Self::Symbol { depth, .. } | Self::Unresolved { depth, .. } => *depth,
        }
    }

    #[must_use]
    pub fn symbol_id(&self) -> Option<&SymbolId> {
        match self {
            Self::Symbol { symbol, .. } => Some(&symbol.id),
            Self::Unresolved { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<CallEdge>,
}

/// Symbols and edges of one snapshot, indexed for traversal.
#[derive(Debug, Default)]
pub struct CallGraph {
    symbols: HashMap<SymbolId, Symbol>,
    edges: Vec<CallEdge>,
    outgoing: HashMap<SymbolId, Vec<usize>>,
    incoming: HashMap<SymbolId, Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Symbol(SymbolId),
    Name(String),
}

impl CallGraph {
    #[must_use]
    pub fn new(symbols: Vec<Symbol>, edges: Vec<CallEdge>) -> Self {
        let symbols: HashMap<SymbolId, Symbol> =
            symbols.into_iter().map(|s| (s.id.clone(), s)).collect();
        let mut outgoing: HashMap<SymbolId, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<SymbolId, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.caller.clone()).or_default().push(i);
            if let Callee::Resolved { symbol_id } = &edge.callee {
                incoming.entry(symbol_id.clone()).or_default().push(i);
            }
        }
        Self {
            symbols,
            edges,
            outgoing,
            incoming,
        }
    }

    #[must_use]
    pub fn symbol(&self, id: &SymbolId) -> Option<&Symbol> {
        self.symbols.get(id)
    }

    /// Breadth-first subgraph around `seed`.
    ///
    /// Depth 0 returns only the seed. Every node and edge appears at most once, so cycles
    /// terminate. At most `max_edges_per_hop` edges are expanded from each node. A resolved
    /// callee whose definition is unknown is reported as an unresolved leaf.
    #[must_use]
    pub fn traverse(
        &self,
        seed: &SymbolId,
        depth: u32,
        direction: Direction,
        max_edges_per_hop: usize,
    ) -> Subgraph {
        let mut graph = Subgraph::default();
        let Some(seed_symbol) = self.symbols.get(seed) else {
            return graph;
        };

        let mut visited: HashSet<NodeKey> = HashSet::from([NodeKey::Symbol(seed.clone())]);
        let mut seen_edges: HashSet<usize> = HashSet::new();
        let mut queue = VecDeque::from([(seed.clone(), 0u32)]);
        graph.nodes.push(GraphNode::Symbol {
            symbol: seed_symbol.clone(),
            depth: 0,
        });

        while let Some((current, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            let mut expanded = 0;
            for idx in self.adjacent(&current, direction) {
                if expanded >= max_edges_per_hop {
                    break;
                }
                if !seen_edges.insert(idx) {
                    continue;
                }
                expanded += 1;
                let edge = &self.edges[idx];
                graph.edges.push(edge.clone());

                let next = if edge.caller == current {
                    self.callee_key(edge)
                } else {
                    NodeKey::Symbol(edge.caller.clone())
                };
                if !visited.insert(next.clone()) {
                    continue;
                }
                match next {
                    NodeKey::Symbol(id) => {
                        let Some(symbol) = self.symbols.get(&id) else {
                            continue;
                        };
                        graph.nodes.push(GraphNode::Symbol {
                            symbol: symbol.clone(),
                            depth: level + 1,
                        });
                        queue.push_back((id, level + 1));
                    }
                    NodeKey::Name(name) => graph.nodes.push(GraphNode::Unresolved {
                        name,
                        depth: level + 1,
                    }),
                }
            }
        }
        graph
    }

    /// Edge indexes touching `id` in the requested direction, outgoing first.
    fn adjacent(&self, id: &SymbolId, direction: Direction) -> Vec<usize> {
        let out = self.outgoing.get(id).map(Vec::as_slice).unwrap_or_default();
        let inc = self.incoming.get(id).map(Vec::as_slice).unwrap_or_default();
        match direction {
            Direction::Out => out.to_vec(),
            Direction::In => inc.to_vec(),
            Direction::Both => out.iter().chain(inc).copied().collect(),
        }
    }

    fn callee_key(&self, edge: &CallEdge) -> NodeKey {
        match &edge.callee {
            Callee::Resolved { symbol_id } if self.symbols.contains_key(symbol_id) => {
                NodeKey::Symbol(symbol_id.clone())
            }
            _ => NodeKey::Name(edge.callee_name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_store::{ChunkId, SymbolKind};

    fn sym(name: &str) -> Symbol {
        Symbol {
            id: SymbolId::from_raw(name),
            name: name.into(),
            qualname: name.into(),
            kind: SymbolKind::Function,
            file_path: format!("{name}.py"),
            language: "python".into(),
            start_line: 1,
            end_line: 2,
            parent: None,
            chunk_id: ChunkId::from_raw(format!("chunk-{name}")),
        }
    }

    fn call(caller: &str, callee: &str) -> CallEdge {
        CallEdge {
            caller: SymbolId::from_raw(caller),
            callee_name: callee.into(),
            callee: Callee::Resolved {
                symbol_id: SymbolId::from_raw(callee),
            },
            chunk_id: ChunkId::from_raw(format!("chunk-{caller}")),
            file_path: format!("{caller}.py"),
            line: 2,
        }
    }

    fn unresolved(caller: &str, callee: &str) -> CallEdge {
        CallEdge {
            callee: Callee::Unresolved {
                name: callee.into(),
            },
            ..call(caller, callee)
        }
    }

    fn names(graph: &Subgraph) -> Vec<String> {
        graph
            .nodes
            .iter()
            .map(|n| match n {
                GraphNode::Symbol { symbol, depth } => format!("{}@{depth}", symbol.name),
                GraphNode::Unresolved { name, depth } => format!("?{name}@{depth}"),
            })
            .collect()
    }

    fn id(name: &str) -> SymbolId {
        SymbolId::from_raw(name)
    }

    #[test]
    fn direction_parses() {
        assert_eq!("IN".parse::<Direction>().unwrap(), Direction::In);
        assert!(matches!(
            "sideways".parse::<Direction>(),
            Err(InputError::InvalidDirection(_))
        ));
    }

    #[test]
    fn depth_zero_is_seed_only() {
        let graph = CallGraph::new(vec![sym("run"), sym("login")], vec![call("run", "login")]);
        let sub = graph.traverse(&id("run"), 0, Direction::Both, 50);
        assert_eq!(names(&sub), vec!["run@0"]);
        assert!(sub.edges.is_empty());
    }

    #[test]
    fn in_direction_finds_callers() {
        let graph = CallGraph::new(vec![sym("run"), sym("login")], vec![call("run", "login")]);
        let sub = graph.traverse(&id("login"), 1, Direction::In, 50);
        assert_eq!(names(&sub), vec!["login@0", "run@1"]);
        assert_eq!(sub.edges.len(), 1);
    }

    #[test]
    fn mutual_recursion_terminates_without_duplicates() {
        let graph = CallGraph::new(
            vec![sym("a"), sym("b")],
            vec![call("a", "b"), call("b", "a")],
        );
        for direction in [Direction::Out, Direction::In, Direction::Both] {
            let sub = graph.traverse(&id("a"), 1, direction, 50);
            assert_eq!(names(&sub), vec!["a@0", "b@1"]);
            for depth in [2, 10, 1000] {
                let sub = graph.traverse(&id("a"), depth, direction, 50);
                assert_eq!(names(&sub), vec!["a@0", "b@1"]);
                assert_eq!(sub.edges.len(), 2);
            }
        }
    }

    #[test]
    fn self_recursion_is_one_edge() {
        let graph = CallGraph::new(vec![sym("f")], vec![call("f", "f")]);
        let sub = graph.traverse(&id("f"), 5, Direction::Both, 50);
        assert_eq!(names(&sub), vec!["f@0"]);
        assert_eq!(sub.edges.len(), 1);
    }

    #[test]
    fn unresolved_callees_are_deduplicated_leaves() {
        let graph = CallGraph::new(
            vec![sym("run"), sym("step")],
            vec![
                unresolved("run", "print"),
                call("run", "step"),
                unresolved("step", "print"),
            ],
        );
        let sub = graph.traverse(&id("run"), 3, Direction::Out, 50);
        assert_eq!(names(&sub), vec!["run@0", "?print@1", "step@1"]);
        assert_eq!(sub.edges.len(), 3);
    }

    #[test]
    fn dangling_resolved_callee_becomes_leaf() {
        let graph = CallGraph::new(vec![sym("run")], vec![call("run", "gone")]);
        let sub = graph.traverse(&id("run"), 1, Direction::Out, 50);
        assert_eq!(names(&sub), vec!["run@0", "?gone@1"]);
    }

    #[test]
    fn per_hop_edge_limit() {
        let symbols: Vec<Symbol> = std::iter::once(sym("hub"))
            .chain((0..10).map(|i| sym(&format!("leaf{i}"))))
            .collect();
        let edges = (0..10).map(|i| call("hub", &format!("leaf{i}"))).collect();
        let graph = CallGraph::new(symbols, edges);
        let sub = graph.traverse(&id("hub"), 1, Direction::Out, 3);
        assert_eq!(sub.nodes.len(), 4);
        assert_eq!(sub.edges.len(), 3);
    }

    #[test]
    fn unknown_seed_is_empty() {
        let graph = CallGraph::new(vec![], vec![]);
        let sub = graph.traverse(&id("nope"), 3, Direction::Both, 50);
        assert!(sub.nodes.is_empty());
    }

    #[test]
    fn depth_is_recorded_per_level() {
        let graph = CallGraph::new(
            vec![sym("a"), sym("b"), sym("c")],
            vec![call("a", "b"), call("b", "c")],
        );
        let sub = graph.traverse(&id("a"), 2, Direction::Out, 50);
        assert_eq!(names(&sub), vec!["a@0", "b@1", "c@2"]);
        assert_eq!(sub.nodes[2].depth(), 2);
        let sub = graph.traverse(&id("a"), 1, Direction::Out, 50);
        assert_eq!(names(&sub), vec!["a@0", "b@1"]);
    }
}
