//! Cross-function call graph: edge resolution, hints, cycle detection.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use stackmax_cfg::{AnalyzeError, FunctionInfo, TargetSpec};
use stackmax_elf::{FuncSym, Image};
use tracing::{debug, warn};

use crate::ResolvedHint;

/// A fatal condition attached to one function node. Entrypoints that reach
/// the node cannot be given a numeric verdict.
#[derive(Clone, Debug)]
pub enum Fault {
    /// The function analyzer failed (undecodable or indeterminate stack).
    Analysis(AnalyzeError),
    /// Direct call to an address with no function symbol.
    DanglingCall { site: u32, target: u32 },
    /// Indirect call or computed branch with no resolving hint.
    IndirectUnresolved { site: u32 },
    /// The function participates in a call cycle (entry addresses listed in
    /// cycle order).
    Recursion { cycle: Vec<u32> },
}

/// One resolved call edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallEdge {
    /// Call instruction address.
    pub site: u32,
    /// Bytes the caller occupies when the callee starts.
    pub depth_at_call: u32,
    /// Callee entry address.
    pub callee: u32,
    /// The caller has already surrendered control (tail call).
    pub tail: bool,
}

/// A function in the call graph.
#[derive(Clone, Debug)]
pub struct FunctionNode {
    pub address: u32,
    pub size: u32,
    pub names: Vec<String>,
    /// Analysis output; `None` when the function analyzer failed (the
    /// failure is recorded in `faults`).
    pub info: Option<FunctionInfo>,
    /// Outgoing edges, sorted by (site, callee).
    pub edges: Vec<CallEdge>,
    pub faults: Vec<Fault>,
}

impl FunctionNode {
    pub fn display_name(&self) -> String {
        self.names.join(" / ")
    }

    pub fn prologue_cost(&self) -> u32 {
        self.info.as_ref().map_or(0, |info| info.prologue_cost)
    }
}

/// Whole-program call graph keyed by function entry address.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    pub nodes: BTreeMap<u32, FunctionNode>,
}

impl CallGraph {
    /// Assemble the graph from per-function analysis results and config
    /// hints. Per-function failures become node faults; the graph itself is
    /// always produced.
    pub fn build(
        image: &Image,
        analyses: Vec<(FuncSym, Result<FunctionInfo, AnalyzeError>)>,
        hints: &[ResolvedHint],
    ) -> Self {
        let hint_targets: FxHashMap<u32, &[u32]> = hints
            .iter()
            .map(|hint| (hint.site, hint.targets.as_slice()))
            .collect();

        let mut nodes = BTreeMap::new();

        for (func, analysis) in analyses {
            let mut edges = Vec::new();
            let mut faults = Vec::new();
            let mut info = None;

            match analysis {
                Ok(analyzed) => {
                    for site in &analyzed.call_sites {
                        let hinted = hint_targets.get(&site.address).copied();
                        // hints only rescue sites the analyzer could not pin
                        // to a real function: indirect calls and direct
                        // calls to addresses without a function symbol
                        let needs_hint = match site.target {
                            TargetSpec::Indirect => true,
                            TargetSpec::Resolved(target) => image.function_at(target).is_none(),
                        };
                        match (site.target, hinted) {
                            (_, Some(targets)) if needs_hint => {
                                for &callee in targets {
                                    edges.push(CallEdge {
                                        site: site.address,
                                        depth_at_call: site.depth_at_call,
                                        callee,
                                        tail: site.tail,
                                    });
                                }
                            }
                            (TargetSpec::Resolved(target), hinted) => {
                                if hinted.is_some() {
                                    warn!(
                                        site = format_args!("{:#06x}", site.address),
                                        "ignoring dynamic call hint for an already-resolved call"
                                    );
                                }
                                if image.function_at(target).is_some() {
                                    edges.push(CallEdge {
                                        site: site.address,
                                        depth_at_call: site.depth_at_call,
                                        callee: target,
                                        tail: site.tail,
                                    });
                                } else {
                                    faults.push(Fault::DanglingCall {
                                        site: site.address,
                                        target,
                                    });
                                }
                            }
                            (TargetSpec::Indirect, _) => {
                                faults.push(Fault::IndirectUnresolved {
                                    site: site.address,
                                });
                            }
                        }
                    }
                    info = Some(analyzed);
                }
                Err(error) => faults.push(Fault::Analysis(error)),
            }

            edges.sort_by_key(|edge| (edge.site, edge.callee));
            edges.dedup();

            nodes.insert(
                func.address,
                FunctionNode {
                    address: func.address,
                    size: func.size,
                    names: func.names,
                    info,
                    edges,
                    faults,
                },
            );
        }

        let mut graph = Self { nodes };
        graph.detect_cycles();

        debug!(
            functions = graph.nodes.len(),
            faulted = graph
                .nodes
                .values()
                .filter(|node| !node.faults.is_empty())
                .count(),
            "call graph built"
        );

        graph
    }

    pub fn node(&self, address: u32) -> Option<&FunctionNode> {
        self.nodes.get(&address)
    }

    /// Addresses of functions nothing calls and no vector references.
    pub fn uncalled(&self, referenced: &FxHashSet<u32>) -> Vec<u32> {
        let mut called = FxHashSet::default();
        for node in self.nodes.values() {
            for edge in &node.edges {
                called.insert(edge.callee);
            }
        }
        self.nodes
            .keys()
            .copied()
            .filter(|address| !called.contains(address) && !referenced.contains(address))
            .collect()
    }

    /// DFS cycle detection; every function on a cycle gets a
    /// [`Fault::Recursion`] listing that cycle.
    fn detect_cycles(&mut self) {
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Active,
            Done,
        }

        let mut states: FxHashMap<u32, State> = FxHashMap::default();
        let mut cycles: Vec<Vec<u32>> = Vec::new();

        let starts: Vec<u32> = self.nodes.keys().copied().collect();
        for start in starts {
            if states.contains_key(&start) {
                continue;
            }

            // (address, next edge index), plus the path for cycle extraction
            let mut stack: Vec<(u32, usize)> = vec![(start, 0)];
            states.insert(start, State::Active);

            while let Some(frame) = stack.last_mut() {
                let (address, index) = *frame;
                let edges = &self.nodes[&address].edges;

                if index < edges.len() {
                    frame.1 += 1;
                    let callee = edges[index].callee;
                    // dangling callees never enter the node map
                    if !self.nodes.contains_key(&callee) {
                        continue;
                    }
                    match states.get(&callee) {
                        Some(State::Active) => {
                            let position = stack
                                .iter()
                                .position(|&(a, _)| a == callee)
                                .expect("active node is on the stack");
                            let cycle: Vec<u32> =
                                stack[position..].iter().map(|&(a, _)| a).collect();
                            cycles.push(cycle);
                        }
                        Some(State::Done) => {}
                        None => {
                            states.insert(callee, State::Active);
                            stack.push((callee, 0));
                        }
                    }
                } else {
                    states.insert(address, State::Done);
                    stack.pop();
                }
            }
        }

        for cycle in cycles {
            for &address in &cycle {
                if let Some(node) = self.nodes.get_mut(&address) {
                    node.faults.push(Fault::Recursion {
                        cycle: cycle.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(address: u32, name: &str) -> FuncSym {
        FuncSym {
            address,
            size: 4,
            names: vec![name.to_string()],
        }
    }

    fn info(address: u32, name: &str, cost: u32, calls: Vec<(u32, u32, TargetSpec)>) -> FunctionInfo {
        FunctionInfo {
            address,
            size: 4,
            names: vec![name.to_string()],
            prologue_cost: cost,
            call_sites: calls
                .into_iter()
                .map(|(site, depth, target)| stackmax_cfg::CallSite {
                    address: site,
                    depth_at_call: depth,
                    target,
                    tail: false,
                })
                .collect(),
            returns: true,
            blocks: Vec::new(),
        }
    }

    fn image_with(functions: &[(u32, &str)]) -> Image {
        let mut image = Image::from_code(0x100, vec![0; 0x100]);
        for &(address, name) in functions {
            image.functions.push(FuncSym {
                address,
                size: 4,
                names: vec![name.to_string()],
            });
        }
        image
    }

    #[test]
    fn direct_edges_link_by_address() {
        let image = image_with(&[(0x100, "f"), (0x200, "g")]);
        let graph = CallGraph::build(
            &image,
            vec![
                (
                    sym(0x100, "f"),
                    Ok(info(
                        0x100,
                        "f",
                        8,
                        vec![(0x102, 8, TargetSpec::Resolved(0x200))],
                    )),
                ),
                (sym(0x200, "g"), Ok(info(0x200, "g", 16, vec![]))),
            ],
            &[],
        );

        let f = graph.node(0x100).unwrap();
        assert_eq!(f.edges.len(), 1);
        assert_eq!(f.edges[0].callee, 0x200);
        assert!(f.faults.is_empty());
    }

    #[test]
    fn dangling_call_is_a_fault() {
        let image = image_with(&[(0x100, "f")]);
        let graph = CallGraph::build(
            &image,
            vec![(
                sym(0x100, "f"),
                Ok(info(
                    0x100,
                    "f",
                    8,
                    vec![(0x102, 8, TargetSpec::Resolved(0x999))],
                )),
            )],
            &[],
        );

        let f = graph.node(0x100).unwrap();
        assert!(f.edges.is_empty());
        assert!(matches!(
            f.faults[0],
            Fault::DanglingCall {
                site: 0x102,
                target: 0x999
            }
        ));
    }

    #[test]
    fn hint_resolves_indirect_site() {
        let image = image_with(&[(0x100, "f"), (0x200, "g"), (0x300, "h")]);
        let graph = CallGraph::build(
            &image,
            vec![
                (
                    sym(0x100, "f"),
                    Ok(info(0x100, "f", 8, vec![(0x102, 8, TargetSpec::Indirect)])),
                ),
                (sym(0x200, "g"), Ok(info(0x200, "g", 16, vec![]))),
                (sym(0x300, "h"), Ok(info(0x300, "h", 24, vec![]))),
            ],
            &[ResolvedHint {
                site: 0x102,
                targets: vec![0x200, 0x300],
            }],
        );

        let f = graph.node(0x100).unwrap();
        assert_eq!(f.edges.len(), 2);
        assert_eq!(f.edges[0].callee, 0x200);
        assert_eq!(f.edges[1].callee, 0x300);
        assert!(f.faults.is_empty());
    }

    #[test]
    fn hint_does_not_override_a_valid_direct_call() {
        let image = image_with(&[(0x100, "f"), (0x200, "g"), (0x300, "shallow")]);
        let graph = CallGraph::build(
            &image,
            vec![
                (
                    sym(0x100, "f"),
                    Ok(info(
                        0x100,
                        "f",
                        8,
                        vec![(0x102, 8, TargetSpec::Resolved(0x200))],
                    )),
                ),
                (sym(0x200, "g"), Ok(info(0x200, "g", 64, vec![]))),
                (sym(0x300, "shallow"), Ok(info(0x300, "shallow", 0, vec![]))),
            ],
            &[ResolvedHint {
                site: 0x102,
                targets: vec![0x300],
            }],
        );

        // the already-resolved edge to `g` survives; the hint is ignored
        let f = graph.node(0x100).unwrap();
        assert_eq!(f.edges.len(), 1);
        assert_eq!(f.edges[0].callee, 0x200);
        assert!(f.faults.is_empty());
    }

    #[test]
    fn hint_rescues_a_dangling_direct_call() {
        let image = image_with(&[(0x100, "f"), (0x200, "g")]);
        let graph = CallGraph::build(
            &image,
            vec![
                (
                    sym(0x100, "f"),
                    Ok(info(
                        0x100,
                        "f",
                        8,
                        vec![(0x102, 8, TargetSpec::Resolved(0x999))],
                    )),
                ),
                (sym(0x200, "g"), Ok(info(0x200, "g", 16, vec![]))),
            ],
            &[ResolvedHint {
                site: 0x102,
                targets: vec![0x200],
            }],
        );

        let f = graph.node(0x100).unwrap();
        assert_eq!(f.edges.len(), 1);
        assert_eq!(f.edges[0].callee, 0x200);
        assert!(f.faults.is_empty());
    }

    #[test]
    fn unhinted_indirect_is_a_fault() {
        let image = image_with(&[(0x100, "f")]);
        let graph = CallGraph::build(
            &image,
            vec![(
                sym(0x100, "f"),
                Ok(info(0x100, "f", 8, vec![(0x102, 8, TargetSpec::Indirect)])),
            )],
            &[],
        );

        assert!(matches!(
            graph.node(0x100).unwrap().faults[0],
            Fault::IndirectUnresolved { site: 0x102 }
        ));
    }

    #[test]
    fn mutual_recursion_marks_both() {
        let image = image_with(&[(0x100, "f"), (0x200, "g")]);
        let graph = CallGraph::build(
            &image,
            vec![
                (
                    sym(0x100, "f"),
                    Ok(info(
                        0x100,
                        "f",
                        8,
                        vec![(0x102, 8, TargetSpec::Resolved(0x200))],
                    )),
                ),
                (
                    sym(0x200, "g"),
                    Ok(info(
                        0x200,
                        "g",
                        8,
                        vec![(0x202, 8, TargetSpec::Resolved(0x100))],
                    )),
                ),
            ],
            &[],
        );

        for address in [0x100, 0x200] {
            let node = graph.node(address).unwrap();
            assert!(
                node.faults
                    .iter()
                    .any(|fault| matches!(fault, Fault::Recursion { cycle } if cycle.len() == 2)),
                "no recursion fault on {address:#x}"
            );
        }
    }

    #[test]
    fn self_recursion_detected() {
        let image = image_with(&[(0x100, "f")]);
        let graph = CallGraph::build(
            &image,
            vec![(
                sym(0x100, "f"),
                Ok(info(
                    0x100,
                    "f",
                    8,
                    vec![(0x102, 8, TargetSpec::Resolved(0x100))],
                )),
            )],
            &[],
        );

        assert!(matches!(
            graph.node(0x100).unwrap().faults[0],
            Fault::Recursion { .. }
        ));
    }

    #[test]
    fn duplicate_edges_are_merged() {
        let image = image_with(&[(0x100, "f"), (0x200, "g")]);
        let graph = CallGraph::build(
            &image,
            vec![
                (
                    sym(0x100, "f"),
                    Ok(info(
                        0x100,
                        "f",
                        8,
                        vec![
                            (0x102, 8, TargetSpec::Resolved(0x200)),
                            (0x102, 8, TargetSpec::Resolved(0x200)),
                        ],
                    )),
                ),
                (sym(0x200, "g"), Ok(info(0x200, "g", 0, vec![]))),
            ],
            &[],
        );

        assert_eq!(graph.node(0x100).unwrap().edges.len(), 1);
    }

    #[test]
    fn analysis_failure_becomes_fault() {
        let image = image_with(&[(0x100, "f")]);
        let graph = CallGraph::build(
            &image,
            vec![(
                sym(0x100, "f"),
                Err(AnalyzeError::StackClobber { address: 0x102 }),
            )],
            &[],
        );

        let node = graph.node(0x100).unwrap();
        assert!(node.info.is_none());
        assert!(matches!(node.faults[0], Fault::Analysis(_)));
    }
}
