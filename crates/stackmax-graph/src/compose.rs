//! Stack composer: worst-case depth per entrypoint under the preemption
//! model, with witness chains.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{CallGraph, Entrypoint, Fault, FunctionNode, Priority};

/// Bytes pushed by hardware on exception entry (8-word frame).
pub const EXCEPTION_FRAME_BYTES: u32 = 32;

/// Failure classes an entrypoint verdict can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    FunctionUnanalyzable,
    StackIndeterminate,
    IndirectCallUnresolved,
    DanglingCall,
    RecursionDetected,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::FunctionUnanalyzable => "FunctionUnanalyzable",
            FailureKind::StackIndeterminate => "StackIndeterminate",
            FailureKind::IndirectCallUnresolved => "IndirectCallUnresolved",
            FailureKind::DanglingCall => "DanglingCall",
            FailureKind::RecursionDetected => "RecursionDetected",
        };
        f.write_str(name)
    }
}

/// One step of a witness chain. Contributions along a chain sum to the
/// chain's depth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainStep {
    pub address: u32,
    pub name: String,
    /// Bytes this frame keeps occupied while deeper frames run (the leaf
    /// contributes its full worst-case depth).
    pub contribution: u32,
}

/// Why an entrypoint has no numeric verdict; `chain` is the call prefix from
/// the handler down to the offending function.
#[derive(Clone, Debug)]
pub struct ComposeFailure {
    pub kind: FailureKind,
    pub detail: String,
    pub chain: Vec<ChainStep>,
}

/// A preemption surcharge: the worst handler of one strictly-higher
/// priority level.
#[derive(Clone, Debug)]
pub struct PreemptCharge {
    pub name: String,
    pub priority: Priority,
    /// `EXCEPTION_FRAME_BYTES` plus the handler's call-graph depth.
    pub bytes: u32,
}

/// Numeric verdict for one entrypoint.
#[derive(Clone, Debug)]
pub struct DepthReport {
    /// Longest-path depth through the call graph from the handler.
    pub local_depth: u32,
    /// Sum of all preemption surcharges.
    pub preemption: u32,
    pub total: u32,
    /// Witness call chain for `local_depth`.
    pub chain: Vec<ChainStep>,
    /// Contributing preempters, outermost (first to fire) first.
    pub preempters: Vec<PreemptCharge>,
}

/// Verdict or failure for one entrypoint.
#[derive(Clone, Debug)]
pub struct EntrypointResult {
    pub entrypoint: Entrypoint,
    pub outcome: Result<DepthReport, ComposeFailure>,
}

#[derive(Clone, Debug)]
struct Depth {
    depth: u32,
    chain: Vec<ChainStep>,
}

/// Composer over a finished call graph. Depths are memoized per function, so
/// composing many entrypoints shares the traversal.
pub struct Composer<'a> {
    graph: &'a CallGraph,
    memo: FxHashMap<u32, Result<Depth, ComposeFailure>>,
}

impl<'a> Composer<'a> {
    pub fn new(graph: &'a CallGraph) -> Self {
        Self {
            graph,
            memo: FxHashMap::default(),
        }
    }

    /// Cumulative (call-graph) depth of one function, if it has a verdict.
    pub fn function_total(&mut self, address: u32) -> Option<u32> {
        self.function_depth(address).ok().map(|depth| depth.depth)
    }

    /// Compose every entrypoint. Results keep the input (vector) order.
    pub fn compose(&mut self, entrypoints: &[Entrypoint]) -> Vec<EntrypointResult> {
        entrypoints
            .iter()
            .map(|entrypoint| {
                let outcome = self.compose_one(entrypoint, entrypoints);
                EntrypointResult {
                    entrypoint: entrypoint.clone(),
                    outcome,
                }
            })
            .collect()
    }

    fn compose_one(
        &mut self,
        entrypoint: &Entrypoint,
        all: &[Entrypoint],
    ) -> Result<DepthReport, ComposeFailure> {
        let local = self.function_depth(entrypoint.handler)?;

        // one surcharge per strictly-higher priority level: the worst
        // handler of that level
        let mut levels: BTreeMap<i32, Vec<&Entrypoint>> = BTreeMap::new();
        for other in all {
            if other.priority.preempts(entrypoint.priority) {
                levels.entry(other.priority.rank()).or_default().push(other);
            }
        }

        let mut preempters = Vec::new();
        let mut preemption = 0u32;
        // outermost = lowest-priority preempter, so walk ranks descending
        for (_, members) in levels.into_iter().rev() {
            let mut winner: Option<(&Entrypoint, u32)> = None;
            for member in members {
                let depth = match self.function_depth(member.handler) {
                    Ok(depth) => depth.depth,
                    Err(failure) => {
                        return Err(ComposeFailure {
                            kind: failure.kind,
                            detail: format!(
                                "preempting entrypoint `{}`: {}",
                                member.name, failure.detail
                            ),
                            chain: failure.chain,
                        });
                    }
                };
                let better = match winner {
                    None => true,
                    Some((best, best_depth)) => {
                        depth > best_depth
                            || (depth == best_depth
                                && (member.handler, &member.name) < (best.handler, &best.name))
                    }
                };
                if better {
                    winner = Some((member, depth));
                }
            }

            if let Some((best, depth)) = winner {
                let bytes = EXCEPTION_FRAME_BYTES + depth;
                preemption += bytes;
                preempters.push(PreemptCharge {
                    name: best.name.clone(),
                    priority: best.priority,
                    bytes,
                });
            }
        }

        debug!(
            entrypoint = entrypoint.name.as_str(),
            local = local.depth,
            preemption,
            "composed"
        );

        Ok(DepthReport {
            local_depth: local.depth,
            preemption,
            total: local.depth + preemption,
            chain: local.chain,
            preempters,
        })
    }

    /// Longest-path depth for one function, memoized.
    ///
    /// `depth(f) = max(prologue_cost(f), max over call sites c of
    /// depth_at(c) + depth(callee(c)))`; cycles never reach the recurrence
    /// because every function on a cycle carries a recursion fault.
    fn function_depth(&mut self, address: u32) -> Result<Depth, ComposeFailure> {
        let mut stack = vec![address];

        while let Some(&current) = stack.last() {
            if self.memo.contains_key(&current) {
                stack.pop();
                continue;
            }

            let Some(node) = self.graph.node(current) else {
                // edges are only created toward known functions, so this is
                // a caller bug; report it instead of diverging
                self.memo.insert(
                    current,
                    Err(ComposeFailure {
                        kind: FailureKind::DanglingCall,
                        detail: format!("no function at {current:#06x}"),
                        chain: Vec::new(),
                    }),
                );
                stack.pop();
                continue;
            };

            if let Some(fault) = node.faults.first() {
                let failure = failure_from_fault(self.graph, node, fault);
                self.memo.insert(current, Err(failure));
                stack.pop();
                continue;
            }

            let pending: Vec<u32> = node
                .edges
                .iter()
                .map(|edge| edge.callee)
                .filter(|callee| !self.memo.contains_key(callee))
                .collect();

            if pending.is_empty() {
                let result = self.combine(node);
                self.memo.insert(current, result);
                stack.pop();
            } else {
                stack.extend(pending);
            }
        }

        self.memo[&address].clone()
    }

    /// Fold a node's callee depths into its own, picking the argmax chain.
    /// Ties go to the lower-address callee, then the lexicographically
    /// smaller name.
    fn combine(&self, node: &FunctionNode) -> Result<Depth, ComposeFailure> {
        let own = node.prologue_cost();
        let name = node.display_name();

        let mut best_depth = own;
        // (callee address, callee name); None = the prologue-only chain
        let mut best_key: Option<(u32, String)> = None;
        let mut best_chain = vec![ChainStep {
            address: node.address,
            name: name.clone(),
            contribution: own,
        }];

        for edge in &node.edges {
            let callee = match self.memo.get(&edge.callee) {
                Some(Ok(depth)) => depth,
                Some(Err(failure)) => {
                    let mut chain = vec![ChainStep {
                        address: node.address,
                        name: name.clone(),
                        contribution: edge.depth_at_call,
                    }];
                    chain.extend(failure.chain.iter().cloned());
                    return Err(ComposeFailure {
                        kind: failure.kind,
                        detail: failure.detail.clone(),
                        chain,
                    });
                }
                None => continue,
            };

            let candidate = edge.depth_at_call + callee.depth;
            let candidate_key = (edge.callee, self.callee_name(edge.callee));

            let better = candidate > best_depth
                || (candidate == best_depth
                    && best_key
                        .as_ref()
                        .is_some_and(|best| candidate_key < *best));
            if better {
                best_depth = candidate;
                best_key = Some(candidate_key);
                let mut chain = vec![ChainStep {
                    address: node.address,
                    name: name.clone(),
                    contribution: edge.depth_at_call,
                }];
                chain.extend(callee.chain.iter().cloned());
                best_chain = chain;
            }
        }

        Ok(Depth {
            depth: best_depth,
            chain: best_chain,
        })
    }

    fn callee_name(&self, address: u32) -> String {
        self.graph
            .node(address)
            .map_or_else(String::new, FunctionNode::display_name)
    }
}

fn failure_from_fault(graph: &CallGraph, node: &FunctionNode, fault: &Fault) -> ComposeFailure {
    let step = |contribution| ChainStep {
        address: node.address,
        name: node.display_name(),
        contribution,
    };

    match fault {
        Fault::Analysis(error) => ComposeFailure {
            kind: if error.is_stack_indeterminate() {
                FailureKind::StackIndeterminate
            } else {
                FailureKind::FunctionUnanalyzable
            },
            detail: format!("{}: {error}", node.display_name()),
            chain: vec![step(0)],
        },
        Fault::DanglingCall { site, target } => ComposeFailure {
            kind: FailureKind::DanglingCall,
            detail: format!(
                "{} calls {target:#06x} at {site:#06x}, which is not a function",
                node.display_name()
            ),
            chain: vec![step(0)],
        },
        Fault::IndirectUnresolved { site } => ComposeFailure {
            kind: FailureKind::IndirectCallUnresolved,
            detail: format!(
                "{} has an unresolved indirect call at {site:#06x}; add a dynamic_calls hint",
                node.display_name()
            ),
            chain: vec![step(0)],
        },
        Fault::Recursion { cycle } => {
            let names: Vec<String> = cycle
                .iter()
                .map(|address| {
                    graph
                        .node(*address)
                        .map_or_else(|| format!("{address:#06x}"), FunctionNode::display_name)
                })
                .collect();
            ComposeFailure {
                kind: FailureKind::RecursionDetected,
                detail: format!("call cycle: {}", names.join(" -> ")),
                chain: vec![step(0)],
            }
        }
    }
}
