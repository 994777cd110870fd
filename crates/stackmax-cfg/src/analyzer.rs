//! Function analyzer: linear sweep, basic blocks, worst-case depth.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::FxHashMap;
use stackmax_elf::{FuncSym, Image};
use stackmax_isa::{decode, DecodedInstr, InstrArgs, Op, PC};
use tracing::trace;

use crate::effects::{flow_effect, sp_effect, FlowEffect, SpEffect};
use crate::{
    AnalyzeError, BasicBlock, CallSite, FunctionInfo, Result, TargetSpec, Terminator,
};

/// Control flow of one instruction after local resolution.
#[derive(Clone, Debug)]
enum ResolvedFlow {
    Linear,
    Branch { conditional: bool, targets: Vec<u32> },
    Call { target: TargetSpec, tail: bool },
    Return,
    Invalid,
}

/// Analyze a single function symbol against the loaded image.
///
/// # Errors
///
/// Returns the per-function failure classes described by the analysis
/// policy: decode failures, unanalyzable control flow, indeterminate stack.
pub fn analyze_function(image: &Image, func: &FuncSym) -> Result<FunctionInfo> {
    let analyzer = FunctionAnalyzer { image, func };
    analyzer.run()
}

struct FunctionAnalyzer<'a> {
    image: &'a Image,
    func: &'a FuncSym,
}

impl FunctionAnalyzer<'_> {
    fn run(&self) -> Result<FunctionInfo> {
        let instrs = self.sweep()?;
        let flows = self.resolve_flows(&instrs)?;
        let leaders = self.find_leaders(&instrs, &flows);
        let (mut blocks, block_calls) = self.build_blocks(&instrs, &flows, &leaders)?;
        let depths = self.propagate_depths(&blocks)?;

        // keep only reachable blocks; depth and call sites are defined on
        // paths from the entry
        blocks.retain(|block| depths.contains_key(&block.start));

        let prologue_cost = blocks
            .iter()
            .map(|block| depths[&block.start] + block.max_inner_depth)
            .max()
            .unwrap_or(0)
            .max(0) as u32;

        let mut call_sites = Vec::new();
        for (block_start, prefix, site) in block_calls {
            let Some(&entry_depth) = depths.get(&block_start) else {
                continue;
            };
            call_sites.push(CallSite {
                address: site.0,
                depth_at_call: (entry_depth + prefix).max(0) as u32,
                target: site.1,
                tail: site.2,
            });
        }
        call_sites.sort_by_key(|site| site.address);

        let returns = blocks
            .iter()
            .any(|block| block.terminator == Terminator::Return);

        trace!(
            address = format_args!("{:#06x}", self.func.address),
            prologue_cost,
            calls = call_sites.len(),
            "analyzed function"
        );

        Ok(FunctionInfo {
            address: self.func.address,
            size: self.func.size,
            names: self.func.names.clone(),
            prologue_cost,
            call_sites,
            returns,
            blocks,
        })
    }

    /// Linear sweep over the function's code regions.
    fn sweep(&self) -> Result<BTreeMap<u32, DecodedInstr>> {
        let regions = self
            .image
            .function_regions(self.func)
            .map_err(|e| AnalyzeError::Unanalyzable {
                address: self.func.address,
                reason: e.to_string(),
            })?;

        let mut instrs = BTreeMap::new();

        for region in regions.iter().filter(|region| region.is_code) {
            let mut pos = self.func.address + region.offset;
            let end = pos + region.size;

            while pos < end {
                let available = (end - pos).min(4);
                let bytes =
                    self.image
                        .read_bytes(pos, available)
                        .ok_or(AnalyzeError::Unanalyzable {
                            address: pos,
                            reason: "code outside any loaded section".to_string(),
                        })?;

                let instr = decode(bytes, pos)?;
                let size = u32::from(instr.size);
                if pos + size > end {
                    return Err(AnalyzeError::Unanalyzable {
                        address: pos,
                        reason: "instruction crosses a code region boundary".to_string(),
                    });
                }
                instrs.insert(pos, instr);
                pos += size;
            }
        }

        Ok(instrs)
    }

    /// Classify every instruction, running the jump-table and literal-pool
    /// resolvers for the computed transfers.
    fn resolve_flows(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
    ) -> Result<FxHashMap<u32, ResolvedFlow>> {
        let mut flows = FxHashMap::default();

        for (&address, instr) in instrs {
            if let SpEffect::Clobber = sp_effect(instr) {
                return Err(AnalyzeError::StackClobber { address });
            }

            let flow = match flow_effect(instr) {
                FlowEffect::Linear => ResolvedFlow::Linear,
                FlowEffect::Return => ResolvedFlow::Return,
                FlowEffect::Invalid => ResolvedFlow::Invalid,
                FlowEffect::Call { target } => ResolvedFlow::Call {
                    target: TargetSpec::Resolved(target),
                    tail: false,
                },
                FlowEffect::Branch {
                    conditional,
                    target,
                } => self.resolve_branch(instrs, address, conditional, target)?,
                FlowEffect::CallIndirect => {
                    let rm = match instr.args {
                        InstrArgs::Reg { rm } => rm,
                        _ => unreachable!(),
                    };
                    match self.resolve_blx_literal(instrs, address, rm) {
                        Some(target) => ResolvedFlow::Call {
                            target: TargetSpec::Resolved(target),
                            tail: false,
                        },
                        None => ResolvedFlow::Call {
                            target: TargetSpec::Indirect,
                            tail: false,
                        },
                    }
                }
                FlowEffect::BranchIndirect => {
                    // only `add pc, rX` carries the jump-table idiom
                    let table = match (instr.op, instr.args) {
                        (Op::Add, InstrArgs::Regs2 { rd: PC, rm }) if rm < 8 => {
                            self.resolve_jump_table(instrs, address, rm)
                        }
                        _ => None,
                    };
                    match table {
                        Some(targets) => {
                            for &target in &targets {
                                self.check_branch_target(instrs, address, target)?;
                            }
                            ResolvedFlow::Branch {
                                conditional: false,
                                targets,
                            }
                        }
                        // a computed transfer out of the function; a config
                        // hint may still name its targets
                        None => ResolvedFlow::Call {
                            target: TargetSpec::Indirect,
                            tail: true,
                        },
                    }
                }
            };

            flows.insert(address, flow);
        }

        Ok(flows)
    }

    fn resolve_branch(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
        address: u32,
        conditional: bool,
        target: u32,
    ) -> Result<ResolvedFlow> {
        let inside = target >= self.func.address && target < self.func.end();

        if inside {
            self.check_branch_target(instrs, address, target)?;
            return Ok(ResolvedFlow::Branch {
                conditional,
                targets: vec![target],
            });
        }

        // an unconditional branch to another function's entry is a tail call
        if !conditional && self.image.function_at(target).is_some() {
            return Ok(ResolvedFlow::Call {
                target: TargetSpec::Resolved(target),
                tail: true,
            });
        }

        Err(AnalyzeError::Unanalyzable {
            address,
            reason: format!("branch to {target:#06x} outside the function"),
        })
    }

    fn check_branch_target(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
        address: u32,
        target: u32,
    ) -> Result<()> {
        if instrs.contains_key(&target) {
            Ok(())
        } else {
            Err(AnalyzeError::Unanalyzable {
                address,
                reason: format!("branch target {target:#06x} is not an instruction"),
            })
        }
    }

    /// Recognize the bounds-checked jump-table idiom ending at `add pc, rX`:
    ///
    /// ```text
    /// add  rX, pc        ; rX <- pc + table index
    /// ldrb rX, [rX, #4]  ; load branch offset (or ldrh/ldr)
    /// lsls rX, rX, #1    ; offset in halfwords -> bytes
    /// add  pc, rX        ; branch
    /// <data region of offsets, zero-padded>
    /// ```
    fn resolve_jump_table(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
        site: u32,
        rx: u8,
    ) -> Option<Vec<u32>> {
        let mut back = instrs.range(..site).rev();

        let lsls = back.next()?.1;
        match (lsls.op, lsls.args) {
            (Op::Lsl, InstrArgs::ShiftImm { rd, rm, imm: 1 }) if rd == rx && rm == rx => {}
            _ => return None,
        }

        let load = back.next()?.1;
        let entry_size = match (load.op, load.args) {
            (Op::Ldrb, InstrArgs::MemImm { rt, rn, offset: 4 }) if rt == rx && rn == rx => 1u32,
            (Op::Ldrh, InstrArgs::MemImm { rt, rn, offset: 4 }) if rt == rx && rn == rx => 2,
            (Op::Ldr, InstrArgs::MemImm { rt, rn, offset: 4 }) if rt == rx && rn == rx => 4,
            _ => return None,
        };

        let head = back.next()?.1;
        match (head.op, head.args) {
            (Op::Add, InstrArgs::Regs2 { rd, rm: PC }) if rd == rx => {}
            _ => return None,
        }

        // the offset table must sit immediately after the branch
        let table_offset = site + 2 - self.func.address;
        let region = self
            .image
            .function_regions(self.func)
            .ok()?
            .into_iter()
            .find(|region| !region.is_code && region.offset == table_offset)?;

        let mut targets = BTreeSet::new();
        let mut pos = self.func.address + region.offset;
        let region_end = pos + region.size;
        while pos + entry_size <= region_end {
            let value = match entry_size {
                1 => u32::from(*self.image.read_bytes(pos, 1)?.first()?),
                2 => u32::from(self.image.read_u16(pos)?),
                _ => self.image.read_u32(pos)?,
            };
            pos += entry_size;

            // zero entries are table padding
            if value == 0 {
                continue;
            }
            targets.insert(site + 4 + value * 2);
        }

        if targets.is_empty() {
            return None;
        }
        Some(targets.into_iter().collect())
    }

    /// Resolve `blx rX` whose target was materialized by a PC-relative
    /// literal load: scan back for the closest write to `rX` and require it
    /// to be `ldr rX, [pc, #imm]`.
    fn resolve_blx_literal(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
        site: u32,
        rx: u8,
    ) -> Option<u32> {
        let defining = instrs
            .range(..site)
            .rev()
            .map(|(_, instr)| instr)
            .find(|instr| instr.defs() & (1 << rx) != 0)?;

        match (defining.op, defining.args) {
            (Op::Ldr, InstrArgs::MemImm { rt, rn: PC, offset }) if rt == rx => {
                let literal = ((defining.address + 4) & !3) + u32::from(offset);
                let word = self.image.read_u32(literal)?;
                // the loaded value is a branch destination; without the Thumb
                // bit it could not execute
                if word & 1 != 1 {
                    return None;
                }
                Some(word & !1)
            }
            _ => None,
        }
    }

    /// Leaders: function entry, every intra-function branch target, and the
    /// instruction after every control transfer.
    fn find_leaders(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
        flows: &FxHashMap<u32, ResolvedFlow>,
    ) -> BTreeSet<u32> {
        let mut leaders = BTreeSet::new();
        leaders.insert(self.func.address);

        for (&address, instr) in instrs {
            let next = address + u32::from(instr.size);
            match &flows[&address] {
                ResolvedFlow::Linear => {}
                ResolvedFlow::Branch { targets, .. } => {
                    for &target in targets {
                        leaders.insert(target);
                    }
                    if instrs.contains_key(&next) {
                        leaders.insert(next);
                    }
                }
                ResolvedFlow::Call { .. } | ResolvedFlow::Return | ResolvedFlow::Invalid => {
                    if instrs.contains_key(&next) {
                        leaders.insert(next);
                    }
                }
            }
        }

        leaders
    }

    /// Group instructions into leader-delimited blocks, computing per-block
    /// stack deltas, running maxima, and call-site prefixes.
    #[allow(clippy::type_complexity)]
    fn build_blocks(
        &self,
        instrs: &BTreeMap<u32, DecodedInstr>,
        flows: &FxHashMap<u32, ResolvedFlow>,
        leaders: &BTreeSet<u32>,
    ) -> Result<(Vec<BasicBlock>, Vec<(u32, i64, (u32, TargetSpec, bool))>)> {
        let mut blocks = Vec::new();
        // (block start, prefix depth at call, (site address, target, tail))
        let mut calls = Vec::new();

        let mut iter = instrs.iter().peekable();
        while let Some(&(&start, _)) = iter.peek() {
            let mut delta = 0i64;
            let mut max_inner = 0i64;
            let mut end = start;
            let mut terminator = Terminator::FallThrough;
            let mut successors = Vec::new();

            while let Some((&address, instr)) = iter.next() {
                let size = u32::from(instr.size);
                let next = address + size;
                end = next;

                let flow = &flows[&address];

                // depth at the transfer point, before this instruction's own
                // stack effect
                if let ResolvedFlow::Call { target, tail } = flow {
                    calls.push((start, delta, (address, *target, *tail)));
                }

                if let SpEffect::Delta(d) = sp_effect(instr) {
                    delta += d;
                    max_inner = max_inner.max(delta);
                }

                let fall_through_exists = instrs.contains_key(&next);
                let next_is_leader = leaders.contains(&next);

                match flow {
                    ResolvedFlow::Linear => {
                        if !fall_through_exists {
                            return Err(AnalyzeError::Unanalyzable {
                                address,
                                reason: "execution falls out of the function".to_string(),
                            });
                        }
                        if next_is_leader {
                            terminator = Terminator::FallThrough;
                            successors.push(next);
                            break;
                        }
                        continue;
                    }
                    ResolvedFlow::Branch {
                        conditional,
                        targets,
                    } => {
                        if *conditional {
                            if !fall_through_exists {
                                return Err(AnalyzeError::Unanalyzable {
                                    address,
                                    reason: "conditional branch falls out of the function"
                                        .to_string(),
                                });
                            }
                            terminator = Terminator::BranchConditional;
                            successors.push(next);
                        } else {
                            terminator = Terminator::Branch;
                        }
                        for &target in targets {
                            if !successors.contains(&target) {
                                successors.push(target);
                            }
                        }
                    }
                    ResolvedFlow::Call { tail, .. } => {
                        if *tail {
                            terminator = Terminator::Terminal;
                        } else if fall_through_exists {
                            terminator = Terminator::Call;
                            successors.push(next);
                        } else {
                            // a call with nothing after it never returns here
                            terminator = Terminator::Terminal;
                        }
                    }
                    ResolvedFlow::Return => terminator = Terminator::Return,
                    ResolvedFlow::Invalid => terminator = Terminator::Terminal,
                }
                break;
            }

            blocks.push(BasicBlock {
                start,
                end,
                delta,
                max_inner_depth: max_inner,
                successors,
                terminator,
            });
        }

        Ok((blocks, calls))
    }

    /// Forward propagation of worst-case entry depths over the block graph.
    /// Back edges must not change the depth; loops that grow or shrink the
    /// stack make the result indeterminate.
    fn propagate_depths(&self, blocks: &[BasicBlock]) -> Result<FxHashMap<u32, i64>> {
        let by_start: FxHashMap<u32, &BasicBlock> =
            blocks.iter().map(|block| (block.start, block)).collect();

        let mut depths: FxHashMap<u32, i64> = FxHashMap::default();
        let mut updates: FxHashMap<u32, usize> = FxHashMap::default();
        let mut queue = VecDeque::new();

        depths.insert(self.func.address, 0);
        queue.push_back(self.func.address);

        let update_limit = blocks.len() + 2;

        while let Some(start) = queue.pop_front() {
            let block = by_start[&start];
            let exit_depth = depths[&start] + block.delta;

            for &succ in &block.successors {
                let known = depths.get(&succ).copied();
                if known.map_or(true, |d| exit_depth > d) {
                    let count = updates.entry(succ).or_insert(0);
                    *count += 1;
                    if *count > update_limit {
                        return Err(AnalyzeError::LoopInvariant { address: succ });
                    }
                    depths.insert(succ, exit_depth);
                    queue.push_back(succ);
                }
            }
        }

        self.check_back_edges(&by_start, &depths)?;

        Ok(depths)
    }

    /// DFS back-edge check: around any cycle the cumulative delta must be
    /// zero, i.e. each back edge re-enters its header at the header's depth.
    fn check_back_edges(
        &self,
        by_start: &FxHashMap<u32, &BasicBlock>,
        depths: &FxHashMap<u32, i64>,
    ) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Active,
            Done,
        }

        let mut states: FxHashMap<u32, State> = FxHashMap::default();
        // (block, next successor index)
        let mut stack: Vec<(u32, usize)> = vec![(self.func.address, 0)];
        states.insert(self.func.address, State::Active);

        while let Some(frame) = stack.last_mut() {
            let (start, index) = *frame;
            let block = by_start[&start];
            if index < block.successors.len() {
                frame.1 += 1;
                let succ = block.successors[index];

                match states.get(&succ) {
                    Some(State::Active) => {
                        let exit_depth = depths[&start] + block.delta;
                        if exit_depth != depths[&succ] {
                            return Err(AnalyzeError::LoopInvariant { address: succ });
                        }
                    }
                    Some(State::Done) => {}
                    None => {
                        states.insert(succ, State::Active);
                        stack.push((succ, 0));
                    }
                }
            } else {
                states.insert(start, State::Done);
                stack.pop();
            }
        }

        Ok(())
    }
}
