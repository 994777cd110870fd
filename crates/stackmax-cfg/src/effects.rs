//! Instruction classification for stack and control-flow effects.
//!
//! Only a handful of Thumbv6-m instructions can move SP or PC; everything
//! else is linear. The analyzer drives resolvers for the indirect cases.

use stackmax_isa::{DecodedInstr, InstrArgs, Op, LR, PC, SP, SYSM_CONTROL, SYSM_MSP, SYSM_PSP};

/// Stack-pointer effect of one instruction, in bytes of depth (positive =
/// stack grows deeper).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpEffect {
    Delta(i64),
    /// SP is written from a source the analyzer cannot bound (register move
    /// into SP, MSR to MSP/PSP/CONTROL).
    Clobber,
}

/// Classify the stack-pointer effect of an instruction.
pub fn sp_effect(instr: &DecodedInstr) -> SpEffect {
    match (instr.op, instr.args) {
        (Op::Push, InstrArgs::RegList { regs, lr_pc }) => {
            SpEffect::Delta(4 * (i64::from(regs.count()) + i64::from(lr_pc)))
        }
        (Op::Pop, InstrArgs::RegList { regs, lr_pc }) => {
            SpEffect::Delta(-4 * (i64::from(regs.count()) + i64::from(lr_pc)))
        }
        (Op::Sub, InstrArgs::SpImm { offset }) => SpEffect::Delta(i64::from(offset)),
        (Op::Add, InstrArgs::SpImm { offset }) => SpEffect::Delta(-i64::from(offset)),
        // add sp, rm / mov sp, rm: SP from a register
        (Op::Add | Op::Mov, InstrArgs::Regs2 { rd: SP, .. }) => SpEffect::Clobber,
        // msr to a stack pointer or CONTROL (SPSEL switch)
        (Op::Msr, InstrArgs::SysReg { sysm, .. })
            if sysm == SYSM_MSP || sysm == SYSM_PSP || sysm == SYSM_CONTROL =>
        {
            SpEffect::Clobber
        }
        _ => SpEffect::Delta(0),
    }
}

/// Control-flow effect of one instruction, before indirect resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowEffect {
    /// Falls through to the next instruction.
    Linear,
    /// Branch with a resolved target.
    Branch { conditional: bool, target: u32 },
    /// Computed branch (`add pc, rX`, `bx rX`, `mov pc, rX`); the jump-table
    /// resolver or a config hint may still pin it down.
    BranchIndirect,
    /// Direct call (BL).
    Call { target: u32 },
    /// `blx rX`; the literal-pool resolver or a config hint may resolve it.
    CallIndirect,
    /// Restores PC from LR or the stack.
    Return,
    /// Permanently undefined (UDF); execution cannot continue.
    Invalid,
}

/// Classify the control-flow effect of an instruction.
pub fn flow_effect(instr: &DecodedInstr) -> FlowEffect {
    match (instr.op, instr.args) {
        (Op::B, InstrArgs::Branch { cond, target }) => FlowEffect::Branch {
            conditional: cond.is_some(),
            target,
        },
        (Op::Bl, InstrArgs::Call { target }) => FlowEffect::Call { target },
        (Op::Blx, InstrArgs::Reg { .. }) => FlowEffect::CallIndirect,
        (Op::Bx, InstrArgs::Reg { rm: LR }) => FlowEffect::Return,
        (Op::Bx, InstrArgs::Reg { .. }) => FlowEffect::BranchIndirect,
        (Op::Mov, InstrArgs::Regs2 { rd: PC, rm: LR }) => FlowEffect::Return,
        (Op::Mov, InstrArgs::Regs2 { rd: PC, .. }) => FlowEffect::BranchIndirect,
        (Op::Add, InstrArgs::Regs2 { rd: PC, .. }) => FlowEffect::BranchIndirect,
        (Op::Pop, InstrArgs::RegList { lr_pc: true, .. }) => FlowEffect::Return,
        (Op::Udf, _) => FlowEffect::Invalid,
        _ => FlowEffect::Linear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackmax_isa::decode;

    fn instr(hw: u16, address: u32) -> DecodedInstr {
        decode(&hw.to_le_bytes(), address).unwrap()
    }

    #[test]
    fn push_pop_deltas() {
        // push {r4-r7, lr}
        assert_eq!(sp_effect(&instr(0xB5F0, 0)), SpEffect::Delta(20));
        // pop {r4, pc}
        assert_eq!(sp_effect(&instr(0xBD10, 0)), SpEffect::Delta(-8));
    }

    #[test]
    fn sp_immediate_deltas() {
        // sub sp, #24
        assert_eq!(sp_effect(&instr(0xB086, 0)), SpEffect::Delta(24));
        // add sp, #24
        assert_eq!(sp_effect(&instr(0xB006, 0)), SpEffect::Delta(-24));
    }

    #[test]
    fn sp_clobbers() {
        // mov sp, r0
        assert_eq!(sp_effect(&instr(0x4685, 0)), SpEffect::Clobber);
        // add sp, r1 (add rdn=sp)
        assert_eq!(sp_effect(&instr(0x448D, 0)), SpEffect::Clobber);
        // msr msp, r0
        let mut bytes = [0u8; 4];
        bytes[..2].copy_from_slice(&0xF380u16.to_le_bytes());
        bytes[2..].copy_from_slice(&0x8808u16.to_le_bytes());
        let msr = decode(&bytes, 0).unwrap();
        assert_eq!(sp_effect(&msr), SpEffect::Clobber);
    }

    #[test]
    fn msr_primask_is_harmless() {
        // msr primask, r0
        let mut bytes = [0u8; 4];
        bytes[..2].copy_from_slice(&0xF380u16.to_le_bytes());
        bytes[2..].copy_from_slice(&0x8810u16.to_le_bytes());
        let msr = decode(&bytes, 0).unwrap();
        assert_eq!(sp_effect(&msr), SpEffect::Delta(0));
    }

    #[test]
    fn returns() {
        assert_eq!(flow_effect(&instr(0x4770, 0)), FlowEffect::Return); // bx lr
        assert_eq!(flow_effect(&instr(0x46F7, 0)), FlowEffect::Return); // mov pc, lr
        assert_eq!(flow_effect(&instr(0xBD00, 0)), FlowEffect::Return); // pop {pc}
    }

    #[test]
    fn indirect_flows() {
        assert_eq!(flow_effect(&instr(0x4798, 0)), FlowEffect::CallIndirect); // blx r3
        assert_eq!(flow_effect(&instr(0x4710, 0)), FlowEffect::BranchIndirect); // bx r2
        assert_eq!(flow_effect(&instr(0x4497, 0)), FlowEffect::BranchIndirect); // add pc, r2
        assert_eq!(flow_effect(&instr(0x4687, 0)), FlowEffect::BranchIndirect); // mov pc, r0
    }

    #[test]
    fn branches_and_calls() {
        assert_eq!(
            flow_effect(&instr(0xE002, 0x100)),
            FlowEffect::Branch {
                conditional: false,
                target: 0x108
            }
        );
        assert_eq!(
            flow_effect(&instr(0xD0FC, 0x100)),
            FlowEffect::Branch {
                conditional: true,
                target: 0xFC
            }
        );

        let mut bytes = [0u8; 4];
        bytes[..2].copy_from_slice(&0xF000u16.to_le_bytes());
        bytes[2..].copy_from_slice(&0xF802u16.to_le_bytes());
        let bl = decode(&bytes, 0x100).unwrap();
        assert_eq!(flow_effect(&bl), FlowEffect::Call { target: 0x108 });
    }

    #[test]
    fn udf_is_invalid() {
        assert_eq!(flow_effect(&instr(0xDE00, 0)), FlowEffect::Invalid);
    }

    #[test]
    fn ordinary_instructions_are_linear() {
        assert_eq!(flow_effect(&instr(0x2800, 0)), FlowEffect::Linear); // cmp r0, #0
        assert_eq!(sp_effect(&instr(0x2800, 0)), SpEffect::Delta(0));
        assert_eq!(flow_effect(&instr(0xBF30, 0)), FlowEffect::Linear); // wfi
    }
}
