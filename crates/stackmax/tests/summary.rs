//! End-to-end pipeline tests against a synthetic Cortex-M0 ELF.

use stackmax::pipeline::{analyze_bytes, PipelineError};
use stackmax_graph::{FailureKind, Priority};

/// Function symbol definition for the ELF builder.
struct SymbolDef {
    name: &'static str,
    /// Address with the Thumb bit already set for functions.
    value: u32,
    size: u32,
    /// st_info byte; 0x12 = global function, 0x00 = no type (markers).
    info: u8,
}

/// Assemble halfwords into little-endian bytes.
fn asm(halfwords: &[u16]) -> Vec<u8> {
    halfwords.iter().flat_map(|hw| hw.to_le_bytes()).collect()
}

/// Build a minimal 32-bit little-endian ARM executable ELF: a vector table,
/// a text section, and a symbol table.
fn build_elf(text_addr: u32, text: &[u8], vectors: &[u32], symbols: &[SymbolDef]) -> Vec<u8> {
    const EHSIZE: usize = 52;
    const SHENTSIZE: usize = 40;

    let shstrtab = b"\0.text\0.vector_table\0.symtab\0.strtab\0.shstrtab\0".to_vec();
    let name_text = 1u32;
    let name_vectors = 7u32;
    let name_symtab = 21u32;
    let name_strtab = 29u32;
    let name_shstrtab = 37u32;

    // string table: null + symbol names
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for sym in symbols {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(sym.name.as_bytes());
        strtab.push(0);
    }

    // symbol table: null entry + the definitions
    let mut symtab = vec![0u8; 16];
    for (sym, &name_offset) in symbols.iter().zip(&name_offsets) {
        symtab.extend_from_slice(&name_offset.to_le_bytes());
        symtab.extend_from_slice(&sym.value.to_le_bytes());
        symtab.extend_from_slice(&sym.size.to_le_bytes());
        symtab.push(sym.info);
        symtab.push(0);
        symtab.extend_from_slice(&1u16.to_le_bytes()); // shndx = .text
    }

    let vector_bytes: Vec<u8> = vectors.iter().flat_map(|word| word.to_le_bytes()).collect();

    // file layout: header, section payloads, then section headers
    let off_text = EHSIZE;
    let off_vectors = off_text + text.len();
    let off_symtab = off_vectors + vector_bytes.len();
    let off_strtab = off_symtab + symtab.len();
    let off_shstrtab = off_strtab + strtab.len();
    let shoff = off_shstrtab + shstrtab.len();

    let mut elf = Vec::new();

    // ELF header
    elf.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
    elf.extend_from_slice(&[0u8; 8]); // padding
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&40u16.to_le_bytes()); // EM_ARM
    elf.extend_from_slice(&1u32.to_le_bytes()); // version
    elf.extend_from_slice(&(text_addr | 1).to_le_bytes()); // entry
    elf.extend_from_slice(&0u32.to_le_bytes()); // phoff
    elf.extend_from_slice(&(shoff as u32).to_le_bytes());
    elf.extend_from_slice(&0x0500_0000u32.to_le_bytes()); // EABI v5
    elf.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes()); // phentsize
    elf.extend_from_slice(&0u16.to_le_bytes()); // phnum
    elf.extend_from_slice(&(SHENTSIZE as u16).to_le_bytes());
    elf.extend_from_slice(&6u16.to_le_bytes()); // shnum
    elf.extend_from_slice(&5u16.to_le_bytes()); // shstrndx
    assert_eq!(elf.len(), EHSIZE);

    elf.extend_from_slice(text);
    elf.extend_from_slice(&vector_bytes);
    elf.extend_from_slice(&symtab);
    elf.extend_from_slice(&strtab);
    elf.extend_from_slice(&shstrtab);

    let mut section = |name: u32, sh_type: u32, flags: u32, addr: u32, offset: usize, size: usize, link: u32, entsize: u32| {
        elf.extend_from_slice(&name.to_le_bytes());
        elf.extend_from_slice(&sh_type.to_le_bytes());
        elf.extend_from_slice(&flags.to_le_bytes());
        elf.extend_from_slice(&addr.to_le_bytes());
        elf.extend_from_slice(&(offset as u32).to_le_bytes());
        elf.extend_from_slice(&(size as u32).to_le_bytes());
        elf.extend_from_slice(&link.to_le_bytes());
        elf.extend_from_slice(&0u32.to_le_bytes()); // info
        elf.extend_from_slice(&4u32.to_le_bytes()); // addralign
        elf.extend_from_slice(&entsize.to_le_bytes());
    };

    // null, .text, .vector_table, .symtab, .strtab, .shstrtab
    section(0, 0, 0, 0, 0, 0, 0, 0);
    section(name_text, 1, 0x2 | 0x4, text_addr, off_text, text.len(), 0, 0);
    section(name_vectors, 1, 0x2, 0, off_vectors, vector_bytes.len(), 0, 0);
    section(name_symtab, 2, 0, 0, off_symtab, symtab.len(), 4, 16);
    section(name_strtab, 3, 0, 0, off_strtab, strtab.len(), 0, 0);
    section(name_shstrtab, 3, 0, 0, off_shstrtab, shstrtab.len(), 0, 0);

    elf
}

/// Text section for the happy-path binary:
///
/// ```text
/// 0x100 main:           push {r4, lr}; bl helper; pop {r4, pc}
/// 0x130 helper:         sub sp, #8; add sp, #8; bx lr
/// 0x140 irq_handler:    push {r7, lr}; pop {r7, pc}
/// 0x150 DefaultHandler: b .
/// ```
fn test_text() -> Vec<u8> {
    let mut text = vec![0u8; 0x52];
    text[0x00..0x08].copy_from_slice(&asm(&[0xB510, 0xF000, 0xF815, 0xBD10]));
    text[0x30..0x36].copy_from_slice(&asm(&[0xB082, 0xB002, 0x4770]));
    text[0x40..0x44].copy_from_slice(&asm(&[0xB580, 0xBD80]));
    text[0x50..0x52].copy_from_slice(&asm(&[0xE7FE]));
    text
}

fn test_vectors() -> Vec<u32> {
    let mut vectors = vec![0u32; 17];
    vectors[0] = 0x2000_1000; // initial SP
    vectors[1] = 0x101; // Reset -> main
    vectors[2] = 0x151; // NMI -> DefaultHandler (pruned)
    vectors[3] = 0x151; // HardFault -> DefaultHandler
    vectors[11] = 0x151; // SVCall (pruned)
    vectors[14] = 0x151; // PendSV (pruned)
    vectors[15] = 0x151; // SysTick (pruned)
    vectors[16] = 0x141; // IRQ0 -> irq_handler
    vectors
}

fn test_symbols() -> Vec<SymbolDef> {
    vec![
        SymbolDef {
            name: "main",
            value: 0x101,
            size: 8,
            info: 0x12,
        },
        SymbolDef {
            name: "helper",
            value: 0x131,
            size: 6,
            info: 0x12,
        },
        SymbolDef {
            name: "irq_handler",
            value: 0x141,
            size: 4,
            info: 0x12,
        },
        SymbolDef {
            name: "DefaultHandler",
            value: 0x151,
            size: 2,
            info: 0x12,
        },
    ]
}

fn test_binary() -> Vec<u8> {
    build_elf(0x100, &test_text(), &test_vectors(), &test_symbols())
}

#[test]
fn summary_without_config() {
    let analysis = analyze_bytes(&test_binary(), None).unwrap();

    assert!(!analysis.has_failures());

    let names: Vec<&str> = analysis
        .results
        .iter()
        .map(|result| result.entrypoint.name.as_str())
        .collect();
    assert_eq!(names, vec!["Reset", "HardFault", "irq_handler"]);

    let by_name = |name: &str| {
        analysis
            .results
            .iter()
            .find(|result| result.entrypoint.name == name)
            .unwrap()
            .outcome
            .as_ref()
            .unwrap()
    };

    // main holds 8 across the call into helper (8)
    let reset = by_name("Reset");
    assert_eq!(reset.local_depth, 16);
    // preempted by HardFault (32 + 0) and IRQ0 at group 0 (32 + 8)
    assert_eq!(reset.preemption, 72);
    assert_eq!(reset.total, 88);

    let irq_entry = analysis
        .results
        .iter()
        .find(|result| result.entrypoint.name == "irq_handler")
        .unwrap();
    assert_eq!(irq_entry.entrypoint.priority, Priority::Group(0));
    let irq = by_name("irq_handler");
    assert_eq!(irq.local_depth, 8);
    assert_eq!(irq.total, 8 + 32); // HardFault on top

    let hardfault = by_name("HardFault");
    assert_eq!(hardfault.total, 0); // NMI is pruned, nothing preempts it

    assert_eq!(analysis.global_max(), Some(88));

    // per-function cumulative depths
    assert_eq!(analysis.function_totals[&0x100], Some(16)); // main
    assert_eq!(analysis.function_totals[&0x130], Some(8)); // helper
    assert_eq!(analysis.function_totals[&0x150], Some(0)); // DefaultHandler
}

#[test]
fn config_disables_the_interrupt() {
    let config = r#"{
        "stack_depth_analyzer_version": 1,
        "entrypoints": {
            "interrupts": [ { "number": 0, "config": false } ]
        }
    }"#;
    let analysis = analyze_bytes(&test_binary(), Some(config)).unwrap();

    let names: Vec<&str> = analysis
        .results
        .iter()
        .map(|result| result.entrypoint.name.as_str())
        .collect();
    assert_eq!(names, vec!["Reset", "HardFault"]);

    let reset = analysis.results[0].outcome.as_ref().unwrap();
    assert_eq!(reset.total, 16 + 32);
}

#[test]
fn config_prioritizes_the_interrupt() {
    let config = r#"{
        "stack_depth_analyzer_version": 1,
        "entrypoints": {
            "interrupts": [
                { "number": 0, "name": "TIM1", "config": { "priority_group": 2 } }
            ]
        }
    }"#;
    let analysis = analyze_bytes(&test_binary(), Some(config)).unwrap();

    let tim1 = analysis
        .results
        .iter()
        .find(|result| result.entrypoint.name == "TIM1")
        .unwrap();
    assert_eq!(tim1.entrypoint.priority, Priority::Group(2));
}

#[test]
fn unresolved_indirect_call_fails_reset() {
    // main: push {lr}; blx r3; pop {pc}
    let mut text = test_text();
    text[0x00..0x06].copy_from_slice(&asm(&[0xB500, 0x4798, 0xBD00]));
    let mut symbols = test_symbols();
    symbols[0].size = 6;

    let elf = build_elf(0x100, &text, &test_vectors(), &symbols);
    let analysis = analyze_bytes(&elf, None).unwrap();

    assert!(analysis.has_failures());
    let failure = analysis.results[0].outcome.as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::IndirectCallUnresolved);

    // the other entrypoints still have verdicts
    assert!(analysis.results[1].outcome.is_ok());
}

#[test]
fn hint_resolves_the_indirect_call() {
    let mut text = test_text();
    text[0x00..0x06].copy_from_slice(&asm(&[0xB500, 0x4798, 0xBD00]));
    let mut symbols = test_symbols();
    symbols[0].size = 6;

    let elf = build_elf(0x100, &text, &test_vectors(), &symbols);
    let config = r#"{
        "stack_depth_analyzer_version": 1,
        "dynamic_calls": [ { "site": "main+2", "targets": ["helper"] } ]
    }"#;
    let analysis = analyze_bytes(&elf, Some(config)).unwrap();

    assert!(!analysis.has_failures());
    let reset = analysis.results[0].outcome.as_ref().unwrap();
    // main holds 4 across the hinted call into helper (8)
    assert_eq!(reset.local_depth, 12);
}

#[test]
fn garbage_is_a_malformed_binary() {
    let error = analyze_bytes(&[0u8; 64], None).unwrap_err();
    assert!(matches!(error, PipelineError::Elf(_)));
    assert_eq!(error.exit_code(), 4);
}

#[test]
fn bad_config_is_a_usage_error() {
    let error = analyze_bytes(&test_binary(), Some(r#"{ "bogus": 1 }"#)).unwrap_err();
    assert!(matches!(error, PipelineError::Config(_)));
    assert_eq!(error.exit_code(), 2);
}

#[test]
fn reruns_are_deterministic() {
    let first = analyze_bytes(&test_binary(), None).unwrap();
    let second = analyze_bytes(&test_binary(), None).unwrap();

    let totals = |analysis: &stackmax::pipeline::Analysis| -> Vec<Option<u32>> {
        analysis
            .results
            .iter()
            .map(|result| result.outcome.as_ref().ok().map(|report| report.total))
            .collect()
    };
    assert_eq!(totals(&first), totals(&second));

    let chains = |analysis: &stackmax::pipeline::Analysis| -> Vec<Vec<String>> {
        analysis
            .results
            .iter()
            .filter_map(|result| result.outcome.as_ref().ok())
            .map(|report| report.chain.iter().map(|step| step.name.clone()).collect())
            .collect()
    };
    assert_eq!(chains(&first), chains(&second));
}
