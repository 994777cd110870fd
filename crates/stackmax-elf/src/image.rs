//! Loaded ELF image: byte view by virtual address, function symbols,
//! code/data mapping, vector table.

use std::collections::BTreeMap;

use tracing::debug;

use crate::constants::{
    STT_FUNC, STT_NOTYPE, STT_OBJECT, VECTOR_TABLE_SECTION_NAMES,
};
use crate::file::{ElfFile, Section};
use crate::{ElfError, Result};

/// Symbol kind relevant to analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
}

/// Named symbol with its (Thumb-bit cleared) address.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub address: u32,
    pub size: u32,
    pub kind: SymbolKind,
}

/// Function symbol. Distinct symbols may alias one address; `names` holds
/// all of them, sorted.
#[derive(Clone, Debug)]
pub struct FuncSym {
    pub address: u32,
    pub size: u32,
    pub names: Vec<String>,
}

impl FuncSym {
    /// Address one past the last byte of the function.
    pub const fn end(&self) -> u32 {
        self.address + self.size
    }

    pub fn display_name(&self) -> String {
        self.names.join(" / ")
    }
}

/// A code or data region inside a function, derived from `$t`/`$d` mapping
/// symbols. Offsets are function-relative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
    pub is_code: bool,
}

/// The vector table: initial SP plus one handler word per exception slot.
/// `handlers[i]` corresponds to vector word `i + 1`; `None` marks an unused
/// (zero) entry.
#[derive(Clone, Debug)]
pub struct VectorTable {
    pub initial_sp: u32,
    pub handlers: Vec<Option<u32>>,
}

impl VectorTable {
    /// Handler address for a vector index (1 = reset), Thumb bit cleared.
    pub fn handler(&self, vector_index: usize) -> Option<u32> {
        debug_assert!(vector_index >= 1);
        self.handlers.get(vector_index - 1).copied().flatten()
    }
}

/// ELF image ready for analysis.
#[derive(Clone, Debug, Default)]
pub struct Image {
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    /// Function symbols, sorted by address, non-overlapping.
    pub functions: Vec<FuncSym>,
    /// `$t`/`$d` mapping symbols: address -> is-code.
    pub markers: BTreeMap<u32, bool>,
}

impl Image {
    /// Parse an ELF image from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the ELF file is invalid or its symbol table
    /// violates the Thumb function-symbol conventions.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let elf = ElfFile::parse(data)?;

        if !elf.sections.iter().any(|s| s.name == ".text") {
            return Err(ElfError::MissingTextSection);
        }

        let markers = Self::collect_markers(&elf)?;
        let (symbols, functions) = Self::collect_symbols(&elf)?;

        debug!(
            functions = functions.len(),
            markers = markers.len(),
            "loaded image"
        );

        Ok(Self {
            sections: elf.sections,
            symbols,
            functions,
            markers,
        })
    }

    /// Build an image from raw Thumb code at an address. No symbols or
    /// markers are attached; intended for tests and synthetic fixtures.
    pub fn from_code(address: u32, code: Vec<u8>) -> Self {
        let size = code.len() as u32;
        Self {
            sections: vec![Section {
                name: ".text".to_string(),
                addr: address,
                size,
                flags: crate::constants::SHF_ALLOC | crate::constants::SHF_EXECINSTR,
                data: code,
            }],
            symbols: Vec::new(),
            functions: Vec::new(),
            markers: BTreeMap::new(),
        }
    }

    /// Read `len` bytes at a virtual address, if a loaded section covers the
    /// whole range.
    pub fn read_bytes(&self, address: u32, len: u32) -> Option<&[u8]> {
        for section in &self.sections {
            let end = section.addr.checked_add(section.size)?;
            if address >= section.addr && address.checked_add(len)? <= end {
                let offset = (address - section.addr) as usize;
                let len = len as usize;
                if offset + len > section.data.len() {
                    return None;
                }
                return Some(&section.data[offset..offset + len]);
            }
        }
        None
    }

    pub fn read_u16(&self, address: u32) -> Option<u16> {
        let bytes = self.read_bytes(address, 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Look up the function whose entry is exactly `address`.
    pub fn function_at(&self, address: u32) -> Option<&FuncSym> {
        self.functions
            .binary_search_by_key(&address, |f| f.address)
            .ok()
            .map(|i| &self.functions[i])
    }

    /// Look up a function by any of its names.
    pub fn function_by_name(&self, name: &str) -> Option<&FuncSym> {
        self.functions
            .iter()
            .find(|f| f.names.iter().any(|n| n == name))
    }

    /// Locate and decode the vector table.
    ///
    /// # Errors
    ///
    /// Fails if no (or several) vector table sections exist, the word count
    /// is outside 16..=48, or a non-null handler lacks the Thumb bit.
    pub fn vector_table(&self) -> Result<VectorTable> {
        let mut candidates = self
            .sections
            .iter()
            .filter(|s| VECTOR_TABLE_SECTION_NAMES.contains(&s.name.as_str()));

        let section = candidates
            .next()
            .ok_or_else(|| ElfError::MissingVectorTable(VECTOR_TABLE_SECTION_NAMES.join(", ")))?;
        if candidates.next().is_some() {
            return Err(ElfError::AmbiguousVectorTable);
        }

        let data = &section.data;
        let word_count = data.len() / 4;
        if data.len() % 4 != 0 || !(16..=48).contains(&word_count) {
            return Err(ElfError::BadVectorTableSize(data.len()));
        }

        let word = |i: usize| {
            u32::from_le_bytes([data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]])
        };

        let initial_sp = word(0);
        let mut handlers = Vec::with_capacity(word_count - 1);
        for index in 1..word_count {
            let raw = word(index);
            if raw == 0 {
                handlers.push(None);
            } else {
                if raw & 1 != 1 {
                    return Err(ElfError::VectorMissingThumbBit {
                        index,
                        address: raw,
                    });
                }
                handlers.push(Some(raw & !1));
            }
        }

        Ok(VectorTable {
            initial_sp,
            handlers,
        })
    }

    /// Split a function into code/data regions using the mapping symbols it
    /// covers. A function without markers is all code (GCC omits markers for
    /// simple functions).
    ///
    /// # Errors
    ///
    /// Fails if the function's first region is not code at offset 0.
    pub fn function_regions(&self, func: &FuncSym) -> Result<Vec<Region>> {
        let in_range = self
            .markers
            .range(func.address..func.end())
            .map(|(&addr, &is_code)| (addr - func.address, is_code))
            .collect::<Vec<_>>();

        let boundaries = if in_range.is_empty() {
            vec![(0, true)]
        } else {
            if in_range[0] != (0, true) {
                return Err(ElfError::FunctionStartsWithData {
                    name: func.display_name(),
                    address: func.address,
                });
            }
            in_range
        };

        let mut regions = Vec::with_capacity(boundaries.len());
        for (i, &(offset, is_code)) in boundaries.iter().enumerate() {
            let next_offset = boundaries
                .get(i + 1)
                .map_or(func.size, |&(offset, _)| offset);
            // zero-length regions can appear when markers repeat at a boundary
            if next_offset > offset {
                regions.push(Region {
                    offset,
                    size: next_offset - offset,
                    is_code,
                });
            }
        }

        Ok(regions)
    }

    fn collect_markers(elf: &ElfFile) -> Result<BTreeMap<u32, bool>> {
        let mut markers = BTreeMap::new();

        for symbol in &elf.symbols {
            let is_code = match symbol.name.as_str() {
                "$t" => true,
                "$d" => false,
                _ => continue,
            };

            if symbol.sym_type != STT_NOTYPE {
                continue;
            }
            if symbol.value % 2 != 0 {
                return Err(ElfError::UnalignedMarker(symbol.value));
            }
            if let Some(&previous) = markers.get(&symbol.value) {
                if previous != is_code {
                    return Err(ElfError::DuplicateMarker(symbol.value));
                }
                continue;
            }
            markers.insert(symbol.value, is_code);
        }

        Ok(markers)
    }

    fn collect_symbols(elf: &ElfFile) -> Result<(Vec<Symbol>, Vec<FuncSym>)> {
        let mut symbols = Vec::new();
        // address -> (size, names)
        let mut functions_by_address: BTreeMap<u32, (u32, Vec<String>)> = BTreeMap::new();

        for symbol in &elf.symbols {
            match symbol.sym_type {
                STT_OBJECT => {
                    symbols.push(Symbol {
                        name: symbol.name.clone(),
                        address: symbol.value,
                        size: symbol.size,
                        kind: SymbolKind::Object,
                    });
                }
                STT_FUNC => {
                    // Thumb state is encoded in the low address bit; it must
                    // be set on every function symbol and cleared for use.
                    if symbol.value & 1 != 1 {
                        return Err(ElfError::MissingThumbBit {
                            name: symbol.name.clone(),
                            address: symbol.value,
                        });
                    }
                    let address = symbol.value & !1;

                    // zero-sized functions (e.g. an empty __pre_init) hold no
                    // code and cannot affect the stack
                    if symbol.size == 0 {
                        continue;
                    }

                    symbols.push(Symbol {
                        name: symbol.name.clone(),
                        address,
                        size: symbol.size,
                        kind: SymbolKind::Function,
                    });

                    match functions_by_address.get_mut(&address) {
                        Some((size, names)) => {
                            if *size != symbol.size {
                                return Err(ElfError::SymbolSizeMismatch(address));
                            }
                            if !names.contains(&symbol.name) {
                                names.push(symbol.name.clone());
                            }
                        }
                        None => {
                            functions_by_address
                                .insert(address, (symbol.size, vec![symbol.name.clone()]));
                        }
                    }
                }
                _ => {}
            }
        }

        let mut functions = Vec::with_capacity(functions_by_address.len());
        for (address, (size, mut names)) in functions_by_address {
            names.sort();
            functions.push(FuncSym {
                address,
                size,
                names,
            });
        }

        for pair in functions.windows(2) {
            if pair[0].end() > pair[1].address {
                return Err(ElfError::OverlappingFunctions(
                    pair[0].address,
                    pair[0].size,
                    pair[1].address,
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for func in &functions {
            for name in &func.names {
                if !seen.insert(name.clone()) {
                    return Err(ElfError::DuplicateFunctionName(name.clone()));
                }
            }
        }

        Ok((symbols, functions))
    }
}
