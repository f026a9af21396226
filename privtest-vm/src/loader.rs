//! ELF test-image loading.

use std::collections::HashMap;

use crate::bus::SystemBus;
use crate::error::HarnessError;
use goblin::elf::{Elf, program_header::PT_LOAD};

/// A test image copied into DRAM.
#[derive(Debug, Clone, Default)]
pub struct LoadedImage {
    pub entry: u64,
    /// Named symbols: harness labels, `test_cases`, `test_1_res`, ...
    pub symbols: HashMap<String, u64>,
}

/// Copy the PT_LOAD segments of `buffer` into DRAM and collect its symbols.
pub fn load_elf(buffer: &[u8], bus: &mut SystemBus) -> Result<LoadedImage, HarnessError> {
    let elf = Elf::parse(buffer)?;
    let base = bus.dram.base;
    let dram_end = base + bus.dram.size() as u64;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_size = ph.p_filesz as usize;
        let mem_size = ph.p_memsz as usize;
        let file_offset = ph.p_offset as usize;

        let target_addr = if ph.p_paddr != 0 {
            ph.p_paddr
        } else {
            ph.p_vaddr
        };
        let out_of_range = HarnessError::SegmentOutOfRange {
            addr: target_addr,
            len: ph.p_memsz,
        };

        if file_offset
            .checked_add(file_size)
            .is_none_or(|end| end > buffer.len())
        {
            return Err(out_of_range);
        }
        let seg_end = target_addr.checked_add(mem_size as u64);
        if target_addr < base || seg_end.is_none_or(|end| end > dram_end) {
            return Err(out_of_range);
        }

        if file_size > 0 {
            bus.load_image(target_addr, &buffer[file_offset..file_offset + file_size])?;
        }
        if mem_size > file_size {
            bus.load_image(target_addr + file_size as u64, &vec![0; mem_size - file_size])?;
        }
        log::debug!(
            "segment: 0x{:08x} filesz=0x{:x} memsz=0x{:x}",
            target_addr,
            file_size,
            mem_size
        );
    }

    let symbols: HashMap<String, u64> = elf
        .syms
        .iter()
        .filter_map(|sym| {
            let name = elf.strtab.get_at(sym.st_name)?;
            (!name.is_empty()).then(|| (name.to_string(), sym.st_value))
        })
        .collect();

    log::info!(
        "ELF loaded: entry=0x{:x}, segments={}, symbols={}",
        elf.entry,
        elf.program_headers.len(),
        symbols.len()
    );

    Ok(LoadedImage {
        entry: elf.entry,
        symbols,
    })
}
