//! # Symbol Reader
//!
//! Extracts named function symbols from a 64-bit little-endian ELF image by walking its
//! section header table. Both the full (`.symtab`) and the dynamic (`.dynsym`) symbol tables
//! are read and concatenated, in section order. Only symbols with a name, the function type and
//! a non-zero value are kept.
//!
//! Reading never fails from the caller's point of view: [`read_symbols`] turns any structural
//! problem into an empty list, which the tracer treats as "nothing to intercept".

use std::collections::HashMap;
use std::path::Path;

use object::elf;
use object::read::elf::{FileHeader, SectionHeader, SectionTable, Sym, SymbolTable};
use object::{LittleEndian, SectionIndex};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::errors::{Result, TracerError};

type Elf64 = elf::FileHeader64<LittleEndian>;

/// A function symbol with its link-time address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub vaddr: u64,
}

/// What the tracer needs to know about an executable image
#[derive(Debug, Clone, Default)]
pub struct ElfImage {
    /// `ET_DYN` images are relocated by a load bias at runtime
    pub position_independent: bool,
    pub symbols: Vec<Symbol>,
}

impl ElfImage {
    /// Reads and parses the image at `path`
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a 64-bit little-endian ELF image with
    /// readable section headers.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(&data)
    }

    /// Parses an in-memory image
    ///
    /// # Errors
    ///
    /// See [`ElfImage::read`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_ident(data)?;
        let header = Elf64::parse(data)?;
        let endian = header.endian()?;
        let sections = header.sections(endian, data)?;

        let mut symbols = Vec::new();
        for (index, section) in sections.iter().enumerate() {
            let sh_type = section.sh_type(endian);
            if sh_type != elf::SHT_SYMTAB && sh_type != elf::SHT_DYNSYM {
                continue;
            }
            let name = sections
                .section_name(endian, section)
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            trace!("reading symbol table section {index} ({name})");
            match read_function_symbols(endian, data, &sections, index, section) {
                Ok(mut found) => symbols.append(&mut found),
                Err(e) => warn!("skipping unreadable symbol table in section {index}: {e}"),
            }
        }

        Ok(Self {
            position_independent: header.e_type(endian) == elf::ET_DYN,
            symbols,
        })
    }
}

/// Maps names to addresses; for duplicate names the last symbol in table order wins
pub fn address_index(symbols: &[Symbol]) -> HashMap<&str, u64> {
    symbols.iter().map(|s| (s.name.as_str(), s.vaddr)).collect()
}

/// Reads the function symbols of the image at `path`, or nothing if that is not possible
pub fn read_symbols(path: impl AsRef<Path>) -> Vec<Symbol> {
    let path = path.as_ref();
    match ElfImage::read(path) {
        Ok(image) => image.symbols,
        Err(e) => {
            debug!("no symbols available for {}: {e}", path.display());
            Vec::new()
        }
    }
}

fn check_ident(data: &[u8]) -> Result<()> {
    let Ok((header, _)) = object::pod::from_bytes::<Elf64>(data) else {
        return Err(TracerError::UnsupportedBinary("not an ELF image"));
    };
    let ident = header.e_ident();
    if ident.magic != elf::ELFMAG {
        return Err(TracerError::UnsupportedBinary("not an ELF image"));
    }
    if ident.class != elf::ELFCLASS64 {
        return Err(TracerError::UnsupportedBinary("not a 64-bit image"));
    }
    if ident.data != elf::ELFDATA2LSB {
        return Err(TracerError::UnsupportedBinary("not a little-endian image"));
    }
    Ok(())
}

fn read_function_symbols(
    endian: LittleEndian,
    data: &[u8],
    sections: &SectionTable<'_, Elf64>,
    index: usize,
    section: &elf::SectionHeader64<LittleEndian>,
) -> Result<Vec<Symbol>> {
    let table: SymbolTable<'_, Elf64> =
        SymbolTable::parse(endian, data, sections, SectionIndex(index), section)?;
    let mut out = Vec::new();
    for sym in table.symbols() {
        if sym.st_name(endian) == 0 || sym.st_type() != elf::STT_FUNC {
            continue;
        }
        let vaddr: u64 = sym.st_value(endian);
        if vaddr == 0 {
            continue;
        }
        let name = table.symbol_name(endian, sym)?;
        if name.is_empty() {
            continue;
        }
        out.push(Symbol {
            name: String::from_utf8_lossy(name).into_owned(),
            vaddr,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_header(class: u8, data: u8) -> Vec<u8> {
        // e_ident is magic, class, data, version
        let mut h = vec![0u8; 64];
        h[..4].copy_from_slice(&elf::ELFMAG);
        h[4] = class;
        h[5] = data;
        h[6] = elf::EV_CURRENT;
        h[16..18].copy_from_slice(&elf::ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&elf::EM_X86_64.to_le_bytes());
        h[20..24].copy_from_slice(&1u32.to_le_bytes());
        h[52..54].copy_from_slice(&64u16.to_le_bytes());
        h
    }

    #[test]
    fn test_rejects_wrong_class_and_endianness() {
        assert!(matches!(
            ElfImage::parse(&minimal_header(elf::ELFCLASS32, elf::ELFDATA2LSB)),
            Err(TracerError::UnsupportedBinary(_))
        ));
        assert!(matches!(
            ElfImage::parse(&minimal_header(elf::ELFCLASS64, elf::ELFDATA2MSB)),
            Err(TracerError::UnsupportedBinary(_))
        ));
        assert!(ElfImage::parse(b"#!/bin/sh\n").is_err());
    }

    #[test]
    fn test_image_without_sections_has_no_symbols() {
        let header = minimal_header(elf::ELFCLASS64, elf::ELFDATA2LSB);
        let symbols = ElfImage::parse(&header)
            .map(|i| i.symbols)
            .unwrap_or_default();
        assert!(symbols.is_empty());
    }

    #[test]
    fn test_truncated_image_has_no_symbols() {
        let me = std::fs::read(std::env::current_exe().unwrap()).unwrap();
        let symbols = ElfImage::parse(&me[..100])
            .map(|i| i.symbols)
            .unwrap_or_default();
        assert!(symbols.is_empty());
    }

    #[test]
    fn test_read_symbols_of_own_executable() {
        let symbols = read_symbols(std::env::current_exe().unwrap());
        assert!(!symbols.is_empty());
        assert!(symbols.iter().all(|s| s.vaddr != 0 && !s.name.is_empty()));
        assert!(symbols.iter().any(|s| s.name == "main"));
    }

    #[test]
    fn test_missing_file_has_no_symbols() {
        assert!(read_symbols("/nonexistent/fnroute/binary").is_empty());
    }

    #[test]
    fn test_address_index_last_wins() {
        let symbols = vec![
            Symbol {
                name: "dup".into(),
                vaddr: 0x10,
            },
            Symbol {
                name: "dup".into(),
                vaddr: 0x20,
            },
        ];
        assert_eq!(address_index(&symbols)["dup"], 0x20);
    }
}
