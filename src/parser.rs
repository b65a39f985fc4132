//! COFF object parsing.
//!
//! Reads the file header, section table, symbol table and relocation
//! tables out of an untrusted byte buffer into owned structures. Every
//! offset and count coming from the file is checked against the buffer
//! before it is dereferenced; adversarial field values must never cause an
//! out-of-bounds read.

use crate::error::{BofError, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::debug;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

pub const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;

/// Section number for undefined (externally resolved) symbols.
pub const IMAGE_SYM_UNDEFINED: i16 = 0;

const FILE_HEADER_SIZE: u64 = 20;
const SECTION_HEADER_SIZE: u64 = 40;
const SYMBOL_SIZE: u64 = 18;
const RELOCATION_SIZE: u64 = 10;

/// Target architecture of a COFF object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    X86,
    X64,
}

/// The COFF file header, minus fields the loader never consults.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
}

/// A parsed section header together with its relocation records.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
    pub relocations: Vec<Relocation>,
}

impl Section {
    /// Size the loader must allocate: raw size when the section carries
    /// data, virtual size for uninitialized sections.
    pub fn allocation_size(&self) -> usize {
        if self.size_of_raw_data != 0 {
            self.size_of_raw_data as usize
        } else {
            self.virtual_size as usize
        }
    }

    pub fn has_raw_data(&self) -> bool {
        self.size_of_raw_data != 0 && self.pointer_to_raw_data != 0
    }
}

/// A symbol table record. Auxiliary records are retained as placeholders
/// so relocation symbol indices keep their raw-table meaning.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u32,
    pub section_number: i16,
    pub type_: u16,
    pub storage_class: u8,
    /// True for auxiliary records trailing another symbol.
    pub aux: bool,
}

impl Symbol {
    /// External symbols are resolved outside the object (Beacon API or a
    /// host library export).
    pub fn is_external(&self) -> bool {
        !self.aux
            && self.storage_class == IMAGE_SYM_CLASS_EXTERNAL
            && self.section_number == IMAGE_SYM_UNDEFINED
    }

    /// The complex-type field's upper byte marks function symbols.
    pub fn is_function(&self) -> bool {
        !self.aux && (self.type_ >> 4) & 0xf == 2
    }
}

/// One relocation record from a section's relocation table.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub virtual_address: u32,
    pub symbol_table_index: u32,
    pub type_: u16,
}

/// A parsed COFF object. Borrows the input buffer for section raw data;
/// immutable after parse.
#[derive(Debug)]
pub struct CoffObject<'a> {
    pub buffer: &'a [u8],
    pub machine: Machine,
    pub header: FileHeader,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
}

fn malformed(what: &str) -> BofError {
    BofError::MalformedObject(what.to_string())
}

/// Bounds-checked slice of the input. `off`/`len` are u64 so adversarial
/// u32 fields cannot overflow the arithmetic on 32-bit hosts.
fn slice<'a>(buf: &'a [u8], off: u64, len: u64, what: &str) -> Result<&'a [u8]> {
    let end = off
        .checked_add(len)
        .ok_or_else(|| malformed(&format!("{what} offset overflow")))?;
    if end > buf.len() as u64 {
        return Err(BofError::MalformedObject(format!(
            "{what} extends past end of buffer ({end} > {})",
            buf.len()
        )));
    }
    Ok(&buf[off as usize..end as usize])
}

impl<'a> CoffObject<'a> {
    /// Parses a COFF object out of `buffer`, validating all structural
    /// bounds. Fails with [`BofError::MalformedObject`] on truncation,
    /// out-of-range tables, invalid relocation symbol indices or an
    /// unsupported machine type.
    pub fn parse(buffer: &'a [u8]) -> Result<CoffObject<'a>> {
        let hdr = slice(buffer, 0, FILE_HEADER_SIZE, "file header")?;
        let header = FileHeader {
            machine: LittleEndian::read_u16(&hdr[0..2]),
            number_of_sections: LittleEndian::read_u16(&hdr[2..4]),
            pointer_to_symbol_table: LittleEndian::read_u32(&hdr[8..12]),
            number_of_symbols: LittleEndian::read_u32(&hdr[12..16]),
            size_of_optional_header: LittleEndian::read_u16(&hdr[16..18]),
        };

        let machine = match header.machine {
            IMAGE_FILE_MACHINE_I386 => Machine::X86,
            IMAGE_FILE_MACHINE_AMD64 => Machine::X64,
            other => {
                return Err(BofError::MalformedObject(format!(
                    "unsupported machine type 0x{other:x}"
                )))
            }
        };

        let string_table = Self::string_table(buffer, &header);
        let symbols = Self::parse_symbols(buffer, &header, string_table)?;
        let sections = Self::parse_sections(buffer, &header, string_table, symbols.len())?;

        debug!(
            "parsed COFF object: {:?}, {} sections, {} symbol records",
            machine,
            sections.len(),
            symbols.len()
        );

        Ok(CoffObject {
            buffer,
            machine,
            header,
            sections,
            symbols,
        })
    }

    /// The string table trails the symbol table; its first 4 bytes are its
    /// own size. Absent or out-of-range tables yield an empty region, so
    /// long-name lookups simply fail their bounds check.
    fn string_table(buffer: &'a [u8], header: &FileHeader) -> &'a [u8] {
        if header.pointer_to_symbol_table == 0 {
            return &[];
        }
        let start = header.pointer_to_symbol_table as u64
            + header.number_of_symbols as u64 * SYMBOL_SIZE;
        match slice(buffer, start, 4, "string table size") {
            Ok(sz) => {
                let declared = LittleEndian::read_u32(sz) as u64;
                slice(buffer, start, declared.max(4), "string table").unwrap_or(&[])
            }
            Err(_) => &[],
        }
    }

    /// Reads a NUL-terminated name at `offset` inside the string table.
    fn string_table_name(string_table: &[u8], offset: usize, what: &str) -> Result<String> {
        // offsets 0..4 point into the size field
        if offset < 4 || offset >= string_table.len() {
            return Err(BofError::MalformedObject(format!(
                "{what} string table offset {offset} out of range"
            )));
        }
        let tail = &string_table[offset..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    fn parse_symbols(
        buffer: &'a [u8],
        header: &FileHeader,
        string_table: &[u8],
    ) -> Result<Vec<Symbol>> {
        if header.pointer_to_symbol_table == 0 || header.number_of_symbols == 0 {
            return Ok(Vec::new());
        }

        // One up-front check covers the whole table, so a symbol count
        // larger than the buffer can never walk past the end.
        let table = slice(
            buffer,
            header.pointer_to_symbol_table as u64,
            header.number_of_symbols as u64 * SYMBOL_SIZE,
            "symbol table",
        )?;

        let mut symbols = Vec::with_capacity(header.number_of_symbols as usize);
        let mut aux_remaining = 0u8;
        for record in table.chunks_exact(SYMBOL_SIZE as usize) {
            if aux_remaining > 0 {
                aux_remaining -= 1;
                symbols.push(Symbol {
                    name: String::new(),
                    value: 0,
                    section_number: 0,
                    type_: 0,
                    storage_class: 0,
                    aux: true,
                });
                continue;
            }

            let name = if record[0..4] == [0, 0, 0, 0] {
                let offset = LittleEndian::read_u32(&record[4..8]) as usize;
                Self::string_table_name(string_table, offset, "symbol name")?
            } else {
                let end = record[0..8].iter().position(|&b| b == 0).unwrap_or(8);
                String::from_utf8_lossy(&record[0..end]).into_owned()
            };

            aux_remaining = record[17];
            symbols.push(Symbol {
                name,
                value: LittleEndian::read_u32(&record[8..12]),
                section_number: LittleEndian::read_i16(&record[12..14]),
                type_: LittleEndian::read_u16(&record[14..16]),
                storage_class: record[16],
                aux: false,
            });
        }

        Ok(symbols)
    }

    fn parse_sections(
        buffer: &'a [u8],
        header: &FileHeader,
        string_table: &[u8],
        symbol_count: usize,
    ) -> Result<Vec<Section>> {
        let table_offset = FILE_HEADER_SIZE + header.size_of_optional_header as u64;
        let mut sections = Vec::with_capacity(header.number_of_sections as usize);

        for i in 0..header.number_of_sections as u64 {
            let raw = slice(
                buffer,
                table_offset + i * SECTION_HEADER_SIZE,
                SECTION_HEADER_SIZE,
                "section header",
            )?;

            let name = Self::section_name(&raw[0..8], string_table)?;
            let size_of_raw_data = LittleEndian::read_u32(&raw[16..20]);
            let pointer_to_raw_data = LittleEndian::read_u32(&raw[20..24]);
            let pointer_to_relocations = LittleEndian::read_u32(&raw[24..28]);
            let number_of_relocations = LittleEndian::read_u16(&raw[32..34]);
            let characteristics = LittleEndian::read_u32(&raw[36..40]);

            // Raw data must live inside the buffer before the loader
            // copies from it.
            if size_of_raw_data != 0 && pointer_to_raw_data != 0 {
                slice(
                    buffer,
                    pointer_to_raw_data as u64,
                    size_of_raw_data as u64,
                    "section raw data",
                )?;
            }

            let relocations = Self::parse_relocations(
                buffer,
                pointer_to_relocations,
                number_of_relocations,
                symbol_count,
            )?;

            sections.push(Section {
                name,
                virtual_size: LittleEndian::read_u32(&raw[8..12]),
                size_of_raw_data,
                pointer_to_raw_data,
                characteristics,
                relocations,
            });
        }

        Ok(sections)
    }

    /// Section names longer than 8 bytes are stored as `/nnn`, a decimal
    /// offset into the string table.
    fn section_name(raw: &[u8], string_table: &[u8]) -> Result<String> {
        if raw[0] == b'/' {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(8);
            let digits = std::str::from_utf8(&raw[1..end])
                .map_err(|_| malformed("non-ascii long section name reference"))?;
            let offset: usize = digits
                .parse()
                .map_err(|_| malformed("invalid long section name reference"))?;
            return Self::string_table_name(string_table, offset, "section name");
        }
        let end = raw.iter().position(|&b| b == 0).unwrap_or(8);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn parse_relocations(
        buffer: &'a [u8],
        pointer: u32,
        count: u16,
        symbol_count: usize,
    ) -> Result<Vec<Relocation>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let table = slice(
            buffer,
            pointer as u64,
            count as u64 * RELOCATION_SIZE,
            "relocation table",
        )?;

        let mut relocations = Vec::with_capacity(count as usize);
        for record in table.chunks_exact(RELOCATION_SIZE as usize) {
            let relocation = Relocation {
                virtual_address: LittleEndian::read_u32(&record[0..4]),
                symbol_table_index: LittleEndian::read_u32(&record[4..8]),
                type_: LittleEndian::read_u16(&record[8..10]),
            };
            // Validated here so the loader can index the symbol table
            // without re-checking.
            if relocation.symbol_table_index as usize >= symbol_count {
                return Err(BofError::MalformedObject(format!(
                    "relocation references symbol {} of {}",
                    relocation.symbol_table_index, symbol_count
                )));
            }
            relocations.push(relocation);
        }

        Ok(relocations)
    }

    /// The raw bytes backing `section`, if it carries initialized data.
    /// Bounds were validated at parse time.
    pub fn section_data(&self, section: &Section) -> Option<&'a [u8]> {
        if !section.has_raw_data() {
            return None;
        }
        let start = section.pointer_to_raw_data as usize;
        Some(&self.buffer[start..start + section.size_of_raw_data as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    /// Builds synthetic COFF images for parser tests.
    struct CoffBuilder {
        machine: u16,
        sections: Vec<(Vec<u8>, Vec<u8>, u32, Vec<(u32, u32, u16)>)>,
        symbols: Vec<(Vec<u8>, u32, i16, u16, u8, u8)>,
        string_table: Vec<u8>,
    }

    impl CoffBuilder {
        fn new() -> Self {
            Self {
                machine: IMAGE_FILE_MACHINE_AMD64,
                sections: Vec::new(),
                symbols: Vec::new(),
                string_table: Vec::new(),
            }
        }

        fn section(
            mut self,
            name: &[u8],
            data: &[u8],
            characteristics: u32,
            relocs: &[(u32, u32, u16)],
        ) -> Self {
            let mut n = name.to_vec();
            n.resize(8, 0);
            self.sections
                .push((n, data.to_vec(), characteristics, relocs.to_vec()));
            self
        }

        fn symbol(mut self, name: &[u8], value: u32, section: i16, type_: u16, class: u8) -> Self {
            let mut n = name.to_vec();
            n.resize(8, 0);
            self.symbols.push((n, value, section, type_, class, 0));
            self
        }

        /// Adds a symbol whose name lives in the string table; returns the
        /// builder with the long name registered.
        fn long_symbol(mut self, name: &str, value: u32, section: i16, class: u8) -> Self {
            let offset = 4 + self.string_table.len() as u32;
            self.string_table.extend_from_slice(name.as_bytes());
            self.string_table.push(0);
            let mut n = vec![0u8; 8];
            LittleEndian::write_u32(&mut n[4..8], offset);
            self.symbols.push((n, value, section, 0, class, 0));
            self
        }

        fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            let nsections = self.sections.len() as u16;
            let section_table = 20u32;
            let mut data_offset =
                section_table + nsections as u32 * 40;

            // layout: headers, raw data + relocs per section, symbols, strings
            let mut section_offsets = Vec::new();
            for (_, data, _, relocs) in &self.sections {
                let raw = data_offset;
                data_offset += data.len() as u32;
                let reloc = data_offset;
                data_offset += relocs.len() as u32 * 10;
                section_offsets.push((raw, reloc));
            }
            let symtab = data_offset;

            out.write_u16::<LittleEndian>(self.machine).unwrap();
            out.write_u16::<LittleEndian>(nsections).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap(); // timestamp
            out.write_u32::<LittleEndian>(symtab).unwrap();
            out.write_u32::<LittleEndian>(self.symbols.len() as u32).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap(); // optional header
            out.write_u16::<LittleEndian>(0).unwrap(); // characteristics

            for ((name, data, chars, relocs), (raw, reloc)) in
                self.sections.iter().zip(&section_offsets)
            {
                out.write_all(name).unwrap();
                out.write_u32::<LittleEndian>(data.len() as u32).unwrap(); // virtual size
                out.write_u32::<LittleEndian>(0).unwrap(); // virtual address
                out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
                out.write_u32::<LittleEndian>(if data.is_empty() { 0 } else { *raw })
                    .unwrap();
                out.write_u32::<LittleEndian>(if relocs.is_empty() { 0 } else { *reloc })
                    .unwrap();
                out.write_u32::<LittleEndian>(0).unwrap(); // line numbers
                out.write_u16::<LittleEndian>(relocs.len() as u16).unwrap();
                out.write_u16::<LittleEndian>(0).unwrap();
                out.write_u32::<LittleEndian>(*chars).unwrap();
            }

            for (_, data, _, relocs) in &self.sections {
                out.write_all(data).unwrap();
                for (va, sym, ty) in relocs {
                    out.write_u32::<LittleEndian>(*va).unwrap();
                    out.write_u32::<LittleEndian>(*sym).unwrap();
                    out.write_u16::<LittleEndian>(*ty).unwrap();
                }
            }

            for (name, value, section, type_, class, aux) in &self.symbols {
                out.write_all(name).unwrap();
                out.write_u32::<LittleEndian>(*value).unwrap();
                out.write_i16::<LittleEndian>(*section).unwrap();
                out.write_u16::<LittleEndian>(*type_).unwrap();
                out.push(*class);
                out.push(*aux);
            }

            out.write_u32::<LittleEndian>(4 + self.string_table.len() as u32)
                .unwrap();
            out.write_all(&self.string_table).unwrap();
            out
        }
    }

    const TEXT: u32 = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
    const DATA: u32 = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;

    #[test]
    fn parses_minimal_object() {
        let image = CoffBuilder::new()
            .section(b".text", &[0x90, 0xc3], TEXT, &[(0, 1, 0x04)])
            .section(b".data", &[1, 2, 3, 4], DATA, &[])
            .symbol(b"go", 0, 1, 0x20, IMAGE_SYM_CLASS_EXTERNAL)
            .symbol(b"__imp_X$Y", 0, 0, 0, IMAGE_SYM_CLASS_EXTERNAL)
            .build();

        let coff = CoffObject::parse(&image).unwrap();
        assert_eq!(coff.machine, Machine::X64);
        assert_eq!(coff.sections.len(), 2);
        assert_eq!(coff.sections[0].name, ".text");
        assert_eq!(coff.sections[0].relocations.len(), 1);
        assert_eq!(coff.symbols.len(), 2);
        assert_eq!(coff.symbols[0].name, "go");
        assert!(coff.symbols[0].is_function());
        assert!(!coff.symbols[0].is_external());
        assert!(coff.symbols[1].is_external());
        assert_eq!(coff.section_data(&coff.sections[1]).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn resolves_long_symbol_names() {
        let image = CoffBuilder::new()
            .section(b".text", &[0xc3], TEXT, &[])
            .long_symbol("KERNEL32$GetCurrentProcessId", 0, 0, IMAGE_SYM_CLASS_EXTERNAL)
            .build();

        let coff = CoffObject::parse(&image).unwrap();
        assert_eq!(coff.symbols[0].name, "KERNEL32$GetCurrentProcessId");
    }

    #[test]
    fn truncated_header_is_malformed() {
        for len in 0..20 {
            let err = CoffObject::parse(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, BofError::MalformedObject(_)), "len {len}");
        }
    }

    #[test]
    fn unsupported_machine_is_malformed() {
        let mut image = CoffBuilder::new()
            .section(b".text", &[0xc3], TEXT, &[])
            .build();
        image[0] = 0xaa;
        image[1] = 0xaa;
        let err = CoffObject::parse(&image).unwrap_err();
        assert!(matches!(err, BofError::MalformedObject(_)));
    }

    #[test]
    fn oversized_symbol_count_never_reads_past_end() {
        let mut image = CoffBuilder::new()
            .section(b".text", &[0xc3], TEXT, &[])
            .symbol(b"go", 0, 1, 0x20, IMAGE_SYM_CLASS_EXTERNAL)
            .build();
        // claim far more symbols than the buffer holds
        LittleEndian::write_u32(&mut image[12..16], 0x00ff_ffff);
        let err = CoffObject::parse(&image).unwrap_err();
        assert!(matches!(err, BofError::MalformedObject(_)));
    }

    #[test]
    fn symbol_table_offset_overflow_is_malformed() {
        let mut image = CoffBuilder::new()
            .section(b".text", &[0xc3], TEXT, &[])
            .symbol(b"go", 0, 1, 0x20, IMAGE_SYM_CLASS_EXTERNAL)
            .build();
        LittleEndian::write_u32(&mut image[8..12], u32::MAX);
        let err = CoffObject::parse(&image).unwrap_err();
        assert!(matches!(err, BofError::MalformedObject(_)));
    }

    #[test]
    fn section_raw_data_outside_buffer_is_malformed() {
        let mut image = CoffBuilder::new()
            .section(b".text", &[0xc3, 0x90], TEXT, &[])
            .build();
        // point the first section's raw data past the end
        let raw_ptr_field = 20 + 20;
        LittleEndian::write_u32(
            &mut image[raw_ptr_field..raw_ptr_field + 4],
            0xffff_0000,
        );
        let err = CoffObject::parse(&image).unwrap_err();
        assert!(matches!(err, BofError::MalformedObject(_)));
    }

    #[test]
    fn relocation_with_invalid_symbol_index_is_malformed() {
        let image = CoffBuilder::new()
            .section(b".text", &[0x90; 8], TEXT, &[(0, 42, 0x04)])
            .symbol(b"go", 0, 1, 0x20, IMAGE_SYM_CLASS_EXTERNAL)
            .build();
        let err = CoffObject::parse(&image).unwrap_err();
        assert!(matches!(err, BofError::MalformedObject(_)));
    }

    #[test]
    fn aux_records_keep_symbol_indices_aligned() {
        let mut builder = CoffBuilder::new().section(b".text", &[0x90; 4], TEXT, &[]);
        // a static section symbol with one aux record, then "go"
        builder.symbols.push((
            {
                let mut n = b".text".to_vec();
                n.resize(8, 0);
                n
            },
            0,
            1,
            0,
            3, // IMAGE_SYM_CLASS_STATIC
            1, // one aux record follows
        ));
        builder.symbols.push((vec![0xff; 8], 0, 0, 0, 0, 0)); // aux payload
        let builder = builder.symbol(b"go", 2, 1, 0x20, IMAGE_SYM_CLASS_EXTERNAL);

        let image = builder.build();
        let coff = CoffObject::parse(&image).unwrap();
        assert_eq!(coff.symbols.len(), 3);
        assert!(coff.symbols[1].aux);
        assert_eq!(coff.symbols[2].name, "go");
        assert!(coff.symbols[2].is_function());
    }

    #[test]
    fn x86_machine_parses() {
        let mut builder = CoffBuilder::new().section(b".text", &[0xc3], TEXT, &[]);
        builder.machine = IMAGE_FILE_MACHINE_I386;
        let image = builder.build();
        let coff = CoffObject::parse(&image).unwrap();
        assert_eq!(coff.machine, Machine::X86);
    }

    #[test]
    fn empty_section_has_no_raw_data() {
        let image = CoffBuilder::new()
            .section(b".bss", &[], IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE, &[])
            .build();
        let coff = CoffObject::parse(&image).unwrap();
        assert!(!coff.sections[0].has_raw_data());
        assert!(coff.section_data(&coff.sections[0]).is_none());
    }
}
