//! COFF loading and execution (Windows).
//!
//! Allocates memory for each section, resolves external symbols against
//! the Beacon API table and host libraries, applies relocations and
//! transfers control to the requested entry function, capturing whatever
//! the BOF writes through the Beacon output callbacks.
//!
//! All raw-pointer work is confined to this module and `beacon`; the
//! parsing and relocation arithmetic it builds on are safe code.

#![cfg(target_os = "windows")]

use std::collections::HashMap;
use std::ffi::CString;
use std::ptr::{self, null_mut};

use log::{debug, info, warn};
use winapi::ctypes::c_void;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::libloaderapi::{GetModuleHandleA, GetProcAddress, LoadLibraryA};
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_TOP_DOWN, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    PAGE_WRITECOPY,
};

use crate::beacon::BeaconApi;
use crate::error::{BofError, Result};
use crate::output;
use crate::parser::{
    CoffObject, Machine, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};
use crate::reloc;

/// Entry signature of a BOF: `void go(char* args, int len)`.
type BofMain = unsafe extern "C" fn(*mut u8, usize);

/// Distinct external symbols one object may import.
const MAX_IMPORTS: usize = 512;

/// Loads a COFF object and executes exported functions from it.
///
/// One instance handles one invocation: sections, resolved addresses and
/// the import slot page live only for the duration of [`run`](Self::run)
/// and are released on every exit path.
pub struct CoffLoader<'a> {
    coff: CoffObject<'a>,
    api: BeaconApi,
}

impl<'a> CoffLoader<'a> {
    /// Parses `data` and verifies it matches the host architecture.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let coff = CoffObject::parse(data)?;
        match coff.machine {
            Machine::X64 if cfg!(target_pointer_width = "32") => {
                return Err(BofError::MalformedObject(
                    "x64 object on an x86 host".to_string(),
                ))
            }
            Machine::X86 if cfg!(target_pointer_width = "64") => {
                return Err(BofError::MalformedObject(
                    "x86 object on an x64 host".to_string(),
                ))
            }
            _ => {}
        }
        Ok(Self {
            coff,
            api: BeaconApi::new(),
        })
    }

    /// Executes `entry` with the packed argument buffer, returning the
    /// decoded output the BOF produced.
    pub fn run(&self, entry: &str, args: &[u8]) -> Result<String> {
        info!("preparing COFF execution: entry = {entry}, args = {} bytes", args.len());

        let sections = SectionSet::allocate(&self.coff)?;
        let mut slots = ImportSlots::allocate()?;
        let resolved = self.resolve_externals()?;

        self.apply_relocations(&sections, &mut slots, &resolved)?;
        sections.protect()?;

        let entrypoint = self.find_entry(entry, &sections)?;

        output::reset();
        debug!("transferring control to {entry}");
        // SAFETY: entrypoint addresses a relocated function inside memory
        // this invocation owns; args outlives the call. Faults inside the
        // BOF itself are out of recovery scope.
        unsafe {
            let main: BofMain = std::mem::transmute(entrypoint);
            main(args.as_ptr() as *mut u8, args.len());
        }

        let captured = output::take();
        if captured.is_empty() {
            warn!("BOF had no return value");
        }
        Ok(output::decode(captured))
    }

    /// Resolves every external symbol to a runtime address, caching by
    /// name for the duration of this invocation.
    fn resolve_externals(&self) -> Result<HashMap<String, usize>> {
        let mut resolved = HashMap::new();
        for symbol in self.coff.symbols.iter().filter(|s| s.is_external()) {
            if resolved.contains_key(&symbol.name) {
                continue;
            }
            let address = self.resolve_symbol(&symbol.name)?;
            debug!("resolved {} -> {address:#x}", symbol.name);
            resolved.insert(symbol.name.clone(), address);
        }
        Ok(resolved)
    }

    /// Resolution order: Beacon API table, then `LIBRARY$FUNCTION` against
    /// host modules. Anything else is fatal.
    fn resolve_symbol(&self, name: &str) -> Result<usize> {
        let prefix = match self.coff.machine {
            Machine::X64 => "__imp_",
            Machine::X86 => "__imp__",
        };
        let bare = name.strip_prefix(prefix).unwrap_or(name);

        if let Some(address) = self.api.resolve(bare) {
            return Ok(address);
        }

        let Some((library, function)) = bare.split_once('$') else {
            return Err(BofError::UnresolvedSymbol(name.to_string()));
        };
        // x86 decorated stdcall exports carry an @n suffix
        let function = match self.coff.machine {
            Machine::X86 => function.split('@').next().unwrap_or(function),
            Machine::X64 => function,
        };

        let library_c = CString::new(library)
            .map_err(|_| BofError::UnresolvedSymbol(name.to_string()))?;
        let function_c = CString::new(function)
            .map_err(|_| BofError::UnresolvedSymbol(name.to_string()))?;

        unsafe {
            let mut module = GetModuleHandleA(library_c.as_ptr());
            if module.is_null() {
                module = LoadLibraryA(library_c.as_ptr());
            }
            if module.is_null() {
                return Err(BofError::UnresolvedSymbol(name.to_string()));
            }
            let address = GetProcAddress(module, function_c.as_ptr());
            if address.is_null() {
                return Err(BofError::UnresolvedSymbol(name.to_string()));
            }
            Ok(address as usize)
        }
    }

    fn apply_relocations(
        &self,
        sections: &SectionSet,
        slots: &mut ImportSlots,
        resolved: &HashMap<String, usize>,
    ) -> Result<()> {
        for (index, section) in self.coff.sections.iter().enumerate() {
            let allocated = &sections.entries[index];
            for relocation in &section.relocations {
                // index validated at parse time
                let symbol = &self.coff.symbols[relocation.symbol_table_index as usize];

                let target = if symbol.is_external() {
                    // externals bind through a pointer slot: __imp_
                    // references expect the address of a pointer to the
                    // function, and the slot keeps REL32 displacements in
                    // 32-bit reach of the allocations
                    let address = resolved
                        .get(&symbol.name)
                        .copied()
                        .ok_or_else(|| BofError::UnresolvedSymbol(symbol.name.clone()))?;
                    slots.slot_for(address)? as u64
                } else {
                    let section_index = symbol.section_number;
                    if section_index < 1 || section_index as usize > sections.entries.len() {
                        return Err(BofError::MalformedObject(format!(
                            "symbol {} references section {section_index}",
                            symbol.name
                        )));
                    }
                    let base = sections.entries[section_index as usize - 1].base as u64;
                    base.wrapping_add(symbol.value as u64)
                };

                self.patch_site(allocated, relocation.virtual_address, relocation.type_, target)?;
            }
            if !section.relocations.is_empty() {
                debug!(
                    "applied {} relocations to {}",
                    section.relocations.len(),
                    section.name
                );
            }
        }
        Ok(())
    }

    /// Reads the addend at the site, computes the final value and writes
    /// it back, bounds-checked against the section allocation.
    fn patch_site(
        &self,
        allocated: &AllocatedSection,
        offset: u32,
        type_: u16,
        target: u64,
    ) -> Result<()> {
        let width = reloc::width(self.coff.machine, type_)?;
        let in_bounds = (offset as usize)
            .checked_add(width)
            .is_some_and(|end| end <= allocated.size);
        if !in_bounds {
            return Err(BofError::MalformedObject(format!(
                "relocation at {offset:#x} outside section of {} bytes",
                allocated.size
            )));
        }

        // SAFETY: site lies inside this invocation's allocation, checked
        // above; unaligned access is expected for relocation sites.
        unsafe {
            let site = (allocated.base as *mut u8).add(offset as usize);
            let addend = match width {
                8 => ptr::read_unaligned(site as *const i64),
                _ => ptr::read_unaligned(site as *const i32) as i64,
            };
            match reloc::compute(self.coff.machine, type_, site as u64, target, addend)? {
                reloc::Patch::U32(value) => ptr::write_unaligned(site as *mut u32, value),
                reloc::Patch::U64(value) => ptr::write_unaligned(site as *mut u64, value),
            }
        }
        Ok(())
    }

    /// Locates the requested entry function among the defined symbols.
    fn find_entry(&self, entry: &str, sections: &SectionSet) -> Result<*const c_void> {
        for symbol in &self.coff.symbols {
            if symbol.name == entry && symbol.is_function() && symbol.section_number > 0 {
                let index = symbol.section_number as usize - 1;
                if index >= sections.entries.len() {
                    break;
                }
                let base = sections.entries[index].base as *const u8;
                // SAFETY: the offset is checked against the allocation size
                if (symbol.value as usize) < sections.entries[index].size {
                    return Ok(unsafe { base.add(symbol.value as usize) } as *const c_void);
                }
            }
        }
        Err(BofError::EntryNotFound(entry.to_string()))
    }
}

/// One section's runtime memory.
struct AllocatedSection {
    base: *mut c_void,
    size: usize,
    characteristics: u32,
}

/// All section allocations of one invocation. Dropping the set frees
/// every region, covering normal return and every failure exit alike.
struct SectionSet {
    entries: Vec<AllocatedSection>,
}

impl SectionSet {
    fn allocate(coff: &CoffObject<'_>) -> Result<SectionSet> {
        let mut set = SectionSet {
            entries: Vec::with_capacity(coff.sections.len()),
        };

        for section in &coff.sections {
            let size = section.allocation_size();
            if size == 0 {
                // placeholder keeps section indices aligned
                set.entries.push(AllocatedSection {
                    base: null_mut(),
                    size: 0,
                    characteristics: section.characteristics,
                });
                continue;
            }

            // writable during copy and relocation; final permissions are
            // applied afterwards
            let base = unsafe {
                VirtualAlloc(
                    null_mut(),
                    size,
                    MEM_COMMIT | MEM_RESERVE | MEM_TOP_DOWN,
                    PAGE_READWRITE,
                )
            };
            if base.is_null() {
                // partial allocations released by Drop
                return Err(BofError::AllocationFailed(unsafe { GetLastError() }));
            }

            if let Some(data) = coff.section_data(section) {
                // SAFETY: destination was just allocated with at least
                // data.len() bytes; source bounds checked at parse time
                unsafe {
                    ptr::copy_nonoverlapping(data.as_ptr(), base as *mut u8, data.len());
                }
            }
            // sections without raw data stay zero-filled (VirtualAlloc
            // commits zeroed pages)

            debug!("section {} ({size} bytes) at {base:?}", section.name);
            set.entries.push(AllocatedSection {
                base,
                size,
                characteristics: section.characteristics,
            });
        }

        Ok(set)
    }

    /// Applies each section's final memory protection.
    fn protect(&self) -> Result<()> {
        for entry in self.entries.iter().filter(|e| !e.base.is_null()) {
            let mask = entry.characteristics
                & (IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE);
            let protection = match (
                mask & IMAGE_SCN_MEM_EXECUTE != 0,
                mask & IMAGE_SCN_MEM_READ != 0,
                mask & IMAGE_SCN_MEM_WRITE != 0,
            ) {
                (false, false, false) => PAGE_NOACCESS,
                (true, false, false) => PAGE_EXECUTE,
                (false, true, false) => PAGE_READONLY,
                (true, true, false) => PAGE_EXECUTE_READ,
                (false, false, true) => PAGE_WRITECOPY,
                (true, false, true) => PAGE_EXECUTE_WRITECOPY,
                (false, true, true) => PAGE_READWRITE,
                (true, true, true) => PAGE_EXECUTE_READWRITE,
            };

            let mut old = 0u32;
            let ok = unsafe { VirtualProtect(entry.base, entry.size, protection, &mut old) };
            if ok == 0 {
                return Err(BofError::AllocationFailed(unsafe { GetLastError() }));
            }
        }
        Ok(())
    }
}

impl Drop for SectionSet {
    fn drop(&mut self) {
        for entry in &self.entries {
            if !entry.base.is_null() {
                unsafe {
                    VirtualFree(entry.base, 0, MEM_RELEASE);
                }
            }
        }
    }
}

/// Pointer slots external symbols are bound through, one page allocated
/// per invocation and freed with it.
struct ImportSlots {
    base: *mut usize,
    used: usize,
    by_address: HashMap<usize, usize>,
}

impl ImportSlots {
    fn allocate() -> Result<ImportSlots> {
        let base = unsafe {
            VirtualAlloc(
                null_mut(),
                MAX_IMPORTS * std::mem::size_of::<usize>(),
                MEM_COMMIT | MEM_RESERVE | MEM_TOP_DOWN,
                PAGE_READWRITE,
            )
        } as *mut usize;
        if base.is_null() {
            return Err(BofError::AllocationFailed(unsafe { GetLastError() }));
        }
        Ok(ImportSlots {
            base,
            used: 0,
            by_address: HashMap::new(),
        })
    }

    /// Returns the address of a slot holding `address`, reusing slots for
    /// repeated imports.
    fn slot_for(&mut self, address: usize) -> Result<usize> {
        if let Some(&slot) = self.by_address.get(&address) {
            return Ok(slot);
        }
        if self.used >= MAX_IMPORTS {
            return Err(BofError::MalformedObject(format!(
                "object imports more than {MAX_IMPORTS} distinct symbols"
            )));
        }
        // SAFETY: used < MAX_IMPORTS, within the page allocated above
        let slot = unsafe {
            let slot = self.base.add(self.used);
            slot.write(address);
            slot as usize
        };
        self.used += 1;
        self.by_address.insert(address, slot);
        Ok(slot)
    }
}

impl Drop for ImportSlots {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                VirtualFree(self.base as *mut c_void, 0, MEM_RELEASE);
            }
        }
    }
}
