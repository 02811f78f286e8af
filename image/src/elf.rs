//! Byte-level ELF64 parsing (file images) and PT_DYNAMIC symbol walking
//! (mapped images, Linux).

use crate::{ExeImage, ExportInfo, ImageError, ImageFormat, Result};

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const SHT_SYMTAB: u32 = 2;
const SHT_DYNSYM: u32 = 11;

const SHN_UNDEF: u16 = 0;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ImageError::Truncated(off))
}

fn read_u32(data: &[u8], off: usize) -> Result<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ImageError::Truncated(off))
}

fn read_u64(data: &[u8], off: usize) -> Result<u64> {
    data.get(off..off + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or(ImageError::Truncated(off))
}

fn read_cstr(data: &[u8], off: usize) -> Result<&str> {
    let tail = data.get(off..).ok_or(ImageError::Truncated(off))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ImageError::Malformed("unterminated string table entry"))?;
    core::str::from_utf8(&tail[..end]).map_err(|_| ImageError::Malformed("non-utf8 symbol name"))
}

/// Pointer width in bytes from the ELF class byte, without a full parse.
pub(crate) fn pointer_width(data: &[u8]) -> Result<u8> {
    match data.get(4) {
        Some(&ELFCLASS32) => Ok(4),
        Some(&ELFCLASS64) => Ok(8),
        _ => Err(ImageError::Truncated(4)),
    }
}

struct SectionHeader {
    sh_type: u32,
    sh_offset: usize,
    sh_size: usize,
    sh_link: u32,
    sh_entsize: usize,
}

fn section_header(data: &[u8], off: usize) -> Result<SectionHeader> {
    Ok(SectionHeader {
        sh_type: read_u32(data, off + 4)?,
        sh_offset: read_u64(data, off + 24)? as usize,
        sh_size: read_u64(data, off + 32)? as usize,
        sh_link: read_u32(data, off + 40)?,
        sh_entsize: read_u64(data, off + 56)? as usize,
    })
}

/// Collect the defined GLOBAL/WEAK symbols of one symbol-table section.
fn walk_symtab(
    data: &[u8],
    symtab: &SectionHeader,
    strtab: &SectionHeader,
    out: &mut Vec<ExportInfo>,
) -> Result<()> {
    let entsize = if symtab.sh_entsize != 0 { symtab.sh_entsize } else { 24 };
    let count = symtab.sh_size / entsize;
    for i in 0..count {
        let off = symtab.sh_offset + i * entsize;
        let st_name = read_u32(data, off)? as usize;
        let st_info = *data.get(off + 4).ok_or(ImageError::Truncated(off + 4))?;
        let st_shndx = read_u16(data, off + 6)?;
        let st_value = read_u64(data, off + 8)?;

        if st_shndx == SHN_UNDEF || st_value == 0 || st_name == 0 {
            continue;
        }
        let bind = st_info >> 4;
        if bind != STB_GLOBAL && bind != STB_WEAK {
            continue;
        }
        let name = read_cstr(data, strtab.sh_offset + st_name)?;
        out.push(ExportInfo {
            name: name.to_string(),
            address: st_value as usize,
        });
    }
    Ok(())
}

/// Parse an ELF file image from raw bytes.
///
/// Walks the section table for `.dynsym` (the export surface) and falls back
/// to `.symtab` for static executables that carry no dynamic symbols.
pub(crate) fn parse_file(data: &[u8]) -> Result<ExeImage> {
    match *data.get(4).ok_or(ImageError::Truncated(4))? {
        ELFCLASS64 => {}
        ELFCLASS32 => return Err(ImageError::Unsupported("32-bit ELF export parsing")),
        _ => return Err(ImageError::Malformed("bad ELF class")),
    }
    if *data.get(5).ok_or(ImageError::Truncated(5))? != ELFDATA2LSB {
        return Err(ImageError::Unsupported("big-endian ELF"));
    }

    let e_shoff = read_u64(data, 0x28)? as usize;
    let e_shentsize = read_u16(data, 0x3a)? as usize;
    let e_shnum = read_u16(data, 0x3c)? as usize;
    if e_shoff == 0 || e_shnum == 0 {
        return Err(ImageError::Malformed("ELF image has no section table"));
    }

    let headers: Vec<SectionHeader> = (0..e_shnum)
        .map(|i| section_header(data, e_shoff + i * e_shentsize))
        .collect::<Result<_>>()?;

    let mut exports = Vec::new();
    let mut saw_dynsym = false;
    for wanted in [SHT_DYNSYM, SHT_SYMTAB] {
        if wanted == SHT_SYMTAB && saw_dynsym {
            break;
        }
        for sh in headers.iter().filter(|s| s.sh_type == wanted) {
            let strtab = headers
                .get(sh.sh_link as usize)
                .ok_or(ImageError::Malformed("symtab sh_link out of range"))?;
            walk_symtab(data, sh, strtab, &mut exports)?;
            if wanted == SHT_DYNSYM {
                saw_dynsym = true;
            }
        }
    }

    Ok(ExeImage::build(ImageFormat::Elf, 8, exports, Vec::new()))
}

// ── Mapped images (Linux) ────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod mapped {
    pub const DT_NULL: i64 = 0;
    pub const DT_HASH: i64 = 4;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

    pub const PT_DYNAMIC: u32 = 2;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Phdr {
        pub p_type: u32,
        pub p_flags: u32,
        pub p_offset: u64,
        pub p_vaddr: u64,
        pub p_paddr: u64,
        pub p_filesz: u64,
        pub p_memsz: u64,
        pub p_align: u64,
    }
}

/// Count symbols covered by a GNU hash table.
///
/// GNU hash tables don't store the symbol count directly; the highest
/// chain index with its stop bit set bounds the table.
#[cfg(target_os = "linux")]
unsafe fn gnu_hash_nsyms(gnu_hash: *const u8) -> usize {
    let nbuckets = *(gnu_hash as *const u32);
    let symoffset = *((gnu_hash as *const u32).add(1));
    let bloom_size = *((gnu_hash as *const u32).add(2));

    let bloom = (gnu_hash as *const u32).add(4) as *const u64;
    let buckets = bloom.add(bloom_size as usize) as *const u32;
    let chains = buckets.add(nbuckets as usize);

    let mut max_sym: u32 = 0;
    for i in 0..nbuckets {
        let b = *buckets.add(i as usize);
        if b > max_sym {
            max_sym = b;
        }
    }
    if max_sym < symoffset {
        return symoffset as usize;
    }

    let mut idx = max_sym;
    loop {
        let chain_entry = *chains.add((idx - symoffset) as usize);
        if chain_entry & 1 != 0 {
            break;
        }
        idx += 1;
    }
    (idx + 1) as usize
}

/// Parse the ELF image mapped at `base` by walking its PT_DYNAMIC segment.
///
/// # Safety
/// `base` must be the load base of a module mapped in this process.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn parse_mapped(base: usize) -> Result<ExeImage> {
    use core::ffi::CStr;
    use mapped::*;

    let ident = core::slice::from_raw_parts(base as *const u8, 6);
    if ident[..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(ImageError::BadMagic);
    }
    if ident[4] != ELFCLASS64 {
        return Err(ImageError::Unsupported("32-bit mapped ELF"));
    }

    let e_phoff = *((base + 0x20) as *const u64) as usize;
    let e_phnum = *((base + 0x38) as *const u16) as usize;
    let phdrs = core::slice::from_raw_parts((base + e_phoff) as *const Elf64Phdr, e_phnum);

    let dynamic = phdrs
        .iter()
        .find(|p| p.p_type == PT_DYNAMIC)
        .map(|p| (base + p.p_vaddr as usize) as *const Elf64Dyn)
        .ok_or(ImageError::Malformed("mapped ELF has no PT_DYNAMIC"))?;

    let mut symtab_val: u64 = 0;
    let mut strtab_val: u64 = 0;
    let mut hash_val: u64 = 0;
    let mut gnu_hash_val: u64 = 0;

    let mut entry = dynamic;
    loop {
        let d = *entry;
        if d.d_tag == DT_NULL {
            break;
        }
        match d.d_tag {
            DT_SYMTAB => symtab_val = d.d_val,
            DT_STRTAB => strtab_val = d.d_val,
            DT_HASH => hash_val = d.d_val,
            DT_GNU_HASH => gnu_hash_val = d.d_val,
            _ => {}
        }
        entry = entry.add(1);
    }
    if symtab_val == 0 || strtab_val == 0 {
        return Err(ImageError::Malformed("PT_DYNAMIC lacks symtab/strtab"));
    }

    // DT entries hold virtual addresses. For ld.so-loaded modules these are
    // already relocated to absolute runtime addresses; for kernel-injected
    // images (vdso) they can still be file-relative and need the base added.
    let adjusted = symtab_val > base as u64 || strtab_val > base as u64;
    let resolve = |val: u64| -> usize {
        if adjusted {
            val as usize
        } else {
            base + val as usize
        }
    };

    let symtab = resolve(symtab_val) as *const Elf64Sym;
    let strtab = resolve(strtab_val) as *const u8;

    let nsyms = if hash_val != 0 {
        // Classic hash header: nbucket, nchain; nchain == symbol count.
        *((resolve(hash_val) + 4) as *const u32) as usize
    } else if gnu_hash_val != 0 {
        gnu_hash_nsyms(resolve(gnu_hash_val) as *const u8)
    } else {
        return Err(ImageError::Malformed("mapped ELF has no hash table"));
    };

    let mut exports = Vec::new();
    for i in 0..nsyms {
        let sym = *symtab.add(i);
        if sym.st_shndx == 0 || sym.st_value == 0 || sym.st_name == 0 {
            continue;
        }
        let bind = sym.st_info >> 4;
        if bind != STB_GLOBAL && bind != STB_WEAK {
            continue;
        }
        let name_ptr = strtab.add(sym.st_name as usize) as *const core::ffi::c_char;
        let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
        exports.push(ExportInfo {
            name,
            address: base + sym.st_value as usize,
        });
    }

    Ok(ExeImage::build(ImageFormat::Elf, 8, exports, Vec::new()))
}
