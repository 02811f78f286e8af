//! Byte-level PE parsing: export directory and base-relocation directory.

use crate::{ExeImage, ExportInfo, ImageError, ImageFormat, Result};

const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const OPT_MAGIC_PE32: u16 = 0x10b;
const OPT_MAGIC_PE32_PLUS: u16 = 0x20b;

const MACHINE_I386: u16 = 0x014c;
const MACHINE_AMD64: u16 = 0x8664;
const MACHINE_ARM64: u16 = 0xaa64;

const DIR_EXPORT: usize = 0;
const DIR_BASERELOC: usize = 5;

const REL_BASED_ABSOLUTE: u16 = 0;

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

fn read_cstr(data: &[u8], off: usize) -> Result<&str> {
    let tail = data.get(off..).ok_or(ImageError::Truncated(off))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ImageError::Malformed("unterminated export name"))?;
    core::str::from_utf8(&tail[..end]).map_err(|_| ImageError::Malformed("non-utf8 export name"))
}

/// Pointer width in bytes from the COFF machine field, without a full parse.
pub(crate) fn pointer_width(data: &[u8]) -> Result<u8> {
    let e_lfanew = read_u32(data, 0x3c)? as usize;
    if read_u32(data, e_lfanew)? != NT_SIGNATURE {
        return Err(ImageError::Malformed("bad NT signature"));
    }
    match read_u16(data, e_lfanew + 4)? {
        MACHINE_I386 => Ok(4),
        MACHINE_AMD64 | MACHINE_ARM64 => Ok(8),
        _ => Err(ImageError::Unsupported("unknown PE machine")),
    }
}

/// One section's RVA-to-file-offset mapping.
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_data_offset: u32,
    raw_data_size: u32,
}

/// How the image bytes are addressed: a file keeps sections at their raw
/// offsets, a mapped module keeps them at their virtual addresses.
enum Layout {
    File(Vec<Section>),
    Mapped,
}

impl Layout {
    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        match self {
            Layout::Mapped => Some(rva as usize),
            Layout::File(sections) => {
                for s in sections {
                    let span = s.virtual_size.max(s.raw_data_size);
                    if rva >= s.virtual_address && rva < s.virtual_address.saturating_add(span) {
                        return Some((s.raw_data_offset + (rva - s.virtual_address)) as usize);
                    }
                }
                // RVAs below the first section live in the header region,
                // which is mapped 1:1.
                let first = sections.iter().map(|s| s.virtual_address).min()?;
                (rva < first).then_some(rva as usize)
            }
        }
    }
}

struct Headers {
    machine: u16,
    export_dir: (u32, u32),
    reloc_dir: (u32, u32),
    layout: Layout,
}

fn parse_headers(data: &[u8], mapped: bool) -> Result<Headers> {
    if read_u16(data, 0)? != DOS_MAGIC {
        return Err(ImageError::BadMagic);
    }
    let e_lfanew = read_u32(data, 0x3c)? as usize;
    if e_lfanew > 0x1000 {
        return Err(ImageError::Malformed("unreasonable e_lfanew"));
    }
    if read_u32(data, e_lfanew)? != NT_SIGNATURE {
        return Err(ImageError::Malformed("bad NT signature"));
    }

    let machine = read_u16(data, e_lfanew + 4)?;
    let num_sections = read_u16(data, e_lfanew + 6)? as usize;
    let opt_size = read_u16(data, e_lfanew + 20)? as usize;
    let opt_off = e_lfanew + 24;

    let (dir_off, _width) = match read_u16(data, opt_off)? {
        OPT_MAGIC_PE32_PLUS => (opt_off + 112, 8u8),
        OPT_MAGIC_PE32 => (opt_off + 96, 4u8),
        _ => return Err(ImageError::Malformed("bad optional header magic")),
    };

    let dir = |index: usize| -> Result<(u32, u32)> {
        Ok((
            read_u32(data, dir_off + index * 8)?,
            read_u32(data, dir_off + index * 8 + 4)?,
        ))
    };
    let export_dir = dir(DIR_EXPORT)?;
    let reloc_dir = dir(DIR_BASERELOC)?;

    let layout = if mapped {
        Layout::Mapped
    } else {
        let sect_off = opt_off + opt_size;
        let mut sections = Vec::with_capacity(num_sections);
        for i in 0..num_sections {
            let off = sect_off + i * 40;
            sections.push(Section {
                virtual_size: read_u32(data, off + 8)?,
                virtual_address: read_u32(data, off + 12)?,
                raw_data_size: read_u32(data, off + 16)?,
                raw_data_offset: read_u32(data, off + 20)?,
            });
        }
        Layout::File(sections)
    };

    Ok(Headers {
        machine,
        export_dir,
        reloc_dir,
        layout,
    })
}

fn parse_exports(data: &[u8], h: &Headers, base: usize) -> Result<Vec<ExportInfo>> {
    let (dir_rva, dir_size) = h.export_dir;
    if dir_rva == 0 {
        return Ok(Vec::new());
    }
    let dir = h
        .layout
        .rva_to_offset(dir_rva)
        .ok_or(ImageError::Malformed("export directory outside sections"))?;

    let number_of_names = read_u32(data, dir + 24)? as usize;
    let functions_rva = read_u32(data, dir + 28)?;
    let names_rva = read_u32(data, dir + 32)?;
    let ordinals_rva = read_u32(data, dir + 36)?;

    let functions = h
        .layout
        .rva_to_offset(functions_rva)
        .ok_or(ImageError::Malformed("export function table outside sections"))?;
    let names = h
        .layout
        .rva_to_offset(names_rva)
        .ok_or(ImageError::Malformed("export name table outside sections"))?;
    let ordinals = h
        .layout
        .rva_to_offset(ordinals_rva)
        .ok_or(ImageError::Malformed("export ordinal table outside sections"))?;

    let mut exports = Vec::with_capacity(number_of_names);
    for i in 0..number_of_names {
        let name_rva = read_u32(data, names + i * 4)?;
        let name_off = h
            .layout
            .rva_to_offset(name_rva)
            .ok_or(ImageError::Malformed("export name outside sections"))?;
        let name = read_cstr(data, name_off)?;

        let ordinal = read_u16(data, ordinals + i * 2)? as usize;
        let fn_rva = read_u32(data, functions + ordinal * 4)?;

        // An address inside the export directory itself is a forwarder
        // string ("OTHERDLL.Func"), not code.
        if fn_rva >= dir_rva && fn_rva < dir_rva + dir_size {
            log::debug!("skipping forwarded export {name}");
            continue;
        }

        exports.push(ExportInfo {
            name: name.to_string(),
            address: base + fn_rva as usize,
        });
    }
    Ok(exports)
}

fn parse_relocations(data: &[u8], h: &Headers) -> Result<Vec<u32>> {
    let (dir_rva, dir_size) = h.reloc_dir;
    if dir_rva == 0 || dir_size == 0 {
        return Ok(Vec::new());
    }
    let mut rvas = Vec::new();
    let mut cursor = 0u32;
    while cursor + 8 <= dir_size {
        let block = h
            .layout
            .rva_to_offset(dir_rva + cursor)
            .ok_or(ImageError::Malformed("relocation block outside sections"))?;
        let page_rva = read_u32(data, block)?;
        let block_size = read_u32(data, block + 4)?;
        if block_size < 8 {
            return Err(ImageError::Malformed("degenerate relocation block"));
        }
        let entries = (block_size as usize - 8) / 2;
        for i in 0..entries {
            let raw = read_u16(data, block + 8 + i * 2)?;
            let kind = raw >> 12;
            if kind == REL_BASED_ABSOLUTE {
                continue; // alignment padding
            }
            rvas.push(page_rva + (raw & 0x0fff) as u32);
        }
        cursor += block_size;
    }
    rvas.sort_unstable();
    rvas.dedup();
    Ok(rvas)
}

fn finish(data: &[u8], mapped: bool, base: usize) -> Result<ExeImage> {
    let headers = parse_headers(data, mapped)?;
    let width = match headers.machine {
        MACHINE_I386 => 4,
        MACHINE_AMD64 | MACHINE_ARM64 => 8,
        _ => return Err(ImageError::Unsupported("unknown PE machine")),
    };
    let exports = parse_exports(data, &headers, base)?;
    let relocations = parse_relocations(data, &headers)?;
    Ok(ExeImage::build(ImageFormat::Pe, width, exports, relocations))
}

/// Parse a PE file image from raw bytes. Export addresses are RVAs.
pub(crate) fn parse_file(data: &[u8]) -> Result<ExeImage> {
    finish(data, false, 0)
}

/// Parse the PE module mapped at `base`. Export addresses are absolute.
///
/// # Safety
/// `base` must be the load base of a module mapped in this process.
#[cfg(windows)]
pub(crate) unsafe fn parse_mapped(base: usize) -> Result<ExeImage> {
    // SizeOfImage lives at optional-header offset 56.
    let e_lfanew = *((base + 0x3c) as *const u32) as usize;
    let size_of_image = *((base + e_lfanew + 24 + 56) as *const u32) as usize;
    let data = core::slice::from_raw_parts(base as *const u8, size_of_image);
    finish(data, true, base)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built single-section PE32+ with one export and one relocation
    /// block. Layout: headers in the first 0x200 bytes, ".rdata" at file
    /// offset 0x200 mapped at RVA 0x1000.
    pub(crate) fn synthetic_pe() -> Vec<u8> {
        let mut d = vec![0u8; 0x400];
        let put16 = |d: &mut Vec<u8>, off: usize, v: u16| d[off..off + 2].copy_from_slice(&v.to_le_bytes());
        let put32 = |d: &mut Vec<u8>, off: usize, v: u32| d[off..off + 4].copy_from_slice(&v.to_le_bytes());

        // DOS header
        put16(&mut d, 0, DOS_MAGIC);
        put32(&mut d, 0x3c, 0x80); // e_lfanew

        // NT headers
        put32(&mut d, 0x80, NT_SIGNATURE);
        put16(&mut d, 0x84, MACHINE_AMD64);
        put16(&mut d, 0x86, 1); // NumberOfSections
        put16(&mut d, 0x94, 0xf0); // SizeOfOptionalHeader

        // Optional header (PE32+) at 0x98
        put16(&mut d, 0x98, OPT_MAGIC_PE32_PLUS);
        put32(&mut d, 0x98 + 56, 0x3000); // SizeOfImage
        put32(&mut d, 0x98 + 108, 16); // NumberOfRvaAndSizes
        // DataDirectory[EXPORT] / [BASERELOC]
        let dirs = 0x98 + 112;
        put32(&mut d, dirs, 0x1000);
        put32(&mut d, dirs + 4, 0x80);
        put32(&mut d, dirs + DIR_BASERELOC * 8, 0x1080);
        put32(&mut d, dirs + DIR_BASERELOC * 8 + 4, 12);

        // Section header at 0x98 + 0xf0 = 0x188
        let sect = 0x188;
        d[sect..sect + 6].copy_from_slice(b".rdata");
        put32(&mut d, sect + 8, 0x1000); // VirtualSize
        put32(&mut d, sect + 12, 0x1000); // VirtualAddress
        put32(&mut d, sect + 16, 0x200); // SizeOfRawData
        put32(&mut d, sect + 20, 0x200); // PointerToRawData

        // Export directory at RVA 0x1000 (file 0x200)
        let dir = 0x200;
        put32(&mut d, dir + 24, 1); // NumberOfNames
        put32(&mut d, dir + 28, 0x1028); // AddressOfFunctions
        put32(&mut d, dir + 32, 0x102c); // AddressOfNames
        put32(&mut d, dir + 36, 0x1030); // AddressOfNameOrdinals
        put32(&mut d, 0x228, 0x1500); // functions[0]
        put32(&mut d, 0x22c, 0x1040); // names[0] -> rva 0x1040
        put16(&mut d, 0x230, 0); // ordinals[0]
        d[0x240..0x24a].copy_from_slice(b"LoadThing\0");

        // Relocation block at RVA 0x1080 (file 0x280): page 0x2000,
        // one DIR64 entry at +0x10 plus one ABSOLUTE pad.
        put32(&mut d, 0x280, 0x2000);
        put32(&mut d, 0x284, 12);
        put16(&mut d, 0x288, (10 << 12) | 0x10);
        put16(&mut d, 0x28a, 0);

        d
    }

    #[test]
    fn synthetic_pe_exports_and_relocations() {
        let image = parse_file(&synthetic_pe()).expect("parse synthetic PE");
        assert_eq!(image.format(), ImageFormat::Pe);
        assert_eq!(image.pointer_width(), 8);
        assert_eq!(image.export("LoadThing"), Some(0x1500));
        assert_eq!(image.export("MissingThing"), None);
        assert!(image.has_relocation_entry(0x2010));
        assert!(!image.has_relocation_entry(0x2000)); // ABSOLUTE pads are not entries
        assert!(!image.has_relocation_entry(0x2012));
    }

    #[test]
    fn machine_field_gives_pointer_width() {
        assert_eq!(pointer_width(&synthetic_pe()).unwrap(), 8);
    }
}
