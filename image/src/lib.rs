//! graft-image: executable-image query surface.
//!
//! Parses the native image formats (ELF and PE) just far enough to answer
//! the questions the rest of graft asks: "where is the export named X",
//! "is this RVA subject to base relocation", and "which modules are mapped
//! in this process". Both parsers are byte-level so a file belonging to a
//! *different* process (for example a target's libc) can be inspected on
//! any host.

use std::collections::BTreeMap;
use std::path::Path;

mod elf;
mod pe;
pub mod modules;

pub use modules::ModuleInfo;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("i/o error reading image: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognized image magic")]
    BadMagic,
    #[error("image truncated at offset {0:#x}")]
    Truncated(usize),
    #[error("malformed image: {0}")]
    Malformed(&'static str),
    #[error("unsupported image flavor: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// A named export and its resolved address.
///
/// For file-parsed images the address is the image-relative virtual address
/// (RVA for PE, `st_value` for ELF); for module-base images it is absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub address: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Elf,
    Pe,
}

/// Parsed view of one executable image.
#[derive(Debug)]
pub struct ExeImage {
    format: ImageFormat,
    pointer_width: u8,
    exports: Vec<ExportInfo>,
    by_name: BTreeMap<String, usize>,
    relocations: Vec<u32>,
}

impl ExeImage {
    /// Parse an image from raw file bytes. Format is detected by magic.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match data {
            [0x7f, b'E', b'L', b'F', ..] => elf::parse_file(data),
            [b'M', b'Z', ..] => pe::parse_file(data),
            _ => Err(ImageError::BadMagic),
        }
    }

    /// Parse an image from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let image = Self::from_bytes(&data)?;
        log::debug!(
            "parsed {:?} image {} ({} exports, {} relocation entries)",
            image.format,
            path.display(),
            image.exports.len(),
            image.relocations.len()
        );
        Ok(image)
    }

    /// Parse the image mapped at `base` in the current process.
    ///
    /// # Safety
    /// `base` must be the base address of a loaded module.
    #[cfg(target_os = "linux")]
    pub unsafe fn from_module_base(base: usize) -> Result<Self> {
        elf::parse_mapped(base)
    }

    /// Parse the image mapped at `base` in the current process.
    ///
    /// # Safety
    /// `base` must be the base address of a loaded module.
    #[cfg(windows)]
    pub unsafe fn from_module_base(base: usize) -> Result<Self> {
        pe::parse_mapped(base)
    }

    pub(crate) fn build(
        format: ImageFormat,
        pointer_width: u8,
        exports: Vec<ExportInfo>,
        relocations: Vec<u32>,
    ) -> Self {
        let by_name = exports
            .iter()
            .map(|e| (e.name.clone(), e.address))
            .collect();
        Self {
            format,
            pointer_width,
            exports,
            by_name,
            relocations,
        }
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Pointer width of the image's target architecture, in bytes (4 or 8).
    pub fn pointer_width(&self) -> u8 {
        self.pointer_width
    }

    /// Look up a named export.
    pub fn export(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// All exports, in table order.
    pub fn exports(&self) -> &[ExportInfo] {
        &self.exports
    }

    /// Whether `rva` appears in the PE base-relocation directory.
    ///
    /// ELF images carry their relocations in a shape this surface does not
    /// expose; the answer is always `false` for them.
    pub fn has_relocation_entry(&self, rva: u32) -> bool {
        self.relocations.binary_search(&rva).is_ok()
    }
}

/// Pointer width (in bytes) of the architecture an image file targets.
///
/// Cheap header-only probe: works for image flavors whose full export parse
/// is unsupported (e.g. 32-bit ELF), which is exactly what the injector's
/// architecture-mismatch check needs.
pub fn pointer_width_of(path: &Path) -> Result<u8> {
    let data = std::fs::read(path)?;
    match data.as_slice() {
        [0x7f, b'E', b'L', b'F', ..] => elf::pointer_width(&data),
        [b'M', b'Z', ..] => pe::pointer_width(&data),
        _ => Err(ImageError::BadMagic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_magic() {
        let err = ExeImage::from_bytes(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, ImageError::BadMagic));
    }

    #[test]
    fn rejects_short_input() {
        assert!(ExeImage::from_bytes(b"MZ").is_err());
        assert!(ExeImage::from_bytes(&[0x7f, b'E', b'L', b'F']).is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn parses_host_libc_exports() {
        let maps = std::fs::read_to_string("/proc/self/maps").expect("read maps");
        let libc_path = maps
            .lines()
            .filter_map(|l| l.split_whitespace().last())
            .find(|p| p.contains("libc.so") || p.ends_with("libc-2.31.so"))
            .expect("host libc mapping");

        let image = ExeImage::from_file(Path::new(libc_path)).expect("parse libc");
        assert_eq!(image.format(), ImageFormat::Elf);
        assert_eq!(image.pointer_width() as usize, core::mem::size_of::<usize>());
        assert!(image.export("malloc").is_some(), "libc must export malloc");
        assert!(image.export("dlopen").is_some() || image.export("__libc_dlopen_mode").is_some());
        assert!(image.export("definitely_not_a_libc_symbol").is_none());
        // ELF images never answer the PE relocation query.
        assert!(!image.has_relocation_entry(0x1000));
    }
}
