use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

/// Address range of the running image's executable code.
///
/// Computed fresh for every check; never cached. A section is either fully
/// valid (non-null start and non-zero size) or unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSection {
    start: usize,
    size: usize,
    available: bool,
}

impl CodeSection {
    pub fn new(start: usize, size: usize) -> Self {
        if start == 0 || size == 0 {
            return Self::unavailable();
        }
        Self {
            start,
            size,
            available: true,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            start: 0,
            size: 0,
            available: false,
        }
    }

    pub fn from_slice(bytes: &'static [u8]) -> Self {
        Self::new(bytes.as_ptr() as usize, bytes.len())
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// View of the section's bytes; empty when unavailable.
    ///
    /// # Safety
    ///
    /// `start..start + size` must stay mapped readable for the rest of the
    /// process. The bytes belong to the process image, not to this value; every
    /// locator in this module only reports ranges of the running executable's
    /// own code mapping.
    pub unsafe fn as_bytes(&self) -> &'static [u8] {
        if !self.available {
            return &[];
        }
        std::slice::from_raw_parts(self.start as *const u8, self.size)
    }
}

pub trait CodeSectionLocator: Send + Sync {
    /// Never fails; reports [`CodeSection::unavailable`] instead.
    fn locate(&self) -> CodeSection;

    fn strategy(&self) -> LocatorStrategy;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorStrategy {
    Auto,
    LinkSymbols,
    LoadedImage,
    MemoryMap,
    Unavailable,
}

impl LocatorStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "link-symbols" | "link_symbols" => Some(Self::LinkSymbols),
            "loaded-image" | "loaded_image" => Some(Self::LoadedImage),
            "memory-map" | "memory_map" | "maps" => Some(Self::MemoryMap),
            "unavailable" | "none" | "off" => Some(Self::Unavailable),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        match std::env::var("SELF_GUARD_LOCATOR") {
            Ok(raw) => Self::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown code section locator; using auto");
                Self::Auto
            }),
            Err(_) => Self::Auto,
        }
    }

    /// Platform default for `Auto`; any other strategy is returned unchanged.
    pub fn resolve(self) -> Self {
        if !matches!(self, Self::Auto) {
            return self;
        }
        if cfg!(target_os = "linux") || cfg!(target_os = "macos") {
            Self::LoadedImage
        } else if cfg!(target_os = "android") {
            Self::MemoryMap
        } else {
            Self::Unavailable
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::LinkSymbols => "link-symbols",
            Self::LoadedImage => "loaded-image",
            Self::MemoryMap => "memory-map",
            Self::Unavailable => "unavailable",
        }
    }

    pub fn build(self) -> Arc<dyn CodeSectionLocator> {
        match self.resolve() {
            Self::LinkSymbols => link_symbol_locator(),
            Self::LoadedImage => Arc::new(LoadedImageLocator),
            Self::MemoryMap => Arc::new(MemoryMapLocator::default()),
            Self::Auto | Self::Unavailable => Arc::new(UnavailableLocator),
        }
    }
}

impl fmt::Display for LocatorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableLocator;

impl CodeSectionLocator for UnavailableLocator {
    fn locate(&self) -> CodeSection {
        CodeSection::unavailable()
    }

    fn strategy(&self) -> LocatorStrategy {
        LocatorStrategy::Unavailable
    }
}

#[cfg(all(feature = "link-symbols", target_os = "linux"))]
fn link_symbol_locator() -> Arc<dyn CodeSectionLocator> {
    Arc::new(LinkSymbolLocator)
}

#[cfg(not(all(feature = "link-symbols", target_os = "linux")))]
fn link_symbol_locator() -> Arc<dyn CodeSectionLocator> {
    warn!("link-symbol locator not compiled in; code section will be unavailable");
    Arc::new(UnavailableLocator)
}

/// Linker-provided `__executable_start` .. `etext`.
#[cfg(all(feature = "link-symbols", target_os = "linux"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkSymbolLocator;

#[cfg(all(feature = "link-symbols", target_os = "linux"))]
extern "C" {
    static __executable_start: u8;
    static etext: u8;
}

#[cfg(all(feature = "link-symbols", target_os = "linux"))]
impl CodeSectionLocator for LinkSymbolLocator {
    fn locate(&self) -> CodeSection {
        // SAFETY: only the addresses of the linker symbols are taken.
        let (start, end) = unsafe {
            (
                std::ptr::addr_of!(__executable_start) as usize,
                std::ptr::addr_of!(etext) as usize,
            )
        };
        CodeSection::new(start, end.saturating_sub(start))
    }

    fn strategy(&self) -> LocatorStrategy {
        LocatorStrategy::LinkSymbols
    }
}

/// Introspects the loader's view of the main program image.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedImageLocator;

impl CodeSectionLocator for LoadedImageLocator {
    fn locate(&self) -> CodeSection {
        let section = loaded_image_section();
        if !section.is_available() {
            debug!("loaded image introspection found no executable section");
        }
        section
    }

    fn strategy(&self) -> LocatorStrategy {
        LocatorStrategy::LoadedImage
    }
}

#[cfg(target_os = "linux")]
fn loaded_image_section() -> CodeSection {
    unsafe extern "C" fn first_exec_segment(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        // SAFETY: `data` is the `Option` passed below and `info` is provided
        // by the loader for the duration of this callback.
        let found = &mut *(data as *mut Option<(usize, usize)>);
        let info = &*info;
        if !info.dlpi_phdr.is_null() {
            let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
            for header in headers {
                if header.p_type == libc::PT_LOAD && (header.p_flags & libc::PF_X) != 0 {
                    let start = (info.dlpi_addr as usize).wrapping_add(header.p_vaddr as usize);
                    *found = Some((start, header.p_filesz as usize));
                    break;
                }
            }
        }
        // The main program is always reported first; stop after it.
        1
    }

    let mut found: Option<(usize, usize)> = None;
    // SAFETY: the callback only writes through `data`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(
            Some(first_exec_segment),
            &mut found as *mut Option<(usize, usize)> as *mut libc::c_void,
        );
    }
    match found {
        Some((start, size)) => CodeSection::new(start, size),
        None => CodeSection::unavailable(),
    }
}

#[cfg(target_os = "macos")]
fn loaded_image_section() -> CodeSection {
    use std::os::raw::{c_char, c_ulong, c_void};

    extern "C" {
        fn _dyld_get_image_header(image_index: u32) -> *const c_void;
        fn getsectiondata(
            mhp: *const c_void,
            segname: *const c_char,
            sectname: *const c_char,
            size: *mut c_ulong,
        ) -> *mut u8;
    }

    // SAFETY: image 0 is the main executable; both names are NUL-terminated.
    unsafe {
        let header = _dyld_get_image_header(0);
        if header.is_null() {
            return CodeSection::unavailable();
        }
        let mut size: c_ulong = 0;
        let text = getsectiondata(
            header,
            b"__TEXT\0".as_ptr() as *const c_char,
            b"__text\0".as_ptr() as *const c_char,
            &mut size,
        );
        if text.is_null() {
            return CodeSection::unavailable();
        }
        CodeSection::new(text as usize, size as usize)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn loaded_image_section() -> CodeSection {
    CodeSection::unavailable()
}

/// Parses the process's own memory-map description.
#[derive(Debug, Clone)]
pub struct MemoryMapLocator {
    maps_path: PathBuf,
    exe_path: PathBuf,
}

impl Default for MemoryMapLocator {
    fn default() -> Self {
        Self::with_paths("/proc/self/maps", "/proc/self/exe")
    }
}

impl MemoryMapLocator {
    pub fn with_paths(maps_path: impl Into<PathBuf>, exe_path: impl Into<PathBuf>) -> Self {
        Self {
            maps_path: maps_path.into(),
            exe_path: exe_path.into(),
        }
    }
}

impl CodeSectionLocator for MemoryMapLocator {
    fn locate(&self) -> CodeSection {
        let maps = match std::fs::read_to_string(&self.maps_path) {
            Ok(maps) => maps,
            Err(err) => {
                debug!(path = %self.maps_path.display(), error = %err, "memory map unreadable");
                return CodeSection::unavailable();
            }
        };
        let exe = std::fs::read_link(&self.exe_path).ok();
        select_code_region(&maps, exe.as_deref())
    }

    fn strategy(&self) -> LocatorStrategy {
        LocatorStrategy::MemoryMap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapsRegion<'a> {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub executable: bool,
    pub pathname: Option<&'a str>,
}

/// Parses one `/proc/<pid>/maps` line:
/// `start-end perms offset dev inode [pathname]`.
pub fn parse_maps_line(line: &str) -> Option<MapsRegion<'_>> {
    let mut rest = line;
    let range = take_field(&mut rest)?;
    let perms = take_field(&mut rest)?.as_bytes();
    let (start_raw, end_raw) = range.split_once('-')?;
    let start = usize::from_str_radix(start_raw, 16).ok()?;
    let end = usize::from_str_radix(end_raw, 16).ok()?;
    if end < start || perms.len() < 3 {
        return None;
    }

    // offset, dev, inode
    for _ in 0..3 {
        take_field(&mut rest)?;
    }
    let pathname = rest.trim();

    Some(MapsRegion {
        start,
        end,
        readable: perms[0] == b'r',
        executable: perms[2] == b'x',
        pathname: (!pathname.is_empty()).then_some(pathname),
    })
}

fn take_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (field, remainder) = trimmed.split_at(end);
    *rest = remainder;
    Some(field)
}

/// First `r-x` region backed by `exe`, or the first `r-x` region at all when
/// no region matches the executable path.
pub fn select_code_region(maps: &str, exe: Option<&Path>) -> CodeSection {
    let mut first_exec: Option<MapsRegion<'_>> = None;
    for region in maps.lines().filter_map(parse_maps_line) {
        if !(region.readable && region.executable) {
            continue;
        }
        let owned_by_exe = match (exe, region.pathname) {
            (Some(exe), Some(pathname)) => Path::new(pathname) == exe,
            _ => false,
        };
        if owned_by_exe {
            return CodeSection::new(region.start, region.end - region.start);
        }
        if first_exec.is_none() {
            first_exec = Some(region);
        }
    }

    match first_exec {
        Some(region) => CodeSection::new(region.start, region.end - region.start),
        None => CodeSection::unavailable(),
    }
}
