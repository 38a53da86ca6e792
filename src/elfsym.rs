/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Locate the real `dlsym` and `dlvsym`.
 *
 * The GL capture library exports its own `dlsym`, so asking the dynamic
 * linker for the libc one would return the interposer. Instead, walk the
 * loaded objects with `dl_iterate_phdr` and look the symbols up in the
 * dynamic symbol table of libc (or, on older systems, libdl). */
use log::{debug, error};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::OnceLock;

pub type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
pub type DlvsymFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_void;

/** Objects searched for `dlsym`, in order */
const DL_OBJECTS: &[&str] = &["libc.so.6", "libdl.so.2"];

const DT_NULL: isize = 0;
const DT_HASH: isize = 4;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;
const DT_GNU_HASH: isize = 0x6fff_fef5;
const SHN_UNDEF: u16 = 0;

#[repr(C)]
struct Dyn {
    d_tag: isize,
    d_val: usize,
}

#[cfg(target_pointer_width = "64")]
#[repr(C)]
#[allow(dead_code)]
struct Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

#[cfg(target_pointer_width = "32")]
#[repr(C)]
#[allow(dead_code)]
struct Sym {
    st_name: u32,
    st_value: u32,
    st_size: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
}

/** Hash function of DT_GNU_HASH tables */
pub fn gnu_hash(name: &[u8]) -> u32 {
    name.iter()
        .fold(5381u32, |h, c| h.wrapping_mul(33).wrapping_add(*c as u32))
}

/** Hash function of DT_HASH tables */
pub fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for c in name {
        h = (h << 4).wrapping_add(*c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/** Does the path of a loaded object end in `soname`? */
fn object_matches(path: &[u8], soname: &str) -> bool {
    path.rsplit(|c| *c == b'/').next() == Some(soname.as_bytes())
}

/** Dynamic symbol tables of one loaded object */
struct ElfObject {
    base: usize,
    strtab: *const c_char,
    symtab: *const Sym,
    gnu_hash: *const u32,
    hash: *const u32,
}

impl ElfObject {
    /** Read the tables out of the object's PT_DYNAMIC segment.
     *
     * Safety: `dynamic` must point to the mapped dynamic section. */
    unsafe fn from_dynamic(base: usize, mut dynamic: *const Dyn) -> Option<ElfObject> {
        let mut obj = ElfObject {
            base,
            strtab: std::ptr::null(),
            symtab: std::ptr::null(),
            gnu_hash: std::ptr::null(),
            hash: std::ptr::null(),
        };
        while (*dynamic).d_tag != DT_NULL {
            let v = (*dynamic).d_val;
            /* the dynamic linker relocates these in place on most targets */
            let addr = if v < base { base + v } else { v };
            match (*dynamic).d_tag {
                DT_STRTAB => obj.strtab = addr as *const c_char,
                DT_SYMTAB => obj.symtab = addr as *const Sym,
                DT_GNU_HASH => obj.gnu_hash = addr as *const u32,
                DT_HASH => obj.hash = addr as *const u32,
                _ => (),
            }
            dynamic = dynamic.add(1);
        }
        if obj.strtab.is_null() || obj.symtab.is_null() {
            return None;
        }
        if obj.gnu_hash.is_null() && obj.hash.is_null() {
            return None;
        }
        Some(obj)
    }

    unsafe fn symbol_at(&self, index: usize, name: &[u8]) -> Option<usize> {
        let sym = &*self.symtab.add(index);
        if sym.st_shndx == SHN_UNDEF || sym.st_value == 0 {
            return None;
        }
        let sym_name = CStr::from_ptr(self.strtab.add(sym.st_name as usize));
        if sym_name.to_bytes() != name {
            return None;
        }
        Some(self.base + sym.st_value as usize)
    }

    unsafe fn lookup_gnu(&self, name: &[u8]) -> Option<usize> {
        let h = gnu_hash(name);
        let nbuckets = *self.gnu_hash as usize;
        let symoffset = *self.gnu_hash.add(1) as usize;
        let bloom_size = *self.gnu_hash.add(2) as usize;
        if nbuckets == 0 {
            return None;
        }
        /* bloom filter words are pointer sized */
        let words = std::mem::size_of::<usize>() / 4;
        let buckets = self.gnu_hash.add(4 + bloom_size * words);
        let chain = buckets.add(nbuckets);

        let mut i = *buckets.add(h as usize % nbuckets) as usize;
        if i < symoffset {
            return None;
        }
        loop {
            let ch = *chain.add(i - symoffset);
            if (h | 1) == (ch | 1) {
                if let Some(addr) = self.symbol_at(i, name) {
                    return Some(addr);
                }
            }
            if ch & 1 != 0 {
                return None;
            }
            i += 1;
        }
    }

    unsafe fn lookup_sysv(&self, name: &[u8]) -> Option<usize> {
        let nbucket = *self.hash as usize;
        if nbucket == 0 {
            return None;
        }
        let buckets = self.hash.add(2);
        let chains = buckets.add(nbucket);
        let mut i = *buckets.add(sysv_hash(name) as usize % nbucket) as usize;
        while i != 0 {
            if let Some(addr) = self.symbol_at(i, name) {
                return Some(addr);
            }
            i = *chains.add(i) as usize;
        }
        None
    }

    fn lookup(&self, name: &CStr) -> Option<usize> {
        let name = name.to_bytes();
        // SAFETY: tables were taken from a loaded object, which stays mapped
        unsafe {
            if !self.gnu_hash.is_null() {
                self.lookup_gnu(name)
            } else {
                self.lookup_sysv(name)
            }
        }
    }
}

struct Search<'a> {
    soname: &'a str,
    found: Option<ElfObject>,
}

unsafe extern "C" fn visit_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let search = &mut *(data as *mut Search<'_>);
    let info = &*info;
    if info.dlpi_name.is_null() || info.dlpi_phdr.is_null() {
        return 0;
    }
    if !object_matches(CStr::from_ptr(info.dlpi_name).to_bytes(), search.soname) {
        return 0;
    }
    let base = info.dlpi_addr as usize;
    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let Some(dynamic) = phdrs.iter().find(|p| p.p_type == libc::PT_DYNAMIC) else {
        return 0;
    };
    let dynamic = (base + dynamic.p_vaddr as usize) as *const Dyn;
    search.found = ElfObject::from_dynamic(base, dynamic);
    1
}

fn find_object(soname: &str) -> Option<ElfObject> {
    let mut search = Search {
        soname,
        found: None,
    };
    // SAFETY: the callback only reads the headers it is given
    unsafe {
        libc::dl_iterate_phdr(
            Some(visit_object),
            &mut search as *mut Search<'_> as *mut c_void,
        );
    }
    search.found
}

/** Address of `symbol` in the loaded object whose file name is `soname` */
pub fn lookup_symbol(soname: &str, symbol: &CStr) -> Option<usize> {
    find_object(soname)?.lookup(symbol)
}

struct RealDl {
    dlsym: DlsymFn,
    dlvsym: Option<DlvsymFn>,
}

fn resolve() -> Option<RealDl> {
    for soname in DL_OBJECTS {
        let Some(obj) = find_object(soname) else {
            continue;
        };
        let Some(dlsym) = obj.lookup(c"dlsym") else {
            continue;
        };
        debug!("Found dlsym in {}", soname);
        // SAFETY: these are the libc entry points of the given names
        unsafe {
            return Some(RealDl {
                dlsym: std::mem::transmute::<usize, DlsymFn>(dlsym),
                dlvsym: obj
                    .lookup(c"dlvsym")
                    .map(|x| std::mem::transmute::<usize, DlvsymFn>(x)),
            });
        }
    }
    error!("Failed to resolve dlsym");
    None
}

fn real() -> Option<&'static RealDl> {
    static REAL: OnceLock<Option<RealDl>> = OnceLock::new();
    REAL.get_or_init(resolve).as_ref()
}

/** `dlsym` as libc implements it; null if it could not be found.
 *
 * Safety: as for `dlsym`. */
pub unsafe fn real_dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    match real() {
        Some(r) => (r.dlsym)(handle, name),
        None => std::ptr::null_mut(),
    }
}

/** `dlvsym` as libc implements it; null if it could not be found.
 *
 * Safety: as for `dlvsym`. */
pub unsafe fn real_dlvsym(
    handle: *mut c_void,
    name: *const c_char,
    version: *const c_char,
) -> *mut c_void {
    match real().and_then(|r| r.dlvsym) {
        Some(f) => f(handle, name, version),
        None => std::ptr::null_mut(),
    }
}
