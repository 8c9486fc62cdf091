//! Executable memory for compiled trampolines.
//!
//! Code pages are mapped writable, filled, then flipped to read-execute;
//! writable and executable are never held together. On AArch64 the
//! instruction cache is flushed before the region is handed out.

use std::ffi::c_void;

use crate::jit::backend::CodegenError;

/// Entry convention shared by every backend: one pointer to the frame's
/// argument slots in, normalized result bits out.
pub type TrampolineFn = unsafe extern "C" fn(args: *const u64) -> u64;

/// An owned region of executable memory.
pub struct ExecRegion {
    ptr: *mut u8,
    len: usize,
}

// Safety: the mapping is written only during construction and is
// read/execute for its remaining lifetime, so sharing references across
// threads cannot race.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}

impl ExecRegion {
    /// Maps `code` into fresh executable pages.
    pub fn map(code: &[u8]) -> Result<ExecRegion, CodegenError> {
        if code.is_empty() {
            return Err(CodegenError::Backend("empty code buffer".into()));
        }
        map_pages(code)
    }

    /// The region's entry point.
    ///
    /// # Safety
    ///
    /// The mapped code must uphold the [`TrampolineFn`] contract and the
    /// passed slot pointer must cover every slot the code reads.
    pub unsafe fn entry(&self) -> TrampolineFn {
        std::mem::transmute::<*mut u8, TrampolineFn>(self.ptr)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(unix)]
fn map_pages(code: &[u8]) -> Result<ExecRegion, CodegenError> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return Err(CodegenError::Backend("page size unavailable".into()));
    }
    let page = page as usize;
    let len = (code.len() + page - 1) / page * page;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(CodegenError::Backend("mmap failed".into()));
    }

    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
        if libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            libc::munmap(ptr, len);
            return Err(CodegenError::Backend("mprotect failed".into()));
        }
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        flush_icache(ptr as *mut u8, code.len());
    }

    Ok(ExecRegion {
        ptr: ptr as *mut u8,
        len,
    })
}

#[cfg(not(unix))]
fn map_pages(_code: &[u8]) -> Result<ExecRegion, CodegenError> {
    // No backend targets non-unix hosts; calls there take the VM path.
    Err(CodegenError::UnsupportedTarget)
}

#[cfg(all(unix, target_arch = "aarch64"))]
unsafe fn flush_icache(ptr: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut std::ffi::c_char, end: *mut std::ffi::c_char);
    }
    __clear_cache(ptr as *mut _, ptr.add(len) as *mut _)
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr as *mut c_void, self.len);
        }
        #[cfg(not(unix))]
        let _ = self.ptr as *mut c_void;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn test_mapped_code_executes() {
        // mov rax, rdi; ret
        let region = ExecRegion::map(&[0x48, 0x89, 0xF8, 0xC3]).unwrap();
        let slots = [0u64; 1];
        let raw = unsafe { (region.entry())(slots.as_ptr()) };
        assert_eq!(raw, slots.as_ptr() as u64);
    }

    #[cfg(all(unix, target_arch = "aarch64"))]
    #[test]
    fn test_mapped_code_executes() {
        // ret: x0 already holds the slot pointer
        let region = ExecRegion::map(&0xD65F_03C0_u32.to_le_bytes()).unwrap();
        let slots = [0u64; 1];
        let raw = unsafe { (region.entry())(slots.as_ptr()) };
        assert_eq!(raw, slots.as_ptr() as u64);
    }

    #[cfg(unix)]
    #[test]
    fn test_region_rounds_to_whole_pages() {
        let region = ExecRegion::map(&[0xC3]).unwrap();
        assert!(region.len() >= 4096);
        assert_eq!(region.as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn test_empty_code_rejected() {
        assert!(ExecRegion::map(&[]).is_err());
    }
}
