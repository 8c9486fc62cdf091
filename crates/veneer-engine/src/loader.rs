//! Shared-library loading and symbol resolution.
//!
//! A library string names one or more candidates separated by commas
//! or spaces (`"nolib.so,reallib.so"`); the first that opens wins. Symbol lookups go through a per-library memo table so a symbol
//! shared by many call sites resolves once. Negative lookups are not
//! cached; a symbol that appears later (after a `dlopen` elsewhere)
//! should not stay dead.

use std::ffi::c_void;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// No candidate in the list could be opened.
    #[error("library not available: {spec}: {detail}")]
    NotAvailable { spec: String, detail: String },

    /// The library opened but the symbol is missing.
    #[error("symbol `{name}` not found: {detail}")]
    MissingSymbol { name: String, detail: String },
}

/// An open shared library.
#[derive(Debug)]
pub struct Library {
    handle: *mut c_void,
    path: String,
    symbols: Mutex<FxHashMap<String, usize>>,
    owned: bool,
}

// Safety: the handle is an opaque process-global token; `dlsym` and
// `GetProcAddress` are documented thread-safe, and the memo table is
// behind its own lock.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Opens the first available candidate of `spec`.
    pub fn open(spec: &str) -> Result<Library, LoadError> {
        let mut detail = String::from("no candidates");
        for candidate in spec.split([',', ' ']).map(str::trim) {
            if candidate.is_empty() {
                continue;
            }
            match Library::open_single(candidate) {
                Ok(library) => return Ok(library),
                Err(e) => detail = e,
            }
        }
        Err(LoadError::NotAvailable {
            spec: spec.to_string(),
            detail,
        })
    }

    /// The calling process itself: the executable plus everything already
    /// linked into it. Useful for symbols the process is guaranteed to
    /// carry, such as the C runtime.
    pub fn this() -> Result<Library, LoadError> {
        Library::open_self()
    }

    /// The candidate this library was actually opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolves `name`, memoizing successful lookups.
    pub fn symbol(&self, name: &str) -> Result<usize, LoadError> {
        if let Some(&addr) = self.symbols.lock().get(name) {
            return Ok(addr);
        }
        let addr = self.raw_symbol(name)?;
        self.symbols.lock().insert(name.to_string(), addr);
        Ok(addr)
    }

    /// Number of memoized symbols.
    pub fn cached_symbols(&self) -> usize {
        self.symbols.lock().len()
    }

    fn from_handle(handle: *mut c_void, path: &str, owned: bool) -> Library {
        Library {
            handle,
            path: path.to_string(),
            symbols: Mutex::new(FxHashMap::default()),
            owned,
        }
    }
}

// ====== Unix ======

#[cfg(unix)]
impl Library {
    fn open_single(path: &str) -> Result<Library, String> {
        use std::ffi::CString;

        let c_path = CString::new(path).map_err(|_| "path contains a NUL byte".to_string())?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(last_dl_error());
        }
        Ok(Library::from_handle(handle, path, true))
    }

    fn open_self() -> Result<Library, LoadError> {
        let handle =
            unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoadError::NotAvailable {
                spec: "<self>".into(),
                detail: last_dl_error(),
            });
        }
        Ok(Library::from_handle(handle, "<self>", true))
    }

    fn raw_symbol(&self, name: &str) -> Result<usize, LoadError> {
        use std::ffi::{CStr, CString};

        let c_name = CString::new(name).map_err(|_| LoadError::MissingSymbol {
            name: name.to_string(),
            detail: "name contains a NUL byte".into(),
        })?;
        unsafe {
            // A valid symbol may live at address zero, so the error state
            // is dlerror(), not the returned pointer.
            libc::dlerror();
            let addr = libc::dlsym(self.handle, c_name.as_ptr());
            let err = libc::dlerror();
            if !err.is_null() {
                return Err(LoadError::MissingSymbol {
                    name: name.to_string(),
                    detail: CStr::from_ptr(err).to_string_lossy().into_owned(),
                });
            }
            Ok(addr as usize)
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown dlopen failure".to_string()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

// ====== Windows ======

#[cfg(windows)]
#[allow(non_snake_case)]
mod win {
    use std::ffi::c_void;

    extern "system" {
        pub fn LoadLibraryW(name: *const u16) -> *mut c_void;
        pub fn GetModuleHandleW(name: *const u16) -> *mut c_void;
        pub fn GetProcAddress(handle: *mut c_void, name: *const u8) -> *mut c_void;
        pub fn FreeLibrary(handle: *mut c_void) -> i32;
        pub fn GetLastError() -> u32;
    }

    pub fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }
}

#[cfg(windows)]
impl Library {
    fn open_single(path: &str) -> Result<Library, String> {
        let handle = unsafe { win::LoadLibraryW(win::wide(path).as_ptr()) };
        if handle.is_null() {
            return Err(format!("error {}", unsafe { win::GetLastError() }));
        }
        Ok(Library::from_handle(handle, path, true))
    }

    fn open_self() -> Result<Library, LoadError> {
        let handle = unsafe { win::GetModuleHandleW(std::ptr::null()) };
        if handle.is_null() {
            return Err(LoadError::NotAvailable {
                spec: "<self>".into(),
                detail: format!("error {}", unsafe { win::GetLastError() }),
            });
        }
        // Module handles from GetModuleHandleW are not reference counted.
        Ok(Library::from_handle(handle, "<self>", false))
    }

    fn raw_symbol(&self, name: &str) -> Result<usize, LoadError> {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        let addr = unsafe { win::GetProcAddress(self.handle, bytes.as_ptr()) };
        if addr.is_null() {
            return Err(LoadError::MissingSymbol {
                name: name.to_string(),
                detail: format!("error {}", unsafe { win::GetLastError() }),
            });
        }
        Ok(addr as usize)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if !self.owned || self.handle.is_null() {
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::dlclose(self.handle);
        }
        #[cfg(windows)]
        unsafe {
            win::FreeLibrary(self.handle);
        }
    }
}
