use crate::error::ModuleError;
use crate::rwlock::RwLock;
use libloading::Library;
use std::ffi::{c_char, c_int, c_void};
use std::sync::Arc;
use tracing::{debug, warn};

/// Fixed registry capacity.
pub const MAX_MODULES: usize = 256;

/// `{name}_create() -> instance`; may return null.
pub type CreateFn = unsafe extern "C" fn() -> *mut c_void;
/// `{name}_init(instance, context, param) -> int`; zero means failure.
pub type InitFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *const c_char) -> c_int;
/// `{name}_free(instance)`; optional.
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
/// `{name}_signal(instance, sig)`; optional.
pub type SignalFn = unsafe extern "C" fn(*mut c_void, c_int);

/// A loaded service class.
///
/// Holds the mapped library for the process lifetime (modules are never
/// unloaded), which is what makes caching the raw entry points sound.
pub struct Module {
    name: String,
    _library: Library,
    create: Option<CreateFn>,
    init: InitFn,
    free: Option<FreeFn>,
    signal: Option<SignalFn>,
}

impl Module {
    /// The service-class name this module was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a raw instance; null when the module has no `create`.
    pub fn instance_create(&self) -> *mut c_void {
        match self.create {
            // SAFETY: entry point resolved from the live library; the
            // contract takes no arguments.
            Some(create) => unsafe { create() },
            None => std::ptr::null_mut(),
        }
    }

    /// Initializes an instance; `true` on success.
    ///
    /// # Safety
    ///
    /// `instance` must come from this module's `instance_create` (or be
    /// null if the module tolerates it); `param` must be a valid
    /// NUL-terminated string or null; `context` is passed through opaquely.
    pub unsafe fn instance_init(
        &self,
        instance: *mut c_void,
        context: *mut c_void,
        param: *const c_char,
    ) -> bool {
        (self.init)(instance, context, param) != 0
    }

    /// Releases an instance (no-op when the module has no `free`).
    ///
    /// # Safety
    ///
    /// `instance` must come from this module and not be used afterwards.
    pub unsafe fn instance_free(&self, instance: *mut c_void) {
        if let Some(free) = self.free {
            free(instance);
        }
    }

    /// Delivers an out-of-band signal (no-op when absent).
    ///
    /// # Safety
    ///
    /// `instance` must be a live instance of this module.
    pub unsafe fn instance_signal(&self, instance: *mut c_void, sig: c_int) {
        if let Some(signal) = self.signal {
            signal(instance, sig);
        }
    }
}

/// name → loaded module table behind the writer-preferring rwlock.
///
/// Lookups take the read lock for a linear scan; a miss upgrades to the
/// write lock, double-checks, and walks the search path.
pub struct ModuleRegistry {
    /// `;`-separated template, each segment containing a `?` that the
    /// module name substitutes, e.g. `./?.so;./?/init.so`.
    path: String,
    table: RwLock<Vec<Arc<Module>>>,
}

impl ModuleRegistry {
    /// Creates a registry over the given search path template.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: RwLock::new(Vec::new()),
        }
    }

    /// The search path template.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Looks a module up, loading it on first use.
    pub fn query(&self, name: &str) -> Result<Arc<Module>, ModuleError> {
        {
            let table = self.table.read();
            if let Some(module) = table.iter().find(|m| m.name == name) {
                return Ok(Arc::clone(module));
            }
        }
        let mut table = self.table.write();
        // Double-check: another thread may have loaded it between locks.
        if let Some(module) = table.iter().find(|m| m.name == name) {
            return Ok(Arc::clone(module));
        }
        if table.len() >= MAX_MODULES {
            return Err(ModuleError::TableFull { max: MAX_MODULES });
        }
        let module = Arc::new(self.try_open(name)?);
        table.push(Arc::clone(&module));
        Ok(module)
    }

    /// Walks the path template; the first candidate that opens and exports
    /// an init entry wins.
    fn try_open(&self, name: &str) -> Result<Module, ModuleError> {
        let mut tried = 0;
        for segment in self.path.split(';').filter(|s| !s.is_empty()) {
            if !segment.contains('?') {
                warn!(segment, "module path segment has no `?` placeholder");
                continue;
            }
            let candidate = segment.replace('?', name);
            tried += 1;
            // SAFETY: loading a shared object runs its constructors; the
            // search path is operator-controlled configuration.
            match unsafe { Library::new(&candidate) } {
                Ok(library) => return Self::load_symbols(name, library),
                Err(err) => {
                    debug!(%candidate, %err, "module candidate failed to open");
                }
            }
        }
        Err(ModuleError::NotFound {
            name: name.to_owned(),
            tried,
        })
    }

    fn load_symbols(name: &str, library: Library) -> Result<Module, ModuleError> {
        // SAFETY: the symbol types match the documented module contract;
        // the copied fn pointers never outlive `library`, which the Module
        // keeps mapped until process exit.
        unsafe {
            let create = library
                .get::<CreateFn>(symbol_name(name, "_create").as_slice())
                .ok()
                .map(|s| *s);
            let init = library
                .get::<InitFn>(symbol_name(name, "_init").as_slice())
                .ok()
                .map(|s| *s);
            let free = library
                .get::<FreeFn>(symbol_name(name, "_free").as_slice())
                .ok()
                .map(|s| *s);
            let signal = library
                .get::<SignalFn>(symbol_name(name, "_signal").as_slice())
                .ok()
                .map(|s| *s);
            let Some(init) = init else {
                return Err(ModuleError::InitMissing(name.to_owned()));
            };
            Ok(Module {
                name: name.to_owned(),
                _library: library,
                create,
                init,
                free,
                signal,
            })
        }
    }
}

/// Builds `{name}{suffix}\0` for `dlsym`.
fn symbol_name(name: &str, suffix: &str) -> Vec<u8> {
    let mut sym = Vec::with_capacity(name.len() + suffix.len() + 1);
    sym.extend_from_slice(name.as_bytes());
    sym.extend_from_slice(suffix.as_bytes());
    sym.push(0);
    sym
}
