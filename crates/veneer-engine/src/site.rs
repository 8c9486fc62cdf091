//! Call sites: foreign functions bound behind a dispatch strategy.
//!
//! [`Linker::bind`] never fails. A descriptor, symbol or lowering
//! problem produces a stub site that returns the stored error from every
//! call, so one bad binding cannot poison a batch of good ones.
//!
//! Dispatch is chosen at bind time. Under [`Strategy::Auto`] a site
//! whose promises include [`Promises::NO_MANAGED_RETURN`] gets a
//! compiled trampoline when the host has a backend, and falls back to
//! the VM when compilation fails; everything else drives calls through
//! the VM. Both paths consume the same call program and frame, so their
//! results are interchangeable.

use std::ffi::CStr;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use veneer_types::{descriptor, Kind, Promises, Ty};

use crate::abi::{self, ClassifiedSignature, Convention};
use crate::callback::{self, CallbackRef};
use crate::error::{BindError, CallError};
use crate::frame::{CallFrame, Code};
use crate::jit::backend::CodegenError;
use crate::jit::program::{self, FailureHook, InferSource, Instr, Program, Relation};
use crate::jit::Trampoline;
use crate::loader::Library;
use crate::pin::{PinData, PinScope};
use crate::value::Value;
use crate::vm;

/// Callbacks one call site may have registered at a time.
pub const MAX_SITE_CALLBACKS: usize = 255;

/// How a site dispatches its calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Trampoline when promises and the host allow it, VM otherwise.
    #[default]
    Auto,
    /// Trampoline or a bind error; no silent fallback.
    JitOnly,
    /// Always the VM path.
    VmOnly,
}

#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub strategy: Strategy,
}

/// Binds call sites against one opened library.
#[derive(Debug)]
pub struct Linker {
    library: Arc<Library>,
    options: LinkOptions,
}

impl Linker {
    /// Opens the first available candidate of `spec`.
    pub fn open(spec: &str) -> Result<Linker, BindError> {
        Linker::with_options(spec, LinkOptions::default())
    }

    pub fn with_options(spec: &str, options: LinkOptions) -> Result<Linker, BindError> {
        Ok(Linker {
            library: Arc::new(Library::open(spec)?),
            options,
        })
    }

    /// Binds against the calling process itself.
    pub fn this() -> Result<Linker, BindError> {
        Ok(Linker {
            library: Arc::new(Library::this()?),
            options: LinkOptions::default(),
        })
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Binds `source` to a call site. The descriptor's own symbol, when
    /// present, overrides `name`. Failures produce a stub site.
    pub fn bind(&self, name: &str, source: &str, promises: Promises) -> CallSite {
        let bound = parse_and_classify(source).and_then(|classified| {
            let symbol = classified
                .sig
                .symbol
                .clone()
                .unwrap_or_else(|| name.to_string());
            let target = self.library.symbol(&symbol)?;
            let hook = resolve_hook(&self.library, &classified)?;
            finish_bind(
                classified,
                symbol,
                target,
                hook,
                promises,
                self.options.strategy,
            )
        });
        CallSite::from_result(name, promises, bound)
    }
}

fn parse_and_classify(source: &str) -> Result<ClassifiedSignature, BindError> {
    let sig = descriptor::parse(source)?;
    Ok(abi::classify(&sig)?)
}

fn resolve_hook(
    library: &Library,
    classified: &ClassifiedSignature,
) -> Result<Option<FailureHook>, BindError> {
    match &classified.sig.on_failure {
        Some(clause) => Ok(Some(FailureHook {
            symbol: clause.symbol.clone(),
            target: library.symbol(&clause.symbol)?,
            args: clause.args.clone(),
        })),
        None => Ok(None),
    }
}

fn finish_bind(
    classified: ClassifiedSignature,
    symbol: String,
    target: usize,
    hook: Option<FailureHook>,
    promises: Promises,
    strategy: Strategy,
) -> Result<ReadySite, BindError> {
    let program = program::build(&classified, target, Convention::host(), hook);
    let dispatch = select_dispatch(&program, promises, strategy)?;
    Ok(ReadySite {
        classified,
        symbol,
        program,
        dispatch,
    })
}

fn select_dispatch(
    program: &Program,
    promises: Promises,
    strategy: Strategy,
) -> Result<Dispatch, BindError> {
    let jit_allowed = promises.contains(Promises::NO_MANAGED_RETURN);
    match strategy {
        Strategy::VmOnly => vm_dispatch(program, None),
        Strategy::JitOnly => {
            if !jit_allowed {
                return Err(BindError::Codegen(CodegenError::Backend(
                    "trampoline dispatch requires the no-managed-return promise".into(),
                )));
            }
            Ok(Dispatch::Jit(Trampoline::compile(program)?))
        }
        Strategy::Auto => {
            if jit_allowed {
                match Trampoline::compile(program) {
                    Ok(trampoline) => return Ok(Dispatch::Jit(trampoline)),
                    Err(original) => return vm_dispatch(program, Some(original)),
                }
            }
            vm_dispatch(program, None)
        }
    }
}

fn vm_dispatch(program: &Program, original: Option<CodegenError>) -> Result<Dispatch, BindError> {
    if program.vm_ok {
        Ok(Dispatch::Vm)
    } else {
        // The VM cannot marshal this signature either; the first error
        // stands.
        Err(BindError::Codegen(
            original.unwrap_or(CodegenError::NonValueArgument),
        ))
    }
}

enum Dispatch {
    Jit(Trampoline),
    Vm,
}

struct ReadySite {
    classified: ClassifiedSignature,
    symbol: String,
    program: Program,
    dispatch: Dispatch,
}

enum SiteKind {
    Ready(Box<ReadySite>),
    Stub(BindError),
}

/// A bound foreign function.
pub struct CallSite {
    name: String,
    promises: Promises,
    inner: SiteKind,
    registered: Mutex<Vec<CallbackRef>>,
}

impl CallSite {
    /// Binds a descriptor directly to a code address, without a library.
    /// The address is trusted to match the descriptor.
    pub fn for_address(target: usize, name: &str, source: &str, promises: Promises) -> CallSite {
        CallSite::for_address_with(target, name, source, promises, LinkOptions::default())
    }

    pub fn for_address_with(
        target: usize,
        name: &str,
        source: &str,
        promises: Promises,
        options: LinkOptions,
    ) -> CallSite {
        let bound = parse_and_classify(source).and_then(|classified| {
            if classified.sig.on_failure.is_some() {
                return Err(BindError::UnsupportedType(
                    "on-failure hook requires a library binding".into(),
                ));
            }
            let symbol = classified
                .sig
                .symbol
                .clone()
                .unwrap_or_else(|| name.to_string());
            finish_bind(classified, symbol, target, None, promises, options.strategy)
        });
        CallSite::from_result(name, promises, bound)
    }

    fn from_result(
        name: &str,
        promises: Promises,
        bound: Result<ReadySite, BindError>,
    ) -> CallSite {
        let inner = match bound {
            Ok(ready) => SiteKind::Ready(Box::new(ready)),
            Err(err) => SiteKind::Stub(err),
        };
        CallSite {
            name: name.to_string(),
            promises,
            inner,
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn promises(&self) -> Promises {
        self.promises
    }

    /// The bind error of a stub site.
    pub fn bind_error(&self) -> Option<&BindError> {
        match &self.inner {
            SiteKind::Stub(err) => Some(err),
            SiteKind::Ready(_) => None,
        }
    }

    /// `"jit"`, `"vm"` or `"stub"`.
    pub fn dispatch_kind(&self) -> &'static str {
        match &self.inner {
            SiteKind::Ready(site) => match site.dispatch {
                Dispatch::Jit(_) => "jit",
                Dispatch::Vm => "vm",
            },
            SiteKind::Stub(_) => "stub",
        }
    }

    /// Opaque signature string (`"pZ)i"` style) of a bound site.
    pub fn code_string(&self) -> Option<String> {
        match &self.inner {
            SiteKind::Ready(site) => Some(site.classified.sig.code_string()),
            SiteKind::Stub(_) => None,
        }
    }

    /// Registers a managed handler under this site's callback argument.
    pub fn register_callback<F>(&self, handler: F) -> Result<CallbackRef, BindError>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let site = match &self.inner {
            SiteKind::Ready(site) => site,
            SiteKind::Stub(err) => return Err(err.clone()),
        };
        let nested = site
            .classified
            .sig
            .args
            .iter()
            .find_map(|ty| ty.func.as_deref())
            .ok_or_else(|| {
                BindError::UnsupportedType("signature has no callback argument".into())
            })?;

        let mut registered = self.registered.lock();
        if registered.len() >= MAX_SITE_CALLBACKS {
            return Err(BindError::TooManyCallbacks {
                max: MAX_SITE_CALLBACKS,
            });
        }
        let cb = callback::register(nested, Arc::new(handler))?;
        registered.push(cb);
        Ok(cb)
    }

    /// Frees a callback registered on this site.
    pub fn free_callback(&self, cb: CallbackRef) -> bool {
        let mut registered = self.registered.lock();
        match registered.iter().position(|&r| r == cb) {
            Some(pos) => {
                registered.swap_remove(pos);
                drop(registered);
                callback::free(cb)
            }
            None => false,
        }
    }

    /// Callbacks currently registered on this site.
    pub fn registered_callbacks(&self) -> usize {
        self.registered.lock().len()
    }

    /// Invokes the bound function. `args` are the managed arguments in
    /// declaration order, elided arguments omitted; mutable string and
    /// buffer arguments are updated in place after the call.
    pub fn call(&self, args: &mut [Value]) -> Result<Value, CallError> {
        let site = match &self.inner {
            SiteKind::Ready(site) => site,
            SiteKind::Stub(err) => return Err(CallError::Bind(err.clone())),
        };
        let sig = &site.classified.sig;
        let expected = sig.managed_arity();
        if args.len() != expected {
            return Err(CallError::ArityMismatch {
                expected,
                got: args.len(),
            });
        }
        if site.program.target == 0 {
            return Err(CallError::NullFunction);
        }

        let program = &site.program;
        let mut frame = CallFrame::new(sig.args.len());
        for (slot, &code) in program.codes.iter().enumerate() {
            frame.set_code(slot, code);
        }

        // Managed argument index for each foreign slot; elided slots have
        // no managed counterpart.
        let mut managed_of_slot: Vec<Option<usize>> = vec![None; sig.args.len() + 1];
        let mut next = 0;
        for (i, ty) in sig.args.iter().enumerate() {
            if !ty.elided {
                managed_of_slot[i + 1] = Some(next);
                next += 1;
            }
        }

        let mut scope = PinScope::new();
        let mut write_backs: Vec<(usize, usize)> = Vec::new();

        // Plain value slots first; the program's preparation steps then
        // overwrite the slots that need materialization.
        for (i, ty) in sig.args.iter().enumerate() {
            let slot = i + 1;
            let Some(m) = managed_of_slot[slot] else {
                continue;
            };
            if ty.is_cstring() || ty.func.is_some() || ty.kind == Kind::Callback {
                continue;
            }
            fill_slot(&mut frame, slot, ty, &mut args[m])?;
        }

        for instr in &program.instrs {
            match *instr {
                Instr::CString { slot, write_back } => {
                    // Materialized slots are never elided.
                    let Some(m) = managed_of_slot[slot] else {
                        continue;
                    };
                    let addr = materialize_cstring(&mut frame, slot, &args[m], &mut scope)?;
                    if write_back {
                        write_backs.push((m, addr));
                    }
                }
                Instr::Closure { slot } => {
                    let Some(m) = managed_of_slot[slot] else {
                        continue;
                    };
                    let addr = match &args[m] {
                        Value::Callback(cb) => callback::code_ptr(*cb)?,
                        Value::Ptr(p) => *p as usize,
                        other => {
                            return Err(CallError::TypeMismatch {
                                index: slot,
                                expected: "callback",
                                got: other.kind_name(),
                            })
                        }
                    };
                    frame.set_ptr(slot, addr);
                }
                Instr::Infer { slot, from, source } => {
                    let value = managed_of_slot
                        .get(from)
                        .copied()
                        .flatten()
                        .map(|m| &args[m])
                        .ok_or(CallError::CannotInfer { index: slot, from })?;
                    let inferred = infer_value(value, source)
                        .ok_or(CallError::CannotInfer { index: slot, from })?;
                    frame.set_u64(slot, inferred);
                }
                Instr::Call => break,
                // Machine-path steps.
                Instr::Reserve { .. } | Instr::Move { .. } | Instr::Spread { .. } => {}
                Instr::Check { .. } => {}
            }
        }

        let forbid = ForbidCallbacks::engage(self.promises.contains(Promises::NO_CALLBACKS));

        let raw = match &site.dispatch {
            Dispatch::Jit(trampoline) => unsafe { trampoline.invoke(frame.args_ptr()) },
            Dispatch::Vm => vm::with_vm(|vm| {
                for slot in 1..program.codes.len() {
                    vm.push(frame.code(slot), frame.bits(slot));
                }
                unsafe { vm.call(program.target, program.codes[0]) }
            }),
        };
        drop(forbid);

        let raw = program.ret.normalize(raw);
        frame.set_bits(0, raw);

        // Post-call steps: return checks, then write-backs.
        for instr in &program.instrs {
            if let Instr::Check {
                relation,
                rhs,
                invert,
            } = *instr
            {
                let ret = raw as i64;
                let expected = frame.bits(rhs) as i64;
                let mut ok = match relation {
                    Relation::Equals => ret == expected,
                    Relation::Less => ret < expected,
                    Relation::More => ret > expected,
                };
                if invert {
                    ok = !ok;
                }
                if !ok {
                    let code = match &program.hook {
                        Some(hook) => run_hook(hook, &frame),
                        None => ret,
                    };
                    return Err(CallError::Native {
                        symbol: site.symbol.clone(),
                        code,
                    });
                }
            }
        }

        for (m, addr) in write_backs {
            let rewritten =
                unsafe { CStr::from_ptr(addr as *const std::ffi::c_char) };
            args[m] = Value::Str(rewritten.to_string_lossy().into_owned());
        }
        drop(scope);

        Ok(ret_value(sig.ret.as_ref(), program.inverted, raw))
    }
}

// ====== Frame construction ======

fn type_mismatch(slot: usize, expected: &'static str, got: &Value) -> CallError {
    CallError::TypeMismatch {
        index: slot,
        expected,
        got: got.kind_name(),
    }
}

fn fill_slot(
    frame: &mut CallFrame,
    slot: usize,
    ty: &Ty,
    value: &mut Value,
) -> Result<(), CallError> {
    // Word-sized aggregates travel by value, packed little-endian.
    if matches!(ty.kind, Kind::Aggregate { .. }) && !ty.is_pointer_class() {
        let Value::Bytes(bytes) = value else {
            return Err(type_mismatch(slot, "bytes", value));
        };
        let mut word = [0u8; 8];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);
        frame.set_bits(slot, u64::from_le_bytes(word));
        return Ok(());
    }

    match frame.code(slot) {
        Code::Byte1 | Code::Byte2 | Code::Byte4 | Code::Byte8 => {
            let v = value
                .as_i64()
                .ok_or_else(|| type_mismatch(slot, "integer", value))?;
            frame.set_i64(slot, v);
        }
        Code::Float4 => {
            let v = value
                .as_f64()
                .ok_or_else(|| type_mismatch(slot, "float", value))?;
            frame.set_f32(slot, v as f32);
        }
        Code::Float8 => {
            let v = value
                .as_f64()
                .ok_or_else(|| type_mismatch(slot, "double", value))?;
            frame.set_f64(slot, v);
        }
        Code::Pointer => match value {
            Value::Ptr(p) => frame.set_ptr(slot, *p as usize),
            Value::Bytes(bytes) => frame.set_ptr(slot, bytes.as_mut_ptr() as usize),
            other => return Err(type_mismatch(slot, "pointer", other)),
        },
        Code::Repeats | Code::Offsets => match value {
            Value::Bytes(bytes) => frame.set_ptr(slot, bytes.as_mut_ptr() as usize),
            Value::Ptr(p) => frame.set_ptr(slot, *p as usize),
            other => return Err(type_mismatch(slot, "bytes", other)),
        },
        Code::Ignored => {}
    }
    Ok(())
}

fn materialize_cstring(
    frame: &mut CallFrame,
    slot: usize,
    value: &Value,
    scope: &mut PinScope,
) -> Result<usize, CallError> {
    let text = match value {
        Value::Str(text) => text.as_str(),
        Value::Ptr(p) => {
            // A raw pointer is accepted as a pre-made C string.
            frame.set_ptr(slot, *p as usize);
            return Ok(*p as usize);
        }
        other => return Err(type_mismatch(slot, "string", other)),
    };
    let c = std::ffi::CString::new(text).map_err(|_| CallError::InteriorNul { index: slot })?;
    let addr = scope.pin(PinData::CString(c));
    frame.set_ptr(slot, addr);
    Ok(addr)
}

fn infer_value(value: &Value, source: InferSource) -> Option<u64> {
    match (source, value) {
        (InferSource::Capacity, Value::Bytes(bytes)) => Some(bytes.capacity() as u64),
        (InferSource::Capacity, Value::Str(text)) => Some(text.len() as u64),
        (InferSource::Length, Value::Bytes(bytes)) => Some(bytes.len() as u64),
        (InferSource::Length, Value::Str(text)) => Some(text.len() as u64),
        _ => None,
    }
}

fn run_hook(hook: &FailureHook, frame: &CallFrame) -> i64 {
    vm::with_vm(|vm| {
        for &arg in &hook.args {
            let slot = arg as usize;
            vm.push(frame.code(slot), frame.bits(slot));
        }
        // Hooks follow the errno convention: a C int result.
        let raw = unsafe { vm.call(hook.target, Code::Byte4) };
        raw as u32 as i32 as i64
    })
}

fn ret_value(ret: Option<&Ty>, inverted: bool, raw: u64) -> Value {
    if inverted {
        return Value::Bool(raw == 0);
    }
    let Some(ty) = ret else {
        return Value::Void;
    };
    if ty.func.is_some() || ty.is_pointer_class() {
        return Value::Ptr(raw as usize as *mut std::ffi::c_void);
    }
    match ty.kind {
        Kind::Void => Value::Void,
        Kind::Bool => Value::Bool(raw != 0),
        Kind::Char | Kind::I8 => Value::I8(raw as i8),
        Kind::I16 => Value::I16(raw as i16),
        Kind::I32 => Value::I32(raw as i32),
        Kind::I64 => Value::I64(raw as i64),
        Kind::U8 => Value::U8(raw as u8),
        Kind::U16 => Value::U16(raw as u16),
        Kind::U32 => Value::U32(raw as u32),
        Kind::U64 => Value::U64(raw),
        Kind::F32 => Value::F32(f32::from_bits(raw as u32)),
        Kind::F64 => Value::F64(f64::from_bits(raw)),
        Kind::Aggregate { .. } => Value::U64(raw),
        Kind::Callback | Kind::Variadic => Value::Ptr(raw as usize as *mut std::ffi::c_void),
    }
}

// ====== No-callback promise enforcement ======

static NO_CALLBACK_THREADS: Lazy<Mutex<FxHashMap<ThreadId, u32>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Called by the callback shim on entry from foreign code. Panics when
/// the current thread is inside a call that promised no callbacks;
/// the panic aborts at the foreign boundary, which is the point: the
/// promise was a lie and the engine may already have skipped the
/// bookkeeping reentrancy needs.
pub(crate) fn note_callback_entry() {
    let forbidden = NO_CALLBACK_THREADS
        .lock()
        .get(&thread::current().id())
        .copied()
        .unwrap_or(0);
    if forbidden > 0 {
        panic!("callback invoked during a call that promised no callbacks");
    }
}

struct ForbidCallbacks {
    active: bool,
}

impl ForbidCallbacks {
    fn engage(active: bool) -> ForbidCallbacks {
        if active {
            *NO_CALLBACK_THREADS
                .lock()
                .entry(thread::current().id())
                .or_insert(0) += 1;
        }
        ForbidCallbacks { active }
    }
}

impl Drop for ForbidCallbacks {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let mut threads = NO_CALLBACK_THREADS.lock();
        let id = thread::current().id();
        if let Some(depth) = threads.get_mut(&id) {
            *depth -= 1;
            if *depth == 0 {
                threads.remove(&id);
            }
        }
    }
}
