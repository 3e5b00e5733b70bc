use std::{
    cell::{RefCell, RefMut},
    ffi::{CStr, CString, c_char, c_void},
};

use corral_core::{
    BufferId, Completion, Host, Isolate, IsolateConfig, Message, ModuleId, NoopHost, PrintLevel,
    Resolution, StartupData, TerminationHandle, UserData,
};

use crate::error::{Error, ErrorCode, Result};

mod error;

macro_rules! c_try {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => return $crate::error::set_last_error(e.into()),
        }
    };
}

/// Borrowed byte range. A null `data` means "absent".
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Blob {
    pub data: *const u8,
    pub len: usize,
}

impl Blob {
    #[cfg(test)]
    const EMPTY: Self = Self {
        data: std::ptr::null(),
        len: 0,
    };

    fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// # Safety
    /// `data` must be null or point to `len` readable bytes.
    unsafe fn as_slice<'a>(self) -> Option<&'a [u8]> {
        if self.data.is_null() {
            None
        } else {
            Some(unsafe { std::slice::from_raw_parts(self.data, self.len) })
        }
    }
}

/// Byte buffer allocated by this library. Release it with `corral_blob_free`.
#[repr(C)]
pub struct OwnedBlob {
    pub data: *mut u8,
    pub len: usize,
}

impl From<Vec<u8>> for OwnedBlob {
    fn from(bytes: Vec<u8>) -> Self {
        let bytes = Box::into_raw(bytes.into_boxed_slice());
        Self {
            data: bytes.cast(),
            len: bytes.len(),
        }
    }
}

/// Zero-copy payload of a message. `id` is 0 when the message has none.
#[repr(C)]
pub struct ZeroCopy {
    pub id: u64,
    pub data: *mut u8,
    pub len: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl From<PrintLevel> for LogLevel {
    fn from(level: PrintLevel) -> Self {
        match level {
            PrintLevel::Debug => Self::Debug,
            PrintLevel::Info => Self::Info,
            PrintLevel::Warn => Self::Warn,
            PrintLevel::Error => Self::Error,
        }
    }
}

/// Reply slot for one `corral.send`, valid only inside the receive callback.
pub struct Responder {
    reply: Option<Vec<u8>>,
}

pub type RecvCallback =
    extern "C" fn(user_data: *mut c_void, control: Blob, zero_copy: ZeroCopy, responder: *mut Responder);

pub type PrintCallback = extern "C" fn(level: LogLevel, message: *const u8, len: usize);

/// Outcome of one resolve callback: either an existing module `id`, or the
/// `name` and `source` of a module to register. Strings are copied before the
/// callback's caller returns.
#[repr(C)]
pub struct Resolved {
    pub id: u32,
    pub name: *const c_char,
    pub source: *const c_char,
}

pub type ResolveCallback = extern "C" fn(
    ctx: *mut c_void,
    referrer: *const c_char,
    specifier: *const c_char,
    out: *mut Resolved,
) -> bool;

#[repr(C)]
pub struct IsolateOptions {
    pub snapshot: Blob,
    pub shared: Blob,
    pub will_snapshot: bool,
    /// Boot from the data installed with `corral_set_startup_data`, ignoring
    /// `snapshot`.
    pub from_startup_data: bool,
    pub recv: Option<RecvCallback>,
    pub print: Option<PrintCallback>,
}

struct CHost {
    recv: Option<RecvCallback>,
    print: Option<PrintCallback>,
}

impl Host for CHost {
    fn recv(&mut self, user_data: UserData, message: Message<'_>) -> Option<Vec<u8>> {
        let Some(recv) = self.recv else {
            return NoopHost.recv(user_data, message);
        };
        let zero_copy = message.zero_copy.map_or(
            ZeroCopy {
                id: 0,
                data: std::ptr::null_mut(),
                len: 0,
            },
            |buf| ZeroCopy {
                id: buf.id().get(),
                data: buf.as_ptr(),
                len: buf.len(),
            },
        );
        let mut responder = Responder { reply: None };
        recv(
            user_data.as_ptr(),
            Blob::from_slice(message.control),
            zero_copy,
            &raw mut responder,
        );
        responder.reply
    }

    fn print(&mut self, level: PrintLevel, message: &str) {
        match self.print {
            Some(print) => print(level.into(), message.as_ptr(), message.len()),
            None => NoopHost.print(level, message),
        }
    }
}

pub struct IsolateHandle {
    isolate: RefCell<Isolate>,
    terminate: TerminationHandle,
    /// Backing storage for the string most recently returned to the caller.
    scratch: RefCell<Option<CString>>,
}

impl IsolateHandle {
    fn new(options: Option<&IsolateOptions>) -> Result<Box<Self>> {
        let mut config = IsolateConfig::new();
        let mut from_startup_data = false;
        if let Some(options) = options {
            config = config
                .host(CHost {
                    recv: options.recv,
                    print: options.print,
                })
                .will_snapshot(options.will_snapshot);
            if let Some(snapshot) = unsafe { options.snapshot.as_slice() } {
                config = config.snapshot(snapshot.to_vec());
            }
            if let Some(shared) = unsafe { options.shared.as_slice() } {
                config = config.shared(shared.to_vec());
            }
            from_startup_data = options.from_startup_data;
        }

        let isolate = if from_startup_data {
            Isolate::from_startup_data(config)?
        } else {
            Isolate::new(config)?
        };
        Ok(Box::new(Self {
            terminate: isolate.termination_handle(),
            isolate: RefCell::new(isolate),
            scratch: RefCell::new(None),
        }))
    }

    /// Borrow the isolate. Reentering from one of its own callbacks is fatal.
    fn enter(&self) -> RefMut<'_, Isolate> {
        self.isolate.try_borrow_mut().unwrap_or_else(|_| {
            tracing::error!("isolate handle used from inside one of its own callbacks");
            std::process::abort()
        })
    }

    fn hand_out(&self, value: Option<&str>) -> *const c_char {
        let mut scratch = self.scratch.borrow_mut();
        *scratch = value.map(|value| {
            CString::new(value).unwrap_or_else(|_| c"<string contains a nul byte>".to_owned())
        });
        scratch.as_ref().map_or(std::ptr::null(), |value| value.as_ptr())
    }
}

/// # Safety
/// `ptr` must be null or a valid nul-terminated string.
unsafe fn c_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument(what));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| Error::InvalidArgument(what))
}

fn module_id(raw: u32) -> Result<ModuleId> {
    ModuleId::from_raw(raw).ok_or(Error::InvalidArgument("module id 0"))
}

/// Validate and install the process-wide natives and snapshot. Can succeed
/// once per process.
///
/// # Safety
/// Both blobs must point to readable memory of their stated length.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_set_startup_data(natives: Blob, snapshot: Blob) -> ErrorCode {
    let natives = c_try!(unsafe { natives.as_slice() }.ok_or(Error::InvalidArgument("natives")));
    let snapshot =
        c_try!(unsafe { snapshot.as_slice() }.ok_or(Error::InvalidArgument("snapshot")));
    let data = c_try!(StartupData::new(natives, snapshot));
    c_try!(corral_core::install_startup_data(data));
    ErrorCode::Ok
}

/// Create an isolate. `options` may be null.
///
/// # Safety
/// `options` must be null or valid, and `out_isolate` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_isolate_create(
    options: *const IsolateOptions,
    out_isolate: *mut Box<IsolateHandle>,
) -> ErrorCode {
    let handle = c_try!(IsolateHandle::new(unsafe { options.as_ref() }));
    unsafe { out_isolate.write(handle) };
    ErrorCode::Ok
}

#[unsafe(no_mangle)]
pub extern "C" fn corral_isolate_destroy(_isolate: Box<IsolateHandle>) {}

/// Run `source` as a classic script.
///
/// # Safety
/// `filename` and `source` must be valid nul-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_execute(
    isolate: &IsolateHandle,
    user_data: *mut c_void,
    filename: *const c_char,
    source: *const c_char,
) -> ErrorCode {
    let filename = c_try!(unsafe { c_str(filename, "filename") });
    let source = c_try!(unsafe { c_str(source, "source") });
    c_try!(
        isolate
            .enter()
            .execute(UserData::new(user_data), filename, source)
    );
    ErrorCode::Ok
}

/// Deliver bytes to the guest's receive callback.
///
/// # Safety
/// `data` must point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_dispatch(
    isolate: &IsolateHandle,
    user_data: *mut c_void,
    data: *const u8,
    len: usize,
) -> ErrorCode {
    let message = unsafe { Blob { data, len }.as_slice() }.unwrap_or_default();
    c_try!(isolate.enter().dispatch(UserData::new(user_data), message));
    ErrorCode::Ok
}

/// Set the return value of the `corral.send` being handled. A second call
/// replaces the first.
///
/// # Safety
/// `responder` must be the pointer passed to the running receive callback and
/// `data` must point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_respond(
    responder: *mut Responder,
    data: *const u8,
    len: usize,
) -> ErrorCode {
    let Some(responder) = (unsafe { responder.as_mut() }) else {
        return error::set_last_error(Error::InvalidArgument("responder"));
    };
    let reply = unsafe { Blob { data, len }.as_slice() }.unwrap_or_default();
    responder.reply = Some(reply.to_vec());
    ErrorCode::Ok
}

/// Settle the promise of pending operation `op`: resolve it with the bytes
/// when `ok`, otherwise reject it with the bytes as an error message.
/// `out_settled` (nullable) receives `false` if `op` was not pending.
///
/// # Safety
/// `data` must point to `len` readable bytes; `out_settled` must be null or
/// writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_complete(
    isolate: &IsolateHandle,
    user_data: *mut c_void,
    op: u32,
    ok: bool,
    data: *const u8,
    len: usize,
    out_settled: *mut bool,
) -> ErrorCode {
    let bytes = unsafe { Blob { data, len }.as_slice() }.unwrap_or_default();
    let completion = if ok {
        Completion::Ok(bytes.to_vec())
    } else {
        Completion::Err(String::from_utf8_lossy(bytes).into_owned())
    };
    let settled = c_try!(
        isolate
            .enter()
            .complete(UserData::new(user_data), op, completion)
    );
    if let Some(out) = unsafe { out_settled.as_mut() } {
        *out = settled;
    }
    ErrorCode::Ok
}

#[unsafe(no_mangle)]
pub extern "C" fn corral_run_microtasks(isolate: &IsolateHandle, user_data: *mut c_void) -> ErrorCode {
    c_try!(isolate.enter().run_microtasks(UserData::new(user_data)));
    ErrorCode::Ok
}

/// JSON of the last uncaught exception, or null. Valid until the next call
/// returning a string for this isolate.
#[unsafe(no_mangle)]
pub extern "C" fn corral_last_exception(isolate: &IsolateHandle) -> *const c_char {
    let exception = isolate.enter().last_exception();
    isolate.hand_out(exception.as_deref())
}

#[unsafe(no_mangle)]
pub extern "C" fn corral_clear_last_exception(isolate: &IsolateHandle) {
    isolate.enter().clear_last_exception();
}

/// Compile and register a module; its id is written to `out_id`.
///
/// # Safety
/// `name` and `source` must be valid nul-terminated strings; `out_id` must be
/// writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_mod_new(
    isolate: &IsolateHandle,
    main: bool,
    name: *const c_char,
    source: *const c_char,
    out_id: *mut u32,
) -> ErrorCode {
    let name = c_try!(unsafe { c_str(name, "name") });
    let source = c_try!(unsafe { c_str(source, "source") });
    let id = c_try!(isolate.enter().register_module(main, name, source));
    unsafe { out_id.write(id.get()) };
    ErrorCode::Ok
}

/// Number of import specifiers of module `id`; 0 for an unknown module.
#[unsafe(no_mangle)]
pub extern "C" fn corral_mod_imports_len(isolate: &IsolateHandle, id: u32) -> usize {
    let isolate = isolate.enter();
    module_id(id)
        .ok()
        .and_then(|id| isolate.module_imports(id).ok())
        .map_or(0, <[String]>::len)
}

/// Import specifier `index` of module `id`, or null. Valid until the next
/// call returning a string for this isolate.
#[unsafe(no_mangle)]
pub extern "C" fn corral_mod_imports_get(
    isolate: &IsolateHandle,
    id: u32,
    index: usize,
) -> *const c_char {
    let specifier = {
        let inner = isolate.enter();
        module_id(id)
            .ok()
            .and_then(|id| inner.module_imports(id).ok())
            .and_then(|imports| imports.get(index).cloned())
    };
    isolate.hand_out(specifier.as_deref())
}

/// Resolve every unresolved import through `resolve`. The callback must not
/// call back into this isolate.
#[unsafe(no_mangle)]
pub extern "C" fn corral_mod_resolve(
    isolate: &IsolateHandle,
    resolve: ResolveCallback,
    ctx: *mut c_void,
) -> ErrorCode {
    let mut resolver = |referrer: &str, specifier: &str| -> std::result::Result<Resolution, String> {
        let referrer = CString::new(referrer).map_err(|err| err.to_string())?;
        let specifier = CString::new(specifier).map_err(|err| err.to_string())?;
        let mut out = Resolved {
            id: 0,
            name: std::ptr::null(),
            source: std::ptr::null(),
        };
        if !resolve(ctx, referrer.as_ptr(), specifier.as_ptr(), &raw mut out) {
            return Err("rejected by resolve callback".to_owned());
        }
        if let Some(id) = ModuleId::from_raw(out.id) {
            return Ok(Resolution::Existing(id));
        }
        // SAFETY: the callback promises valid strings or null.
        let name = unsafe { c_str(out.name, "resolved name") }.map_err(|err| err.to_string())?;
        let source =
            unsafe { c_str(out.source, "resolved source") }.map_err(|err| err.to_string())?;
        Ok(Resolution::Register {
            name: name.to_owned(),
            source: source.to_owned(),
        })
    };
    c_try!(isolate.enter().resolve_imports(&mut resolver));
    ErrorCode::Ok
}

#[unsafe(no_mangle)]
pub extern "C" fn corral_mod_instantiate(isolate: &IsolateHandle, id: u32) -> ErrorCode {
    let id = c_try!(module_id(id));
    c_try!(isolate.enter().instantiate(id));
    ErrorCode::Ok
}

#[unsafe(no_mangle)]
pub extern "C" fn corral_mod_evaluate(
    isolate: &IsolateHandle,
    user_data: *mut c_void,
    id: u32,
) -> ErrorCode {
    let id = c_try!(module_id(id));
    c_try!(isolate.enter().evaluate(UserData::new(user_data), id));
    ErrorCode::Ok
}

#[unsafe(no_mangle)]
pub extern "C" fn corral_mod_clear(isolate: &IsolateHandle) {
    isolate.enter().clear_modules();
}

/// Release a zero-copy buffer. Returns `false` for an unknown id.
#[unsafe(no_mangle)]
pub extern "C" fn corral_buf_release(isolate: &IsolateHandle, id: u64) -> bool {
    BufferId::from_raw(id).is_some_and(|id| isolate.enter().detach_buffer(id))
}

/// Consume an isolate created with `will_snapshot` and write its snapshot
/// blob to `out_blob`. The isolate is destroyed even on failure.
///
/// # Safety
/// `out_blob` must be writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_snapshot_new(
    isolate: Box<IsolateHandle>,
    out_blob: *mut OwnedBlob,
) -> ErrorCode {
    let blob = c_try!(isolate.isolate.into_inner().snapshot());
    unsafe { out_blob.write(blob.into()) };
    ErrorCode::Ok
}

/// # Safety
/// `blob` must come from this library and not have been freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corral_blob_free(blob: OwnedBlob) {
    if !blob.data.is_null() {
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(blob.data, blob.len)) });
    }
}

/// Interrupt guest code running in `isolate`. Safe to call from any thread
/// while the isolate is alive.
#[unsafe(no_mangle)]
pub extern "C" fn corral_terminate(isolate: &IsolateHandle) {
    isolate.terminate.terminate();
}
