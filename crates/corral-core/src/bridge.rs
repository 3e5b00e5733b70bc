use core::{
    cell::{Cell, RefCell},
    ptr::NonNull,
};
use std::rc::{Rc, Weak};

use rquickjs::{
    Array, ArrayBuffer, Ctx, Exception, Function, IntoJs, Object, Persistent, TypedArray, Value,
    context::EvalOptions,
    convert::Coerced,
    function::{Opt, Rest},
};

use crate::{
    buffer::{BufferTable, PinnedBuf},
    error::Error,
    exception::ExceptionInfo,
    host::{Host, Message, PrintLevel, UserData},
    pending::PendingTable,
};

/// Name of the global object carrying the host primitives.
pub const GLOBAL: &str = "corral";

pub(crate) const TRACE_TARGET_BRIDGE: &str = "corral::bridge";

pub(crate) struct Resolvers {
    pub(crate) resolve: Persistent<Function<'static>>,
    pub(crate) reject: Persistent<Function<'static>>,
}

struct Rejection {
    promise: Persistent<Value<'static>>,
    info: ExceptionInfo,
}

/// State reachable from both the isolate and the functions it installs in
/// guest code. Guest functions only hold a [`Weak`] to it so that engine
/// values never keep it alive.
pub(crate) struct Shared {
    pub(crate) user_data: Cell<UserData>,
    host: RefCell<Box<dyn Host>>,
    pub(crate) buffers: RefCell<BufferTable<Persistent<TypedArray<'static, u8>>>>,
    pub(crate) pending: RefCell<PendingTable<Resolvers>>,
    pub(crate) recv: RefCell<Option<Persistent<Function<'static>>>>,
    pub(crate) last_exception: RefCell<Option<String>>,
    rejections: RefCell<Vec<Rejection>>,
}

impl Shared {
    pub(crate) fn new(host: Box<dyn Host>) -> Self {
        Self {
            user_data: Cell::new(UserData::NONE),
            host: RefCell::new(host),
            buffers: RefCell::new(BufferTable::new()),
            pending: RefCell::new(PendingTable::new()),
            recv: RefCell::new(None),
            last_exception: RefCell::new(None),
            rejections: RefCell::new(Vec::new()),
        }
    }

    fn print(&self, level: PrintLevel, message: &str) {
        match self.host.try_borrow_mut() {
            Ok(mut host) => host.print(level, message),
            Err(_) => tracing::warn!(target: TRACE_TARGET_BRIDGE, ?level, "{message}"),
        }
    }

    /// Store `info` in the last-exception slot, replacing what was there.
    pub(crate) fn record(&self, info: &ExceptionInfo) {
        tracing::warn!(exception = %info, "uncaught guest exception");
        *self.last_exception.borrow_mut() = Some(info.to_json());
    }

    /// Turn an engine error into a crate error. A thrown guest value is
    /// taken out of the context and recorded as the last exception.
    pub(crate) fn capture(&self, ctx: &Ctx<'_>, err: rquickjs::Error) -> Error {
        match err {
            rquickjs::Error::Exception => {
                let info = ExceptionInfo::catch(ctx);
                self.record(&info);
                Error::Guest(Box::new(info))
            }
            other => Error::Engine(other),
        }
    }

    pub(crate) fn track_rejection<'js>(
        &self,
        ctx: &Ctx<'js>,
        promise: &Value<'js>,
        reason: &Value<'js>,
        handled: bool,
    ) {
        if handled {
            self.untrack(ctx, promise);
        } else {
            self.rejections.borrow_mut().push(Rejection {
                promise: Persistent::save(ctx, promise.clone()),
                info: ExceptionInfo::from_value(ctx, reason),
            });
        }
    }

    /// Stop tracking `promise`; its rejection is being reported another way.
    pub(crate) fn untrack<'js>(&self, ctx: &Ctx<'js>, promise: &Value<'js>) {
        self.rejections.borrow_mut().retain(|rejection| {
            rejection
                .promise
                .clone()
                .restore(ctx)
                .map_or(true, |tracked: Value<'js>| &tracked != promise)
        });
    }

    pub(crate) fn discard_rejections(&self) {
        for rejection in self.rejections.borrow_mut().drain(..) {
            tracing::warn!(exception = %rejection.info, "unhandled promise rejection dropped");
        }
    }

    /// Promote the oldest rejection still unhandled to the last exception.
    pub(crate) fn promote_rejections(&self) -> Option<Error> {
        let rejections: Vec<Rejection> = self.rejections.borrow_mut().drain(..).collect();
        let mut rejections = rejections.into_iter();
        let oldest = rejections.next()?;
        for later in rejections {
            tracing::warn!(exception = %later.info, "unhandled promise rejection dropped");
        }
        self.record(&oldest.info);
        Some(Error::Guest(Box::new(oldest.info)))
    }

    /// Release every persistent reference held for guest code.
    pub(crate) fn release(&self) {
        let abandoned = self.pending.borrow_mut().abandon();
        let buffers = self.buffers.borrow_mut().clear();
        self.recv.borrow_mut().take();
        self.rejections.borrow_mut().clear();
        tracing::debug!(abandoned, buffers, "bridge state released");
    }
}

fn upgrade(ctx: &Ctx<'_>, shared: &Weak<Shared>) -> rquickjs::Result<Rc<Shared>> {
    shared
        .upgrade()
        .ok_or_else(|| Exception::throw_message(ctx, "isolate is shutting down"))
}

/// Install the `corral` global and `console`. The shared buffer, if any, is
/// moved into the engine and exposed as `corral.shared`.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    shared: &Rc<Shared>,
    shared_buf: Option<Vec<u8>>,
) -> rquickjs::Result<Option<Persistent<ArrayBuffer<'static>>>> {
    let corral = Object::new(ctx.clone())?;

    let weak = Rc::downgrade(shared);
    corral.set(
        "print",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, message: Coerced<String>, is_err: Opt<bool>| {
                let level = if is_err.0.unwrap_or(false) {
                    PrintLevel::Error
                } else {
                    PrintLevel::Info
                };
                upgrade(&ctx, &weak)?.print(level, &message.0);
                rquickjs::Result::Ok(())
            },
        )?,
    )?;

    let weak = Rc::downgrade(shared);
    corral.set(
        "send",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, control: TypedArray<'js, u8>, zero_copy: Opt<TypedArray<'js, u8>>| {
                let shared = upgrade(&ctx, &weak)?;
                send(&ctx, shared.as_ref(), &control, zero_copy.0)
            },
        )?,
    )?;

    let weak = Rc::downgrade(shared);
    corral.set(
        "recv",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, callback: Function<'js>| {
            let shared = upgrade(&ctx, &weak)?;
            let mut recv = shared.recv.borrow_mut();
            if recv.is_some() {
                return Err(Exception::throw_type(&ctx, "corral.recv already called"));
            }
            *recv = Some(Persistent::save(&ctx, callback));
            Ok(())
        })?,
    )?;

    let weak = Rc::downgrade(shared);
    corral.set(
        "pending",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: u32| {
            let shared = upgrade(&ctx, &weak)?;
            let (promise, resolve, reject) = ctx.promise()?;
            let resolvers = Resolvers {
                resolve: Persistent::save(&ctx, resolve),
                reject: Persistent::save(&ctx, reject),
            };
            if shared.pending.borrow_mut().register(id, resolvers).is_err() {
                return Err(Exception::throw_range(
                    &ctx,
                    &format!("operation {id} is already pending"),
                ));
            }
            Ok(promise)
        })?,
    )?;

    corral.set(
        "evalContext",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, code: String| {
            eval_context(&ctx, code)
        })?,
    )?;

    corral.set(
        "errorToJSON",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, error: Value<'js>| {
            let json = ExceptionInfo::from_value(&ctx, &error).to_json();
            ctx.json_parse(json)
        })?,
    )?;

    let shared_ab = match shared_buf {
        Some(bytes) => {
            let buffer = ArrayBuffer::new(ctx.clone(), bytes)?;
            corral.set("shared", buffer.clone())?;
            Some(Persistent::save(ctx, buffer))
        }
        None => None,
    };

    ctx.globals().set(GLOBAL, corral)?;
    install_console(ctx, shared)?;
    Ok(shared_ab)
}

fn send<'js>(
    ctx: &Ctx<'js>,
    shared: &Shared,
    control: &TypedArray<'js, u8>,
    zero_copy: Option<TypedArray<'js, u8>>,
) -> rquickjs::Result<Option<TypedArray<'js, u8>>> {
    let control = control
        .as_bytes()
        .ok_or_else(|| Exception::throw_type(ctx, "control buffer is detached"))?;

    let zero_copy = match zero_copy {
        Some(view) => {
            let (ptr, len) = view_raw(ctx, &view)?;
            let id = shared
                .buffers
                .borrow_mut()
                .attach(Persistent::save(ctx, view))
                .ok_or_else(|| Exception::throw_range(ctx, "buffer id space exhausted"))?;
            Some(PinnedBuf::new(id, ptr, len))
        }
        None => None,
    };

    let user_data = shared.user_data.get();
    let response = {
        let Ok(mut host) = shared.host.try_borrow_mut() else {
            return Err(Exception::throw_message(ctx, "corral.send called re-entrantly"));
        };
        host.recv(user_data, Message { control, zero_copy })
    };

    response
        .map(|bytes| TypedArray::new(ctx.clone(), bytes))
        .transpose()
}

/// Pointer to the first byte of `view` in its backing store, and its length.
pub(crate) fn view_raw<'js>(
    ctx: &Ctx<'js>,
    view: &TypedArray<'js, u8>,
) -> rquickjs::Result<(NonNull<u8>, usize)> {
    let offset: usize = view.get("byteOffset")?;
    let raw = view
        .arraybuffer()?
        .as_raw()
        .ok_or_else(|| Exception::throw_type(ctx, "buffer is detached"))?;
    // SAFETY: a live view's byte offset lies within its backing store.
    let ptr = unsafe { raw.ptr.add(offset) };
    Ok((ptr, view.len()))
}

/// Evaluate `code` as a global script and report the outcome instead of
/// throwing: `[result, null]` or `[undefined, errorInfo]`.
fn eval_context<'js>(ctx: &Ctx<'js>, code: String) -> rquickjs::Result<Array<'js>> {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = false;

    let out = Array::new(ctx.clone())?;
    match ctx.eval_with_options::<Value<'js>, _>(code, options) {
        Ok(value) => {
            out.set(0, value)?;
            out.set(1, Value::new_null(ctx.clone()))?;
        }
        Err(rquickjs::Error::Exception) => {
            let thrown = ctx.catch();
            let info = ExceptionInfo::from_value(ctx, &thrown);
            let error = Object::new(ctx.clone())?;
            error.set("message", info.message)?;
            error.set("isNativeError", thrown.as_exception().is_some())?;
            error.set(
                "isCompileError",
                info.name.as_deref() == Some("SyntaxError"),
            )?;
            error.set("thrown", thrown)?;
            out.set(0, Value::new_undefined(ctx.clone()))?;
            out.set(1, error)?;
        }
        Err(other) => return Err(other),
    }
    Ok(out)
}

fn install_console<'js>(ctx: &Ctx<'js>, shared: &Rc<Shared>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for (method, level) in [
        ("log", PrintLevel::Info),
        ("info", PrintLevel::Info),
        ("debug", PrintLevel::Debug),
        ("warn", PrintLevel::Warn),
        ("error", PrintLevel::Error),
    ] {
        let weak = Rc::downgrade(shared);
        console.set(
            method,
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Coerced<String>>| {
                let message = args
                    .0
                    .into_iter()
                    .map(|arg| arg.0)
                    .collect::<Vec<_>>()
                    .join(" ");
                upgrade(&ctx, &weak)?.print(level, &message);
                rquickjs::Result::Ok(())
            })?,
        )?;
    }
    ctx.globals().set("console", console)
}

/// Wrap host bytes as a guest `Uint8Array`.
pub(crate) fn bytes_to_js<'js>(ctx: &Ctx<'js>, bytes: Vec<u8>) -> rquickjs::Result<Value<'js>> {
    TypedArray::<u8>::new(ctx.clone(), bytes)?.into_js(ctx)
}
