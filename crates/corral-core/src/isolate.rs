use core::{
    cell::Cell,
    mem::ManuallyDrop,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{rc::Rc, sync::Arc, thread};

use rquickjs::{
    ArrayBuffer, Context, Ctx, Exception, Module, Persistent, Promise, Runtime, TypedArray, Value,
    allocator::RustAllocator, context::EvalOptions,
};

use crate::{
    bridge::{self, Shared, TRACE_TARGET_BRIDGE},
    buffer::BufferId,
    config::IsolateConfig,
    error::{Error, Result},
    exception::ExceptionInfo,
    host::UserData,
    imports::{self, ModuleSyntax},
    module::{
        ModuleId, ModuleMap, ModuleResolver, ModuleState, Resolution, Unresolved,
        loader::{EngineModules, LinkResolver, ModuleLoader},
    },
    pending::{Completion, OpId},
    snapshot::{self, BlobKind, Image, SnapshotCreator},
};

/// Attaches an embedder pointer to an isolate for the duration of one call
/// into guest code.
///
/// Nesting is allowed only with the same pointer. The previous value is put
/// back when the scope ends, including when the call fails or unwinds.
pub struct UserDataScope<'a> {
    slot: &'a Cell<UserData>,
    prev: UserData,
    data: UserData,
}

impl<'a> UserDataScope<'a> {
    /// # Panics
    /// Panics if a different non-null pointer is already attached.
    pub fn new(slot: &'a Cell<UserData>, data: UserData) -> Self {
        let prev = slot.get();
        assert!(
            prev.is_none() || prev == data,
            "nested call into the isolate with a different user data pointer"
        );
        slot.set(data);
        Self { slot, prev, data }
    }
}

impl Drop for UserDataScope<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            assert_eq!(
                self.slot.get(),
                self.data,
                "user data changed while a scope was active"
            );
        }
        self.slot.set(self.prev);
    }
}

/// Interrupts guest code running in an isolate, from any thread.
#[derive(Debug, Clone, Default)]
pub struct TerminationHandle(Arc<AtomicBool>);

impl TerminationHandle {
    /// Guest code stops at the next interrupt check with an uncatchable
    /// error. The request is cleared when the isolate is entered again.
    pub fn terminate(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// A module evaluation suspended on top-level `await`.
struct Evaluation {
    root: ModuleId,
    order: Vec<ModuleId>,
    promise: Persistent<Promise<'static>>,
}

/// One engine context with its module registry, buffer table and pending
/// operations.
///
/// Every persistent engine handle is owned by exactly one table. `Drop`
/// releases the tables, then the context, then the runtime and allocator.
pub struct Isolate {
    shared: Rc<Shared>,
    engine: EngineModules,
    /// Registered modules with their source text.
    modules: ModuleMap<String>,
    evaluating: Vec<Evaluation>,
    shared_ab: Option<Persistent<ArrayBuffer<'static>>>,
    creator: Option<SnapshotCreator>,
    terminate: TerminationHandle,
    context: ManuallyDrop<Context>,
    runtime: ManuallyDrop<Runtime>,
}

impl Isolate {
    /// Create an isolate, optionally warm-started from `config.snapshot`.
    /// Built-in modules from installed startup data are registered too.
    ///
    /// # Errors
    /// Returns [`Error::Bootstrap`] if the snapshot is corrupt, was built for
    /// another engine, or its entry modules fail.
    pub fn new(config: IsolateConfig) -> Result<Self> {
        let snapshot = config
            .snapshot
            .as_deref()
            .map(|blob| Image::decode(BlobKind::Snapshot, blob))
            .transpose()?;
        let natives = snapshot::startup_data().map(|data| &data.natives);
        Self::build(config, natives, snapshot.as_ref())
    }

    /// Create an isolate from the process-wide startup data installed with
    /// [`snapshot::install_startup_data`].
    ///
    /// # Errors
    /// Returns [`Error::Bootstrap`] if no startup data is installed or it
    /// cannot be loaded.
    pub fn from_startup_data(config: IsolateConfig) -> Result<Self> {
        let data = snapshot::startup_data()
            .ok_or_else(|| Error::Bootstrap("no startup data installed".to_owned()))?;
        Self::build(config, Some(&data.natives), Some(&data.snapshot))
    }

    fn build(
        config: IsolateConfig,
        natives: Option<&Image>,
        snapshot: Option<&Image>,
    ) -> Result<Self> {
        let IsolateConfig {
            snapshot: _,
            shared: shared_buf,
            host,
            will_snapshot,
            max_stack_size,
            memory_limit,
            gc_threshold,
        } = config;

        let runtime = Runtime::new_with_alloc(RustAllocator)?;
        runtime.set_max_stack_size(max_stack_size);
        if let Some(limit) = memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(threshold) = gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let terminate = TerminationHandle::default();
        let interrupt = terminate.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.is_terminating())));

        let engine = EngineModules::default();
        runtime.set_loader(LinkResolver(engine.clone()), ModuleLoader(engine.clone()));

        let shared = Rc::new(Shared::new(host));
        let weak = Rc::downgrade(&shared);
        runtime.set_host_promise_rejection_tracker(Some(Box::new(
            move |ctx, promise, reason, handled| {
                if let Some(shared) = weak.upgrade() {
                    shared.track_rejection(&ctx, &promise, &reason, handled);
                }
            },
        )));

        let context = Context::full(&runtime)?;
        let shared_ab = context
            .with(|ctx| bridge::install(&ctx, &shared, shared_buf))
            .map_err(Error::bootstrap)?;

        let mut isolate = Self {
            shared,
            engine,
            modules: ModuleMap::new(),
            evaluating: Vec::new(),
            shared_ab,
            creator: will_snapshot.then(SnapshotCreator::default),
            terminate,
            context: ManuallyDrop::new(context),
            runtime: ManuallyDrop::new(runtime),
        };

        if let Some(natives) = natives {
            isolate.load_image(natives, true).map_err(Error::bootstrap)?;
        }
        if let Some(snapshot) = snapshot {
            isolate.load_image(snapshot, false).map_err(Error::bootstrap)?;
            for entry in &snapshot.entries {
                let id = isolate.modules.find(entry).ok_or_else(|| {
                    Error::Bootstrap(format!("snapshot entry `{entry}` is missing"))
                })?;
                isolate.instantiate(id).map_err(Error::bootstrap)?;
                isolate
                    .evaluate(UserData::NONE, id)
                    .map_err(Error::bootstrap)?;
            }
        }

        tracing::debug!(
            modules = isolate.modules.len(),
            will_snapshot,
            "isolate created"
        );
        Ok(isolate)
    }

    /// Register every module of `image` and replay its recorded links.
    fn load_image(&mut self, image: &Image, builtin: bool) -> Result<()> {
        for module in &image.modules {
            self.modules.check_available(&module.name)?;
            let syntax = imports::extract(&module.name, &module.source)?;
            let recorded = module.imports.iter().map(|import| import.specifier.as_str());
            if !syntax.specifiers.iter().map(String::as_str).eq(recorded) {
                return Err(Error::Bootstrap(format!(
                    "imports of `{}` do not match the recorded links",
                    module.name
                )));
            }
            self.add_module(module.main, &module.name, builtin, syntax, &module.source)?;
        }

        for module in &image.modules {
            let id = self
                .modules
                .find(&module.name)
                .ok_or(Error::State("image module vanished while loading"))?;
            for (index, import) in module.imports.iter().enumerate() {
                let Some(target_name) = &import.target else {
                    continue;
                };
                let target = self.modules.find(target_name).ok_or_else(|| Error::Resolution {
                    referrer: module.name.clone(),
                    specifier: import.specifier.clone(),
                    reason: format!("recorded target `{target_name}` is not loaded"),
                })?;
                self.link(id, index, target)?;
            }
        }
        Ok(())
    }

    fn add_module(
        &mut self,
        main: bool,
        name: &str,
        builtin: bool,
        syntax: ModuleSyntax,
        source: &str,
    ) -> Result<ModuleId> {
        let id = self
            .modules
            .insert(main, name, builtin, syntax, source.to_owned())?;
        self.engine.add(name, source);
        Ok(id)
    }

    fn link(&mut self, module: ModuleId, index: usize, target: ModuleId) -> Result<()> {
        self.modules.link(module, index, target)?;
        let referrer = self.modules.get(module)?;
        let specifier = &referrer.imports[index];
        let target_name = &self.modules.get(target)?.name;
        self.engine.link(&referrer.name, specifier, target_name);
        Ok(())
    }

    /// Parse `source` as an ES module named `name` and record its static
    /// imports. The engine compiles it when it is first instantiated; nothing
    /// runs yet.
    ///
    /// # Errors
    /// Fails with [`Error::DuplicateModule`] if the name is taken,
    /// [`Error::RetiredModule`] if it was used before a registry reset, and
    /// [`Error::Syntax`] if the source does not parse.
    pub fn register_module(&mut self, main: bool, name: &str, source: &str) -> Result<ModuleId> {
        self.modules.check_available(name)?;
        let syntax = imports::extract(name, source)?;
        let id = self.add_module(main, name, false, syntax, source)?;
        tracing::debug!(module.id = id.get(), module.name = name, main, "module registered");
        Ok(id)
    }

    /// Resolve every unresolved import specifier of every module.
    ///
    /// Specifiers naming a built-in module resolve to it directly. A specifier
    /// repeated within one module is resolved once. Modules registered on the
    /// resolver's request are resolved in turn, until nothing is left.
    ///
    /// # Errors
    /// Stops at the first specifier the resolver rejects, with
    /// [`Error::Resolution`]. Links made before that stay in place.
    pub fn resolve_imports(&mut self, resolver: &mut dyn ModuleResolver) -> Result<()> {
        loop {
            let unresolved = self.modules.unresolved();
            if unresolved.is_empty() {
                return Ok(());
            }
            for Unresolved {
                module,
                index,
                referrer,
                specifier,
            } in unresolved
            {
                let target = if let Some(target) = self
                    .modules
                    .linked(module, &specifier)
                    .or_else(|| self.modules.builtin(&specifier))
                {
                    target
                } else {
                    match resolver.resolve(&referrer, &specifier) {
                        Ok(Resolution::Existing(id)) => {
                            if self.modules.get(id).is_err() {
                                return Err(Error::Resolution {
                                    referrer,
                                    specifier,
                                    reason: format!("resolver returned unknown module {id}"),
                                });
                            }
                            id
                        }
                        Ok(Resolution::Register { name, source }) => {
                            match self.modules.find(&name) {
                                Some(existing) => existing,
                                None => self.register_module(false, &name, &source)?,
                            }
                        }
                        Err(reason) => {
                            return Err(Error::Resolution {
                                referrer,
                                specifier,
                                reason,
                            });
                        }
                    }
                };
                self.link(module, index, target)?;
                tracing::trace!(
                    module.name = %referrer,
                    specifier = %specifier,
                    target = target.get(),
                    "import resolved"
                );
            }
        }
    }

    /// Link the subgraph rooted at `id` and compile every module in it that
    /// the engine has not seen yet.
    ///
    /// # Errors
    /// Fails with [`Error::Resolution`] for the first unresolved import or
    /// imported binding the target does not export, and with
    /// [`Error::Syntax`] if the engine rejects a module. No module changes
    /// state on failure.
    pub fn instantiate(&mut self, id: ModuleId) -> Result<()> {
        let Self {
            modules,
            engine,
            context,
            ..
        } = self;
        let order = context.with(|ctx| {
            modules.instantiate(id, |info| {
                if engine.is_declared(&info.name) {
                    return Ok(());
                }
                engine
                    .declare(&ctx, &info.name)
                    .map(drop)
                    .map_err(|err| match err {
                        rquickjs::Error::Exception => Error::Syntax {
                            name: info.name.clone(),
                            message: ExceptionInfo::catch(&ctx).to_string(),
                        },
                        other => Error::Engine(other),
                    })
            })
        })?;
        tracing::debug!(module.id = id.get(), modules = order.len(), "module graph instantiated");
        Ok(())
    }

    /// Run the subgraph rooted at `id`, dependencies first, each module once.
    /// Evaluating an already evaluated module is a no-op.
    ///
    /// A graph that suspends on top-level `await` is left
    /// [`ModuleState::Evaluating`] and settles when the awaited promise does,
    /// during a later call into the isolate.
    ///
    /// # Errors
    /// Fails with [`Error::Guest`] if top-level code throws; the exception is
    /// also stored as the last exception and the module is not run again.
    pub fn evaluate(&mut self, user_data: UserData, id: ModuleId) -> Result<()> {
        let info = self.modules.get(id)?;
        match info.state {
            ModuleState::Evaluated | ModuleState::Evaluating => return Ok(()),
            ModuleState::Errored => return Err(Error::State("module evaluation already failed")),
            ModuleState::Registered => return Err(Error::State("module is not instantiated")),
            ModuleState::Instantiated => {}
        }
        let name = info.name.clone();
        let order = self.modules.dependency_order(id)?;

        let result = enter(
            &self.context,
            &self.shared,
            &self.terminate,
            user_data,
            |ctx, shared| {
                let promise =
                    Module::import(ctx, name.as_str()).map_err(|err| shared.capture(ctx, err))?;
                drain_jobs(ctx);
                let settled = promise.result::<Value<'_>>();
                if settled.is_some() {
                    shared.untrack(ctx, promise.as_value());
                }
                match settled {
                    None => Ok(Some(Persistent::save(ctx, promise))),
                    Some(Ok(_)) => Ok(None),
                    Some(Err(err)) => Err(shared.capture(ctx, err)),
                }
            },
        );

        match result {
            Ok(None) => {
                self.evaluated(id, &order);
                Ok(())
            }
            Ok(Some(promise)) => {
                for member in &order {
                    if self.modules.get(*member)?.state != ModuleState::Evaluated {
                        self.modules.set_state(*member, ModuleState::Evaluating)?;
                    }
                }
                self.evaluating.push(Evaluation {
                    root: id,
                    order,
                    promise,
                });
                tracing::debug!(module.id = id.get(), "module evaluation suspended");
                Ok(())
            }
            Err(err) => {
                let failed = match &err {
                    Error::Guest(info) => self.failing_module(&order, info),
                    _ => None,
                };
                self.modules.fail_evaluation(&order, failed);
                tracing::debug!(module.id = id.get(), %err, "module evaluation failed");
                Err(err)
            }
        }
    }

    fn evaluated(&mut self, id: ModuleId, order: &[ModuleId]) {
        self.modules.finish_evaluation(order);
        if let Some(creator) = self.creator.as_mut() {
            creator.record_entry(id);
        }
        tracing::debug!(module.id = id.get(), "module evaluated");
    }

    /// Module of `order` whose top-level code raised `info`: the outermost
    /// stack frame that belongs to one of them.
    fn failing_module(&self, order: &[ModuleId], info: &ExceptionInfo) -> Option<ModuleId> {
        info.frames
            .iter()
            .rev()
            .filter_map(|frame| frame.script_name.as_deref())
            .find_map(|script| self.modules.find(script).filter(|id| order.contains(id)))
    }

    /// Settle evaluations whose top-level `await` has finished.
    fn settle_evaluations(&mut self) {
        if self.evaluating.is_empty() {
            return;
        }
        let evaluating = core::mem::take(&mut self.evaluating);
        let mut waiting = Vec::new();
        let mut settled = Vec::new();
        self.context.with(|ctx| {
            for evaluation in evaluating {
                let Ok(promise) = evaluation.promise.clone().restore(&ctx) else {
                    continue;
                };
                match promise.result::<Value<'_>>() {
                    None => waiting.push(evaluation),
                    Some(Ok(_)) => settled.push((evaluation, None)),
                    Some(Err(_)) => settled.push((evaluation, Some(ExceptionInfo::catch(&ctx)))),
                }
            }
        });
        self.evaluating = waiting;

        for (evaluation, failure) in settled {
            match failure {
                None => self.evaluated(evaluation.root, &evaluation.order),
                Some(info) => {
                    let failed = self.failing_module(&evaluation.order, &info);
                    self.modules.fail_evaluation(&evaluation.order, failed);
                    tracing::debug!(
                        module.id = evaluation.root.get(),
                        exception = %info,
                        "module evaluation failed"
                    );
                }
            }
        }
    }

    /// Run `source` as a classic script in the global scope.
    ///
    /// The engine reports every classic script as `eval_script` in stack
    /// traces; `filename` labels the call in traces of this crate.
    ///
    /// # Errors
    /// Fails with [`Error::Guest`] if the script throws.
    pub fn execute(&mut self, user_data: UserData, filename: &str, source: &str) -> Result<()> {
        tracing::trace!(filename, "executing script");
        let result = enter(
            &self.context,
            &self.shared,
            &self.terminate,
            user_data,
            |ctx, shared| {
                let mut options = EvalOptions::default();
                options.global = true;
                options.strict = false;
                ctx.eval_with_options::<(), _>(source, options)
                    .map_err(|err| shared.capture(ctx, err))?;
                drain_jobs(ctx);
                Ok(())
            },
        );
        self.settle_evaluations();
        result
    }

    /// Deliver `message` to the callback registered with `corral.recv`.
    ///
    /// # Errors
    /// Fails with [`Error::State`] if guest code never registered a callback,
    /// or [`Error::Guest`] if the callback throws.
    pub fn dispatch(&mut self, user_data: UserData, message: &[u8]) -> Result<()> {
        let callback = self
            .shared
            .recv
            .borrow()
            .clone()
            .ok_or(Error::State("no receive callback registered"))?;
        let result = enter(
            &self.context,
            &self.shared,
            &self.terminate,
            user_data,
            |ctx, shared| {
                let callback = callback.restore(ctx)?;
                bridge::bytes_to_js(ctx, message.to_vec())
                    .and_then(|message| callback.call::<_, ()>((message,)))
                    .map_err(|err| shared.capture(ctx, err))?;
                drain_jobs(ctx);
                Ok(())
            },
        );
        self.settle_evaluations();
        result
    }

    /// Settle the promise returned by `corral.pending(op)`.
    ///
    /// Returns `false` without touching guest state if `op` is not pending:
    /// it was already completed, never registered, or dropped by a reset.
    ///
    /// # Errors
    /// Fails with [`Error::Guest`] if a reaction to the settled promise throws.
    pub fn complete(&mut self, user_data: UserData, op: OpId, completion: Completion) -> Result<bool> {
        let Some(resolvers) = self.shared.pending.borrow_mut().take(op) else {
            tracing::debug!(target: TRACE_TARGET_BRIDGE, op, "completion for unknown operation ignored");
            return Ok(false);
        };
        let result = enter(
            &self.context,
            &self.shared,
            &self.terminate,
            user_data,
            |ctx, shared| {
                let settled = match completion {
                    Completion::Ok(bytes) => {
                        let resolve = resolvers.resolve.restore(ctx)?;
                        bridge::bytes_to_js(ctx, bytes)
                            .and_then(|value| resolve.call::<_, ()>((value,)))
                    }
                    Completion::Err(message) => {
                        let reject = resolvers.reject.restore(ctx)?;
                        Exception::from_message(ctx.clone(), &message)
                            .and_then(|error| reject.call::<_, ()>((error,)))
                    }
                };
                settled.map_err(|err| shared.capture(ctx, err))?;
                drain_jobs(ctx);
                Ok(true)
            },
        );
        self.settle_evaluations();
        result
    }

    /// Run queued promise jobs until the queue is empty.
    ///
    /// # Errors
    /// Fails with [`Error::Guest`] if a rejection is left unhandled.
    pub fn run_microtasks(&mut self, user_data: UserData) -> Result<()> {
        let result = enter(
            &self.context,
            &self.shared,
            &self.terminate,
            user_data,
            |ctx, _| {
                drain_jobs(ctx);
                Ok(())
            },
        );
        self.settle_evaluations();
        result
    }

    /// JSON form of the most recent uncaught exception.
    #[must_use]
    pub fn last_exception(&self) -> Option<String> {
        self.shared.last_exception.borrow().clone()
    }

    /// Structured form of [`Isolate::last_exception`].
    #[must_use]
    pub fn last_exception_info(&self) -> Option<ExceptionInfo> {
        ExceptionInfo::from_json(self.shared.last_exception.borrow().as_deref()?).ok()
    }

    pub fn take_last_exception(&mut self) -> Option<String> {
        self.shared.last_exception.borrow_mut().take()
    }

    pub fn clear_last_exception(&mut self) {
        self.shared.last_exception.borrow_mut().take();
    }

    /// Release a buffer pinned by `corral.send`. Returns `false` if the id
    /// was not attached.
    pub fn detach_buffer(&mut self, id: BufferId) -> bool {
        let released = self.shared.buffers.borrow_mut().detach(id).is_some();
        if !released {
            tracing::debug!(target: TRACE_TARGET_BRIDGE, %id, "release of unknown buffer ignored");
        }
        released
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.shared.buffers.borrow().len()
    }

    /// Access a pinned buffer in place. Returns `None` for an unknown id.
    pub fn with_buffer<R>(&mut self, id: BufferId, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let view = self.shared.buffers.borrow().get(id)?.clone();
        self.context.with(|ctx| {
            let view: TypedArray<'_, u8> = view.restore(&ctx).ok()?;
            let (ptr, len) = bridge::view_raw(&ctx, &view).ok()?;
            // SAFETY: the view is pinned by the buffer table and no guest code
            // runs while `f` holds the slice.
            let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
            Some(f(bytes))
        })
    }

    /// Access the buffer exposed to guest code as `corral.shared`. Returns
    /// `None` if the isolate was created without one.
    pub fn with_shared<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let buffer = self.shared_ab.clone()?;
        self.context.with(|ctx| {
            let buffer: ArrayBuffer<'_> = buffer.restore(&ctx).ok()?;
            let raw = buffer.as_raw()?;
            // SAFETY: the isolate keeps the buffer alive and no guest code runs
            // while `f` holds the slice.
            let bytes = unsafe { core::slice::from_raw_parts_mut(raw.ptr.as_ptr(), raw.len) };
            Some(f(bytes))
        })
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    #[must_use]
    pub fn is_pending(&self, op: OpId) -> bool {
        self.shared.pending.borrow().contains(op)
    }

    #[must_use]
    pub fn find_module(&self, name: &str) -> Option<ModuleId> {
        self.modules.find(name)
    }

    /// # Errors
    /// Fails with [`Error::UnknownModule`] for an id that is not registered.
    pub fn module_name(&self, id: ModuleId) -> Result<&str> {
        Ok(&self.modules.get(id)?.name)
    }

    /// Import specifiers in source order, duplicates included.
    ///
    /// # Errors
    /// Fails with [`Error::UnknownModule`] for an id that is not registered.
    pub fn module_imports(&self, id: ModuleId) -> Result<&[String]> {
        Ok(&self.modules.get(id)?.imports)
    }

    /// # Errors
    /// Fails with [`Error::UnknownModule`] for an id that is not registered.
    pub fn module_state(&self, id: ModuleId) -> Result<ModuleState> {
        Ok(self.modules.get(id)?.state)
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Drop every registered module. Their names cannot be registered again.
    pub fn clear_modules(&mut self) {
        let dropped = self.modules.clear();
        self.evaluating.clear();
        self.engine.clear();
        tracing::debug!(dropped, "module registry cleared");
    }

    #[must_use]
    pub fn termination_handle(&self) -> TerminationHandle {
        self.terminate.clone()
    }

    /// Consume the isolate and serialize its modules and evaluated entries
    /// into a snapshot blob.
    ///
    /// # Errors
    /// Fails with [`Error::State`] unless the isolate was configured with
    /// `will_snapshot`.
    pub fn snapshot(mut self) -> Result<Vec<u8>> {
        let creator = self
            .creator
            .take()
            .ok_or(Error::State("isolate was not created with will_snapshot"))?;
        creator.finish(&self.modules)
    }
}

impl core::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Isolate")
            .field("modules", &self.modules.len())
            .field("buffers", &self.buffer_count())
            .field("pending", &self.pending_count())
            .field("will_snapshot", &self.creator.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        if !thread::panicking() {
            assert!(
                self.shared.user_data.get().is_none(),
                "isolate dropped while a call into it is active"
            );
        }
        self.shared_ab.take();
        self.shared.release();
        self.evaluating.clear();
        self.modules.clear();
        self.engine.clear();
        self.creator.take();
        // SAFETY: every persistent handle into the context was released above
        // and neither field is touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.context);
            ManuallyDrop::drop(&mut self.runtime);
        }
        tracing::debug!("isolate destroyed");
    }
}

/// Enter the context with `user_data` attached. A rejection left unhandled
/// by a successful call becomes that call's error.
fn enter<R>(
    context: &Context,
    shared: &Shared,
    terminate: &TerminationHandle,
    user_data: UserData,
    f: impl for<'js> FnOnce(&Ctx<'js>, &Shared) -> Result<R>,
) -> Result<R> {
    terminate.reset();
    let _scope = UserDataScope::new(&shared.user_data, user_data);
    context.with(|ctx| match f(&ctx, shared) {
        Ok(value) => shared.promote_rejections().map_or(Ok(value), Err),
        Err(err) => {
            shared.discard_rejections();
            Err(err)
        }
    })
}

fn drain_jobs(ctx: &Ctx<'_>) {
    while ctx.execute_pending_job() {}
}
