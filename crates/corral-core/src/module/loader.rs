use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use rquickjs::{
    Ctx, Error, Module, Result,
    loader::{Loader, Resolver},
    module::Declared,
};

#[derive(Default)]
struct Inner {
    /// `(referrer name, specifier) -> target name` for every linked import.
    links: HashMap<(String, String), String>,
    /// Registered sources the engine has not compiled yet.
    sources: HashMap<String, String>,
    declared: HashSet<String>,
}

/// The registry as the engine sees it.
///
/// The module map decides every link; the engine asks for them again while
/// it compiles a module, and pulls in targets it has not seen by name. A
/// module is compiled at most once per isolate.
#[derive(Clone, Default)]
pub(crate) struct EngineModules(Arc<Mutex<Inner>>);

impl EngineModules {
    pub(crate) fn add(&self, name: &str, source: &str) {
        self.0.lock().sources.insert(name.to_owned(), source.to_owned());
    }

    pub(crate) fn link(&self, referrer: &str, specifier: &str, target: &str) {
        self.0
            .lock()
            .links
            .insert((referrer.to_owned(), specifier.to_owned()), target.to_owned());
    }

    pub(crate) fn is_declared(&self, name: &str) -> bool {
        self.0.lock().declared.contains(name)
    }

    /// Compile the registered source of `name`. Imports the engine has not
    /// seen yet are compiled on the way, through [`ModuleLoader`].
    ///
    /// A module that fails to compile keeps its source and can be tried again.
    pub(crate) fn declare<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Result<Module<'js, Declared>> {
        let source = self
            .0
            .lock()
            .sources
            .remove(name)
            .ok_or_else(|| Error::new_loading(name))?;
        match Module::declare(ctx.clone(), name, source.as_bytes()) {
            Ok(module) => {
                self.0.lock().declared.insert(name.to_owned());
                tracing::trace!(module.name = name, "module compiled");
                Ok(module)
            }
            Err(err) => {
                self.0.lock().sources.insert(name.to_owned(), source);
                Err(err)
            }
        }
    }

    /// Forget every module. The engine keeps what it compiled, but nothing
    /// resolves to it any more.
    pub(crate) fn clear(&self) {
        let mut inner = self.0.lock();
        inner.links.clear();
        inner.sources.clear();
        inner.declared.clear();
    }

    fn knows(&self, name: &str) -> bool {
        let inner = self.0.lock();
        inner.declared.contains(name) || inner.sources.contains_key(name)
    }
}

/// Replays links decided by the module map. The name of a registered module
/// resolves to itself, which is how the isolate asks the engine to run one.
pub(crate) struct LinkResolver(pub(crate) EngineModules);

impl Resolver for LinkResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> Result<String> {
        let linked = (self.0)
            .0
            .lock()
            .links
            .get(&(base.to_owned(), name.to_owned()))
            .cloned();
        match linked {
            Some(target) => Ok(target),
            None if self.0.knows(name) => Ok(name.to_owned()),
            None => Err(Error::new_resolving(base, name)),
        }
    }
}

pub(crate) struct ModuleLoader(pub(crate) EngineModules);

impl Loader for ModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> Result<Module<'js, Declared>> {
        self.0.declare(ctx, name).inspect_err(|err| {
            tracing::debug!(module.name = name, %err, "engine could not load module");
        })
    }
}
