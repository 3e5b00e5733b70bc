use core::{fmt, num::NonZeroU32};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    error::{Error, Result},
    imports::ModuleSyntax,
};

pub(crate) mod loader;

/// Identifier of a registered module. Ids start at 1, are assigned in
/// registration order and are never reused, not even after a registry reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(NonZeroU32);

impl ModuleId {
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mod#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Registered,
    Instantiated,
    /// Top-level `await` is still pending. The module settles as
    /// [`ModuleState::Evaluated`] or [`ModuleState::Errored`] once the awaited
    /// promise does.
    Evaluating,
    Evaluated,
    /// Evaluation threw. The engine keeps the error; the module is never run again.
    Errored,
}

/// Answer of a [`ModuleResolver`] for one import specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The specifier names a module that is already registered.
    Existing(ModuleId),
    /// Register this source under `name` and link the specifier to it. If
    /// `name` is already registered the existing module is used instead.
    Register { name: String, source: String },
}

/// Host-supplied import resolution, consulted once per unresolved
/// `(referrer, specifier)` pair.
pub trait ModuleResolver {
    /// # Errors
    /// Returns a human readable reason when the specifier cannot be resolved.
    fn resolve(&mut self, referrer: &str, specifier: &str) -> Result<Resolution, String>;
}

impl<F> ModuleResolver for F
where
    F: FnMut(&str, &str) -> Result<Resolution, String>,
{
    fn resolve(&mut self, referrer: &str, specifier: &str) -> Result<Resolution, String> {
        self(referrer, specifier)
    }
}

pub(crate) struct ModuleInfo<H> {
    pub(crate) main: bool,
    pub(crate) name: String,
    /// Registered from the natives blob; importable by its exact name.
    pub(crate) builtin: bool,
    pub(crate) imports: Vec<String>,
    /// Resolved target for each entry of `imports`, index for index.
    pub(crate) links: Vec<Option<ModuleId>>,
    /// `(import index, name)` for every binding required from a target.
    bindings: Vec<(usize, String)>,
    exports: Vec<String>,
    star_exports: Vec<usize>,
    pub(crate) state: ModuleState,
    pub(crate) code: H,
}

/// An import specifier still waiting for the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unresolved {
    pub(crate) module: ModuleId,
    pub(crate) index: usize,
    pub(crate) referrer: String,
    pub(crate) specifier: String,
}

/// Owning module table keyed by id with a secondary name index.
///
/// `H` is the code kept per module. Modules never point back into the
/// table; every edge is a [`ModuleId`] looked up through it.
pub(crate) struct ModuleMap<H> {
    next: NonZeroU32,
    modules: BTreeMap<ModuleId, ModuleInfo<H>>,
    by_name: HashMap<String, ModuleId>,
    retired: HashSet<String>,
}

impl<H> ModuleMap<H> {
    pub(crate) fn new() -> Self {
        Self {
            next: NonZeroU32::MIN,
            modules: BTreeMap::new(),
            by_name: HashMap::new(),
            retired: HashSet::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.modules.len()
    }

    pub(crate) fn find(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    /// Fail if `name` cannot be registered.
    pub(crate) fn check_available(&self, name: &str) -> Result<()> {
        if let Some(existing) = self.find(name) {
            return Err(Error::DuplicateModule {
                name: name.to_owned(),
                existing,
            });
        }
        if self.retired.contains(name) {
            return Err(Error::RetiredModule(name.to_owned()));
        }
        Ok(())
    }

    pub(crate) fn insert(
        &mut self,
        main: bool,
        name: &str,
        builtin: bool,
        syntax: ModuleSyntax,
        code: H,
    ) -> Result<ModuleId> {
        self.check_available(name)?;
        let id = ModuleId(self.next);
        self.next = self
            .next
            .checked_add(1)
            .ok_or(Error::State("module id space exhausted"))?;
        let ModuleSyntax {
            specifiers: imports,
            bindings,
            exports,
            star_exports,
        } = syntax;
        let links = vec![None; imports.len()];
        self.modules.insert(
            id,
            ModuleInfo {
                main,
                name: name.to_owned(),
                builtin,
                imports,
                links,
                bindings,
                exports,
                star_exports,
                state: ModuleState::Registered,
                code,
            },
        );
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    pub(crate) fn get(&self, id: ModuleId) -> Result<&ModuleInfo<H>> {
        self.modules.get(&id).ok_or(Error::UnknownModule(id))
    }

    fn get_mut(&mut self, id: ModuleId) -> Result<&mut ModuleInfo<H>> {
        self.modules.get_mut(&id).ok_or(Error::UnknownModule(id))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleInfo<H>)> {
        self.modules.iter().map(|(id, info)| (*id, info))
    }

    /// Built-in module whose name is exactly `specifier`.
    pub(crate) fn builtin(&self, specifier: &str) -> Option<ModuleId> {
        self.find(specifier)
            .filter(|id| self.modules.get(id).is_some_and(|info| info.builtin))
    }

    pub(crate) fn unresolved(&self) -> Vec<Unresolved> {
        self.modules
            .iter()
            .flat_map(|(id, info)| {
                info.imports
                    .iter()
                    .zip(&info.links)
                    .enumerate()
                    .filter(|(_, (_, link))| link.is_none())
                    .map(|(index, (specifier, _))| Unresolved {
                        module: *id,
                        index,
                        referrer: info.name.clone(),
                        specifier: specifier.clone(),
                    })
            })
            .collect()
    }

    /// Target already linked for `specifier` elsewhere in the same module.
    pub(crate) fn linked(&self, module: ModuleId, specifier: &str) -> Option<ModuleId> {
        let info = self.modules.get(&module)?;
        info.imports
            .iter()
            .zip(&info.links)
            .find_map(|(s, link)| (s == specifier).then_some(*link).flatten())
    }

    pub(crate) fn link(&mut self, module: ModuleId, index: usize, target: ModuleId) -> Result<()> {
        if !self.modules.contains_key(&target) {
            return Err(Error::UnknownModule(target));
        }
        let info = self.get_mut(module)?;
        let slot = info
            .links
            .get_mut(index)
            .ok_or(Error::State("import index out of range"))?;
        *slot = Some(target);
        Ok(())
    }

    /// Every module reachable from `root`, dependencies before dependents.
    ///
    /// Fails on the first unresolved import. A module that is still being
    /// visited satisfies a back-edge, so cycles terminate.
    pub(crate) fn dependency_order(&self, root: ModuleId) -> Result<Vec<ModuleId>> {
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        let mut order = Vec::new();
        self.walk(root, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn walk(
        &self,
        id: ModuleId,
        visiting: &mut HashSet<ModuleId>,
        done: &mut HashSet<ModuleId>,
        order: &mut Vec<ModuleId>,
    ) -> Result<()> {
        if done.contains(&id) || !visiting.insert(id) {
            return Ok(());
        }
        let info = self.get(id)?;
        for (specifier, link) in info.imports.iter().zip(&info.links) {
            let target = link.ok_or_else(|| Error::Resolution {
                referrer: info.name.clone(),
                specifier: specifier.clone(),
                reason: "import has not been resolved".to_owned(),
            })?;
            self.walk(target, visiting, done, order)?;
        }
        visiting.remove(&id);
        done.insert(id);
        order.push(id);
        Ok(())
    }

    /// Fail if an import names a binding its target does not provide.
    fn check_bindings(&self, order: &[ModuleId]) -> Result<()> {
        for id in order {
            let info = self.get(*id)?;
            for (index, name) in &info.bindings {
                let specifier = &info.imports[*index];
                let target = info.links[*index].ok_or_else(|| Error::Resolution {
                    referrer: info.name.clone(),
                    specifier: specifier.clone(),
                    reason: "import has not been resolved".to_owned(),
                })?;
                if !self.provides(target, name, &mut HashSet::new()) {
                    return Err(Error::Resolution {
                        referrer: info.name.clone(),
                        specifier: specifier.clone(),
                        reason: format!("`{}` does not export `{name}`", self.get(target)?.name),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether `id` exports `name`, directly or through `export *`.
    fn provides(&self, id: ModuleId, name: &str, seen: &mut HashSet<ModuleId>) -> bool {
        if !seen.insert(id) {
            return false;
        }
        let Some(info) = self.modules.get(&id) else {
            return false;
        };
        if info.exports.iter().any(|export| export == name) {
            return true;
        }
        // `export *` never forwards a default export.
        name != "default"
            && info.star_exports.iter().any(|index| {
                info.links
                    .get(*index)
                    .copied()
                    .flatten()
                    .is_some_and(|target| self.provides(target, name, seen))
            })
    }

    /// Link the whole subgraph under `root` and hand each module to
    /// `declare`, dependencies first.
    ///
    /// Nothing changes state unless every import in the subgraph is resolved,
    /// every imported binding exists and `declare` succeeds for every module.
    pub(crate) fn instantiate(
        &mut self,
        root: ModuleId,
        mut declare: impl FnMut(&ModuleInfo<H>) -> Result<()>,
    ) -> Result<Vec<ModuleId>> {
        let order = self.dependency_order(root)?;
        self.check_bindings(&order)?;
        for id in &order {
            declare(self.get(*id)?)?;
        }
        for id in &order {
            let info = self.get_mut(*id)?;
            if info.state == ModuleState::Registered {
                info.state = ModuleState::Instantiated;
            }
        }
        Ok(order)
    }

    pub(crate) fn set_state(&mut self, id: ModuleId, state: ModuleState) -> Result<()> {
        self.get_mut(id)?.state = state;
        Ok(())
    }

    /// Record that evaluating `order`, the subgraph under its last module,
    /// finished successfully.
    pub(crate) fn finish_evaluation(&mut self, order: &[ModuleId]) {
        for id in order {
            if let Some(info) = self.modules.get_mut(id)
                && info.state != ModuleState::Errored
            {
                info.state = ModuleState::Evaluated;
            }
        }
    }

    /// Record that evaluating `order` failed in `failed`.
    ///
    /// The failing module and everything in `order` that depends on it are
    /// errored. Modules ahead of it in `order` that do not depend on it ran to
    /// completion. Modules behind it never started and stay instantiated. If
    /// the failing module is unknown only the root is errored; the engine
    /// still reports the failure for any other module evaluated later.
    pub(crate) fn fail_evaluation(&mut self, order: &[ModuleId], failed: Option<ModuleId>) {
        let Some(root) = order.last().copied() else {
            return;
        };
        let failed_at = failed.and_then(|failed| order.iter().position(|id| *id == failed));
        let mut errored: HashSet<ModuleId> = failed_at.map(|at| order[at]).into_iter().collect();
        errored.insert(root);
        if failed_at.is_some() {
            // Cycles can put a dependent ahead of its dependency.
            loop {
                let before = errored.len();
                for id in order {
                    let depends = self.modules.get(id).is_some_and(|info| {
                        info.links.iter().flatten().any(|target| errored.contains(target))
                    });
                    if depends {
                        errored.insert(*id);
                    }
                }
                if errored.len() == before {
                    break;
                }
            }
        }

        for (position, id) in order.iter().enumerate() {
            let Some(info) = self.modules.get_mut(id) else {
                continue;
            };
            if info.state == ModuleState::Evaluated {
                continue;
            }
            if errored.contains(id) {
                info.state = ModuleState::Errored;
            } else if failed_at.is_some_and(|at| position < at) {
                info.state = ModuleState::Evaluated;
            } else {
                info.state = ModuleState::Instantiated;
            }
        }
    }

    /// Drop every module. Names stay retired and ids keep counting.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.modules.len();
        self.retired.extend(self.by_name.drain().map(|(name, _)| name));
        self.modules.clear();
        dropped
    }
}
