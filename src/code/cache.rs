//! The code cache: every installed method and global stub of a process.
//!
//! Methods are published with one map insert once their code is linked
//! and executable. Installing a newer version of a method forwards the
//! older one, so callers still linked against it reach the new code.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::installed::InstalledMethod;
use crate::emit::stub_cache::StubCache;
use crate::error::InstallError;
use crate::runtime::{MethodId, RuntimeCall, RuntimeLinkage};
use crate::target::{Callee, CompiledMethod};

pub struct CodeCache {
    linkage: RuntimeLinkage,
    stubs: Arc<StubCache>,
    methods: RwLock<FxHashMap<MethodId, Arc<InstalledMethod>>>,
    installed_stubs: RwLock<FxHashMap<RuntimeCall, Arc<InstalledMethod>>>,
    all: RwLock<Vec<Arc<InstalledMethod>>>,
}

impl CodeCache {
    /// `linkage` locates the runtime routines; `stubs` is the cache the
    /// compilers generate global stubs into.
    pub fn new(linkage: RuntimeLinkage, stubs: Arc<StubCache>) -> Self {
        Self {
            linkage,
            stubs,
            methods: RwLock::new(FxHashMap::default()),
            installed_stubs: RwLock::new(FxHashMap::default()),
            all: RwLock::new(Vec::new()),
        }
    }

    pub fn linkage(&self) -> &RuntimeLinkage {
        &self.linkage
    }

    /// Address a direct call to `callee` is linked to. Calls to methods
    /// that are not installed yet go to the static call resolver.
    pub fn resolve(&self, callee: &Callee) -> Option<usize> {
        match callee {
            Callee::Method(id) => match self.get(*id) {
                Some(method) => Some(method.entry_address(true)),
                None => self.linkage.address(RuntimeCall::ResolveStaticCall),
            },
            Callee::Runtime(call) => self.linkage.address(*call),
            Callee::GlobalStub(call) => self
                .installed_stubs
                .read()
                .get(call)
                .map(|stub| stub.entry_address(false)),
            Callee::Native(symbol) => self.linkage.native(symbol),
        }
    }

    /// Installs the global stub for `call` unless it already is.
    fn install_stub(&self, call: RuntimeCall) -> Result<Arc<InstalledMethod>, InstallError> {
        if let Some(stub) = self.installed_stubs.read().get(&call) {
            return Ok(stub.clone());
        }
        let code = self
            .stubs
            .get(call)
            .ok_or_else(|| InstallError::NotInstalled(format!("stub {call}")))?;
        let stub = Arc::new(InstalledMethod::install(code, |callee| self.resolve(callee))?);

        let mut installed = self.installed_stubs.write();
        if let Some(existing) = installed.get(&call) {
            return Ok(existing.clone());
        }
        debug!("installed stub {call} at {:#x}", stub.address());
        installed.insert(call, stub.clone());
        self.all.write().push(stub.clone());
        Ok(stub)
    }

    /// Links and publishes `method`. An already installed version of the
    /// same method is forwarded to the new one first; if that fails the new
    /// version is not published.
    pub fn install(&self, method: Arc<CompiledMethod>) -> Result<Arc<InstalledMethod>, InstallError> {
        let id = method
            .method
            .ok_or_else(|| InstallError::NotAMethod(method.name.clone()))?;
        for stop in &method.stops {
            if let Some(Callee::GlobalStub(call)) = stop.callee {
                self.install_stub(call)?;
            }
        }

        let installed = Arc::new(InstalledMethod::install(method, |callee| self.resolve(callee))?);
        let mut methods = self.methods.write();
        if let Some(previous) = methods.get(&id) {
            previous.forward_to(&installed)?;
        }
        methods.insert(id, installed.clone());
        drop(methods);
        self.all.write().push(installed.clone());
        info!(
            "installed {} at {:#x} ({} bytes)",
            installed.method().name,
            installed.address(),
            installed.code_size()
        );
        Ok(installed)
    }

    /// The newest installed version of `id`.
    pub fn get(&self, id: MethodId) -> Option<Arc<InstalledMethod>> {
        self.methods.read().get(&id).cloned()
    }

    pub fn stub(&self, call: RuntimeCall) -> Option<Arc<InstalledMethod>> {
        self.installed_stubs.read().get(&call).cloned()
    }

    /// The installed code containing `ip`, including forwarded versions.
    pub fn find_by_ip(&self, ip: usize) -> Option<Arc<InstalledMethod>> {
        self.all.read().iter().find(|m| m.contains(ip)).cloned()
    }

    /// Number of installed code blobs, stubs and old versions included.
    pub fn len(&self) -> usize {
        self.all.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
