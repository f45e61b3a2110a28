//! Process-wide cache of global stubs.
//!
//! Global stubs adapt the stack-slot argument convention of compiled code
//! to the native convention of a runtime routine. They are generated on
//! first use by whichever compilation needs them; when two compilations
//! race, the first insert wins and the other result is dropped.

use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{BailoutReason, EmitResult};
use crate::runtime::RuntimeCall;
use crate::target::CompiledMethod;

pub struct StubCache {
    stubs: RwLock<FxHashMap<RuntimeCall, Arc<CompiledMethod>>>,
    capacity: usize,
}

impl Default for StubCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StubCache {
    pub fn new() -> Self {
        Self::with_capacity(RuntimeCall::ALL.len())
    }

    /// A cache that refuses to hold more than `capacity` stubs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stubs: RwLock::new(FxHashMap::default()),
            capacity,
        }
    }

    pub fn get(&self, call: RuntimeCall) -> Option<Arc<CompiledMethod>> {
        self.stubs.read().get(&call).cloned()
    }

    /// Returns the stub for `call`, generating it with `create` when it is
    /// missing. Generation happens outside the lock.
    pub fn get_or_create(
        &self,
        call: RuntimeCall,
        create: impl FnOnce() -> EmitResult<CompiledMethod>,
    ) -> EmitResult<Arc<CompiledMethod>> {
        if let Some(stub) = self.get(call) {
            return Ok(stub);
        }
        let stub = Arc::new(create()?);

        let mut stubs = self.stubs.write();
        if let Some(existing) = stubs.get(&call) {
            return Ok(existing.clone());
        }
        if stubs.len() >= self.capacity {
            return Err(BailoutReason::StubSpaceExhausted.into());
        }
        debug!("generated global stub {call} ({} bytes)", stub.code.len());
        stubs.insert(call, stub.clone());
        Ok(stub)
    }

    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stub generated so far.
    pub fn snapshot(&self) -> Vec<(RuntimeCall, Arc<CompiledMethod>)> {
        let mut stubs: Vec<_> = self
            .stubs
            .read()
            .iter()
            .map(|(call, stub)| (*call, stub.clone()))
            .collect();
        stubs.sort_by_key(|(call, _)| *call);
        stubs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::CodeBuffer;
    use crate::target::{CodeKind, TargetMethodBuilder};

    fn stub(name: &str) -> EmitResult<CompiledMethod> {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xC3);
        TargetMethodBuilder::new(None, name, CodeKind::GlobalStub, 8, 0, 16).finish(buf)
    }

    #[test]
    fn test_first_writer_wins() {
        let cache = StubCache::new();
        let first = cache
            .get_or_create(RuntimeCall::MonitorEnter, || stub("first"))
            .unwrap();
        let second = cache
            .get_or_create(RuntimeCall::MonitorEnter, || stub("second"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name, "first");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_exhausted_cache_bails_out() {
        let cache = StubCache::with_capacity(1);
        cache
            .get_or_create(RuntimeCall::MonitorEnter, || stub("enter"))
            .unwrap();
        let err = cache
            .get_or_create(RuntimeCall::MonitorExit, || stub("exit"))
            .unwrap_err();
        assert_eq!(
            err,
            crate::error::EmitError::Bailout(BailoutReason::StubSpaceExhausted)
        );
    }

    #[test]
    fn test_concurrent_creation_publishes_one_stub() {
        let cache = Arc::new(StubCache::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_create(RuntimeCall::SlowSubtypeCheck, || stub(&format!("t{i}")))
                        .unwrap()
                })
            })
            .collect();
        let stubs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(stubs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }
}
