//! Inlining scopes.
//!
//! Every method inlined into a compilation gets a [`Scope`] in a
//! [`ScopeTree`] arena; a scope names its caller by index. Call-site
//! positions are built lazily and shared, so every stop inside the same
//! inlined body points at the same caller chain.

use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runtime::{MethodId, RuntimeModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

/// A bytecode position together with the chain of call sites that inlined
/// it. `caller` is `None` for positions in the outermost method.
#[derive(Debug, PartialEq, Eq)]
pub struct CodePos {
    pub caller: Option<Arc<CodePos>>,
    pub method: MethodId,
    pub bci: i32,
}

impl CodePos {
    pub fn new(caller: Option<Arc<CodePos>>, method: MethodId, bci: i32) -> Self {
        Self {
            caller,
            method,
            bci,
        }
    }

    /// This position followed by its callers, innermost first.
    pub fn chain(&self) -> impl Iterator<Item = &CodePos> {
        std::iter::successors(Some(self), |pos| pos.caller.as_deref())
    }

    /// Number of positions in the chain.
    pub fn depth(&self) -> usize {
        self.chain().count()
    }

    /// `(method, bci)` pairs from the outermost caller inwards.
    pub fn frames_outermost_first(&self) -> Vec<(MethodId, i32)> {
        let mut frames: Vec<_> = self.chain().map(|p| (p.method, p.bci)).collect();
        frames.reverse();
        frames
    }
}

impl fmt::Display for CodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pos) in self.chain().enumerate() {
            if i > 0 {
                f.write_str(" <- ")?;
            }
            write!(f, "m{}@{}", pos.method.0, pos.bci)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Scope {
    pub caller: Option<ScopeId>,
    pub method: MethodId,
    /// Bytecode index of the invoke in the caller; -1 for the root
    pub caller_bci: i32,
    pub level: u32,
    #[serde(default)]
    locks: u32,
    /// Operand stack depth of the caller at the call site
    #[serde(default)]
    pub caller_stack_size: u32,
    #[serde(skip)]
    call_site: OnceCell<Option<Arc<CodePos>>>,
    #[serde(skip)]
    lock_stack_size: OnceCell<u32>,
}

impl Scope {
    fn new(caller: Option<ScopeId>, method: MethodId, caller_bci: i32, level: u32) -> Self {
        Self {
            caller,
            method,
            caller_bci,
            level,
            locks: 0,
            caller_stack_size: 0,
            call_site: OnceCell::new(),
            lock_stack_size: OnceCell::new(),
        }
    }

    pub fn number_of_locks(&self) -> u32 {
        self.locks
    }

    pub fn is_root(&self) -> bool {
        self.caller.is_none()
    }
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Self {
            caller: self.caller,
            method: self.method,
            caller_bci: self.caller_bci,
            level: self.level,
            locks: self.locks,
            caller_stack_size: self.caller_stack_size,
            call_site: self.call_site.clone(),
            lock_stack_size: self.lock_stack_size.clone(),
        }
    }
}

/// Arena of the scopes of one compilation. Scope 0 is the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl ScopeTree {
    pub fn new(root: MethodId) -> Self {
        Self {
            scopes: vec![Scope::new(None, root, -1, 0)],
        }
    }

    /// Creates a scope for `method` inlined at `caller_bci` in `caller`.
    pub fn new_scope(
        &mut self,
        caller: ScopeId,
        caller_bci: i32,
        method: MethodId,
        caller_stack_size: u32,
    ) -> ScopeId {
        let level = self.get(caller).map_or(0, |c| c.level + 1);
        let mut scope = Scope::new(Some(caller), method, caller_bci, level);
        scope.caller_stack_size = caller_stack_size;
        self.scopes.push(scope);
        ScopeId((self.scopes.len() - 1) as u32)
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn root_method(&self) -> Option<MethodId> {
        self.scopes.first().map(|s| s.method)
    }

    pub fn level(&self, id: ScopeId) -> u32 {
        self.get(id).map_or(0, |s| s.level)
    }

    /// Raises the number of lock slots `id` needs; never lowers it.
    pub fn set_minimum_locks(&mut self, id: ScopeId, locks: u32) {
        if let Some(scope) = self.scopes.get_mut(id.0 as usize) {
            scope.locks = scope.locks.max(locks);
        }
    }

    /// Records the caller's operand stack depth at the call site of `id`.
    pub fn set_caller_stack_size(&mut self, id: ScopeId, size: u32) {
        if let Some(scope) = self.scopes.get_mut(id.0 as usize) {
            scope.caller_stack_size = size;
        }
        for scope in &mut self.scopes {
            scope.lock_stack_size.take();
        }
    }

    /// Monitor slots the frame needs for the deepest lock nesting of any
    /// scope.
    pub fn max_locks(&self) -> u32 {
        self.scopes.iter().map(Scope::number_of_locks).max().unwrap_or(0)
    }

    /// Walks outwards from `id` past scopes whose method neither has
    /// exception handlers nor is synchronized. The first scope that does
    /// determines the size: its caller's stack depth at the call site.
    /// Zero when no such scope exists or inlined exception handling is off.
    pub fn compute_lock_stack_size(
        &self,
        id: ScopeId,
        model: &RuntimeModel,
        opt_inline_except: bool,
    ) -> u32 {
        if !opt_inline_except {
            return 0;
        }
        let Some(scope) = self.get(id) else {
            return 0;
        };
        *scope.lock_stack_size.get_or_init(|| {
            let mut current = Some(id);
            while let Some(cur) = current.and_then(|c| self.get(c)) {
                let handles = model
                    .method(cur.method)
                    .is_some_and(|m| m.has_exception_handlers() || m.is_synchronized);
                if handles {
                    return cur.caller_stack_size;
                }
                current = cur.caller;
            }
            0
        })
    }

    /// Position of the invoke that inlined `id`, shared by every position
    /// inside the scope. `None` for the root.
    pub fn call_site_position(&self, id: ScopeId) -> Option<Arc<CodePos>> {
        let scope = self.get(id)?;
        scope
            .call_site
            .get_or_init(|| {
                let caller = scope.caller?;
                Some(self.to_code_pos(caller, scope.caller_bci))
            })
            .clone()
    }

    /// Position of `bci` in scope `id`, with its full inlining chain.
    pub fn to_code_pos(&self, id: ScopeId, bci: i32) -> Arc<CodePos> {
        let method = self.get(id).map_or(MethodId(0), |s| s.method);
        Arc::new(CodePos::new(self.call_site_position(id), method, bci))
    }
}
