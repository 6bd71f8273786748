//! Scope records and the arena that owns them.
//!
//! Scope-forming nodes (program root, function bodies, blocks, catch
//! clauses) each get one [`ScopeRecord`]; the tree stores only the arena
//! index. Bindings keep their original name for lexical lookup and gain a
//! globally unique name during disambiguation.

use jetsam_types::estree::ScopeId;
use jetsam_types::Span;
use std::collections::HashMap;

/// What kind of syntax node formed a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// The program root. `var` and function declarations at the top level
    /// hoist here.
    Root,
    /// A function body (declaration, expression, or arrow).
    Function,
    /// A block, or the implicit scope of a `for` init clause.
    Block,
    /// A catch clause; holds the catch binding.
    Catch,
}

/// How a name was introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Var,
    Let,
    Const,
    Param,
    Function,
    Catch,
}

impl BindingKind {
    /// Whether this binding hoists to the nearest function scope.
    pub fn hoists(self) -> bool {
        matches!(self, BindingKind::Var | BindingKind::Function)
    }
}

/// One declared name.
#[derive(Debug, Clone)]
pub struct Binding {
    /// The source-level name.
    pub name: String,
    /// The globally unique name (`base` or `base#N`), assigned in pass 2.
    pub unique: String,
    pub kind: BindingKind,
    pub span: Span,
    /// Set when an inner function references this binding; the generator
    /// then allocates a heap cell instead of a plain local.
    pub captured: bool,
}

/// The scope record attached to one scope-forming node.
#[derive(Debug)]
pub struct ScopeRecord {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    bindings: Vec<Binding>,
    by_name: HashMap<String, usize>,
    /// For Function/Root scopes: unique names of variables referenced here
    /// (or in nested functions) but declared in an outer function, in
    /// first-use order. Drives closure environment layout.
    pub free_vars: Vec<String>,
}

impl ScopeRecord {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            bindings: Vec::new(),
            by_name: HashMap::new(),
            free_vars: Vec::new(),
        }
    }

    /// The bindings of this scope in declaration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Look up a binding by its source-level name.
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.by_name.get(name).map(|&i| &self.bindings[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Binding> {
        let i = *self.by_name.get(name)?;
        Some(&mut self.bindings[i])
    }

    fn insert(&mut self, binding: Binding) {
        self.by_name.insert(binding.name.clone(), self.bindings.len());
        self.bindings.push(binding);
    }
}

/// Arena of scope records; [`ScopeId`] values index into it.
#[derive(Debug, Default)]
pub struct ScopeArena {
    scopes: Vec<ScopeRecord>,
    /// unique name → (scope, binding index), filled during disambiguation.
    by_unique: HashMap<String, (ScopeId, usize)>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: ScopeKind, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(ScopeRecord::new(kind, parent));
        id
    }

    pub fn get(&self, id: ScopeId) -> &ScopeRecord {
        &self.scopes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut ScopeRecord {
        &mut self.scopes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Walk up to the nearest Function or Root scope (inclusive).
    pub fn function_scope_of(&self, mut id: ScopeId) -> ScopeId {
        loop {
            let record = self.get(id);
            match record.kind {
                ScopeKind::Function | ScopeKind::Root => return id,
                _ => id = record.parent.expect("non-root scope without parent"),
            }
        }
    }

    /// Innermost-first lexical lookup by source-level name.
    pub fn lookup(&self, from: ScopeId, name: &str) -> Option<(ScopeId, &Binding)> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if let Some(b) = self.get(id).get(name) {
                return Some((id, b));
            }
            cursor = self.get(id).parent;
        }
        None
    }

    /// Declare a binding. Returns `false` when the name is already present
    /// in `scope` and neither side is a hoisting redeclaration.
    pub(crate) fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: BindingKind,
        span: Span,
    ) -> bool {
        if let Some(existing) = self.get(scope).get(name) {
            // `var x; var x` and `var x` over a param are legal re-uses.
            let compatible = existing.kind.hoists() && kind.hoists()
                || existing.kind == BindingKind::Param && kind == BindingKind::Var;
            if compatible {
                if kind == BindingKind::Function {
                    self.get_mut(scope).get_mut(name).expect("just found").kind = kind;
                }
                return true;
            }
            return false;
        }
        self.get_mut(scope).insert(Binding {
            name: name.to_string(),
            unique: String::new(),
            kind,
            span,
            captured: false,
        });
        true
    }

    pub(crate) fn set_unique(&mut self, scope: ScopeId, name: &str, unique: String) {
        let idx = *self
            .get(scope)
            .by_name
            .get(name)
            .expect("binding declared in pass 1");
        self.by_unique.insert(unique.clone(), (scope, idx));
        self.scopes[scope.0 as usize].bindings[idx].unique = unique;
    }

    pub(crate) fn mark_captured(&mut self, scope: ScopeId, name: &str) {
        if let Some(b) = self.get_mut(scope).get_mut(name) {
            b.captured = true;
        }
    }

    pub(crate) fn add_free_var(&mut self, fn_scope: ScopeId, unique: &str) {
        let record = self.get_mut(fn_scope);
        if !record.free_vars.iter().any(|f| f == unique) {
            record.free_vars.push(unique.to_string());
        }
    }

    /// Look up a binding by its unique name.
    pub fn binding_by_unique(&self, unique: &str) -> Option<&Binding> {
        let &(scope, idx) = self.by_unique.get(unique)?;
        Some(&self.scopes[scope.0 as usize].bindings[idx])
    }

    /// All bindings whose storage lives in the frame of `fn_scope`:
    /// the function scope's own bindings plus those of nested blocks and
    /// catch clauses, excluding anything inside nested functions.
    /// Returned in scope-allocation order, then declaration order.
    pub fn frame_bindings(&self, fn_scope: ScopeId) -> Vec<&Binding> {
        let mut out = Vec::new();
        for (i, record) in self.scopes.iter().enumerate() {
            let id = ScopeId(i as u32);
            if self.function_scope_of(id) == fn_scope
                && (id == fn_scope || record.kind != ScopeKind::Function && record.kind != ScopeKind::Root)
            {
                out.extend(record.bindings.iter());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_outward() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(ScopeKind::Root, None);
        let inner = arena.alloc(ScopeKind::Block, Some(root));
        assert!(arena.declare(root, "x", BindingKind::Var, Span::UNKNOWN));
        let (found, _) = arena.lookup(inner, "x").expect("x visible from inner");
        assert_eq!(found, root);
        assert!(arena.lookup(inner, "y").is_none());
    }

    #[test]
    fn test_shadowing_resolves_innermost() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(ScopeKind::Root, None);
        let inner = arena.alloc(ScopeKind::Block, Some(root));
        arena.declare(root, "x", BindingKind::Var, Span::UNKNOWN);
        arena.declare(inner, "x", BindingKind::Let, Span::UNKNOWN);
        let (found, b) = arena.lookup(inner, "x").unwrap();
        assert_eq!(found, inner);
        assert_eq!(b.kind, BindingKind::Let);
    }

    #[test]
    fn test_var_redeclaration_is_compatible() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(ScopeKind::Root, None);
        assert!(arena.declare(root, "x", BindingKind::Var, Span::UNKNOWN));
        assert!(arena.declare(root, "x", BindingKind::Var, Span::UNKNOWN));
        assert!(!arena.declare(root, "x", BindingKind::Let, Span::UNKNOWN));
        assert_eq!(arena.get(root).bindings().len(), 1);
    }

    #[test]
    fn test_function_scope_of_skips_blocks() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(ScopeKind::Root, None);
        let f = arena.alloc(ScopeKind::Function, Some(root));
        let b1 = arena.alloc(ScopeKind::Block, Some(f));
        let b2 = arena.alloc(ScopeKind::Catch, Some(b1));
        assert_eq!(arena.function_scope_of(b2), f);
        assert_eq!(arena.function_scope_of(root), root);
    }

    #[test]
    fn test_frame_bindings_excludes_nested_functions() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(ScopeKind::Root, None);
        let f = arena.alloc(ScopeKind::Function, Some(root));
        let block = arena.alloc(ScopeKind::Block, Some(f));
        let nested = arena.alloc(ScopeKind::Function, Some(block));
        arena.declare(f, "a", BindingKind::Param, Span::UNKNOWN);
        arena.declare(block, "b", BindingKind::Let, Span::UNKNOWN);
        arena.declare(nested, "c", BindingKind::Var, Span::UNKNOWN);
        let names: Vec<_> = arena.frame_bindings(f).iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
