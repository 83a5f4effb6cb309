//! The tracing JIT
//!
//! [`SymbolicJit`] sits in front of every user-function call as the
//! interpreter's [`FrameHook`]. Each code object keeps a short list of
//! guarded translations; a call runs the first one whose guard holds for
//! its frame, and translates anew when none does. Functions the translator
//! cannot handle are remembered with an always-true guard and no code, so
//! they run untraced without being translated again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::bytecode::CodeObject;
use crate::config::JitConfig;
use crate::error::TraceError;
use crate::executor::{translate, FrameView, GuardExpr, TraceContext};
use crate::vm::{FrameHook, Function, Interpreter, ModuleRegistry, Value};

/// Generated loop functions run as part of their caller's translation and
/// are never traced on their own
const UNTRACED_PREFIXES: &[&str] = &["__for_loop_", "__loop_body_"];

/// Code id, plus the function id when the code closes over cells
type CodeKey = (u64, u64);

struct CacheEntry {
    guard: GuardExpr,
    /// `None` marks a function that runs untraced
    code: Option<Arc<CodeObject>>,
}

/// Counters updated on every hooked call
#[derive(Debug, Default)]
pub struct JitStats {
    calls: AtomicU64,
    cache_hits: AtomicU64,
    translations: AtomicU64,
    graph_breaks: AtomicU64,
    fallbacks: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`JitStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStatsSnapshot {
    pub calls: u64,
    pub cache_hits: u64,
    pub translations: u64,
    pub graph_breaks: u64,
    pub fallbacks: u64,
    pub skipped: u64,
}

impl JitStats {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JitStatsSnapshot {
        JitStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            translations: self.translations.load(Ordering::Relaxed),
            graph_breaks: self.graph_breaks.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct SymbolicJit {
    ctx: TraceContext,
    entries: DashMap<CodeKey, Vec<CacheEntry>>,
    stats: JitStats,
}

impl SymbolicJit {
    pub fn new(config: JitConfig, modules: Arc<ModuleRegistry>) -> Self {
        Self::with_context(TraceContext::new(config, modules))
    }

    pub fn with_context(ctx: TraceContext) -> Self {
        Self {
            ctx,
            entries: DashMap::new(),
            stats: JitStats::default(),
        }
    }

    pub fn context(&self) -> &TraceContext {
        &self.ctx
    }

    pub fn config(&self) -> &JitConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> JitStatsSnapshot {
        self.stats.snapshot()
    }

    /// Guarded entries cached for `function`'s code
    pub fn cached_entries(&self, function: &Function) -> usize {
        self.entries.get(&Self::key(function)).map_or(0, |entries| entries.len())
    }

    /// Forget every translation
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn key(function: &Function) -> CodeKey {
        let closure_id = if function.code.has_free_vars() { function.id } else { 0 };
        (function.code.id(), closure_id)
    }

    /// Record a translation of this frame and return the code to run.
    ///
    /// Lookup and translation run without the entry lock held, so another
    /// thread may have cached a matching entry in the meantime; that entry
    /// wins. The size limit is checked again under the lock.
    fn insert(
        &self,
        key: CodeKey,
        function: &Function,
        args: &[Value],
        guard: GuardExpr,
        code: Option<Arc<CodeObject>>,
    ) -> Option<Arc<CodeObject>> {
        let mut entries = self.entries.entry(key).or_default();
        let frame = FrameView::new(function, args);
        if let Some(existing) = entries.iter().find(|entry| entry.guard.evaluate(&frame)) {
            return existing.code.clone();
        }
        if entries.len() < self.ctx.config.cache_size_limit {
            entries.push(CacheEntry {
                guard,
                code: code.clone(),
            });
        }
        code
    }

    /// First entry whose guard holds for this frame
    fn lookup(&self, key: CodeKey, function: &Function, args: &[Value]) -> Lookup {
        let Some(entries) = self.entries.get(&key) else {
            return Lookup::Miss;
        };
        let frame = FrameView::new(function, args);
        if let Some(entry) = entries.iter().find(|entry| entry.guard.evaluate(&frame)) {
            return Lookup::Hit(entry.code.clone());
        }
        if entries.len() >= self.ctx.config.cache_size_limit {
            return Lookup::Full;
        }
        Lookup::Miss
    }
}

enum Lookup {
    Hit(Option<Arc<CodeObject>>),
    Full,
    Miss,
}

impl FrameHook for SymbolicJit {
    fn on_frame(&self, function: &Arc<Function>, args: &[Value]) -> Option<Arc<CodeObject>> {
        JitStats::bump(&self.stats.calls);
        let name = function.code.name.as_str();
        if UNTRACED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            JitStats::bump(&self.stats.skipped);
            return None;
        }

        let key = Self::key(function);
        match self.lookup(key, function, args) {
            Lookup::Hit(code) => {
                JitStats::bump(&self.stats.cache_hits);
                trace!(target: "symtrace::jit", function = name, traced = code.is_some(), "Cache hit");
                return code;
            }
            Lookup::Full => {
                JitStats::bump(&self.stats.skipped);
                debug!(
                    target: "symtrace::jit",
                    function = name,
                    limit = self.ctx.config.cache_size_limit,
                    "Cache size limit reached, running untraced"
                );
                return None;
            }
            Lookup::Miss => {}
        }

        match translate(function, args, &self.ctx) {
            Ok(translation) => {
                JitStats::bump(&self.stats.translations);
                if translation.graph_break {
                    JitStats::bump(&self.stats.graph_breaks);
                }
                debug!(
                    target: "symtrace::jit",
                    function = name,
                    statements = translation.statements,
                    graph_break = translation.graph_break,
                    guards = translation.guard.len(),
                    "Translated"
                );
                self.insert(key, function, args, translation.guard, Some(translation.code))
            }
            Err(err @ (TraceError::NotImplemented(_) | TraceError::Inner(_))) => {
                JitStats::bump(&self.stats.fallbacks);
                warn!(target: "symtrace::jit", function = name, error = %err, "Translation failed, running untraced");
                self.insert(key, function, args, GuardExpr::True, None)
            }
            Err(err) => {
                // Running the original code raises the same error to the caller.
                JitStats::bump(&self.stats.fallbacks);
                warn!(target: "symtrace::jit", function = name, error = %err, "Translation failed");
                None
            }
        }
    }
}

/// Install a fresh JIT as `vm`'s frame hook, sharing its module registry
pub fn install(vm: &Interpreter, config: JitConfig) -> Arc<SymbolicJit> {
    let jit = Arc::new(SymbolicJit::new(config, vm.modules().clone()));
    vm.set_hook(Some(jit.clone()));
    jit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::assemble_function;
    use crate::tensor::{DType, Tensor};
    use crate::vm::Globals;

    fn tensor(shape: &[usize]) -> Value {
        let numel = shape.iter().product();
        Value::tensor(Tensor::from_vec(vec![1.0; numel], shape, DType::Float32).expect("tensor"))
    }

    #[test]
    fn test_guarded_entries_are_reused() {
        let vm = Interpreter::new();
        let jit = install(&vm, JitConfig::default());
        let function = assemble_function(
            ".args x\n    LOAD_FAST x\n    LOAD_CONST 1\n    BINARY_ADD\n    RETURN_VALUE\n",
            &Globals::new(),
        )
        .expect("assembles");

        vm.call_function(&function, vec![tensor(&[2])]).expect("runs");
        vm.call_function(&function, vec![tensor(&[2])]).expect("runs");
        vm.call_function(&function, vec![tensor(&[3])]).expect("runs");

        let stats = jit.stats();
        assert_eq!(stats.calls, 3);
        assert_eq!(stats.translations, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(jit.cached_entries(&function), 2);
    }

    #[test]
    fn test_cache_size_limit() {
        let vm = Interpreter::new();
        let config = JitConfig {
            cache_size_limit: 1,
            ..JitConfig::default()
        };
        let jit = install(&vm, config);
        let function = assemble_function(
            ".args x\n    LOAD_FAST x\n    LOAD_CONST 2\n    BINARY_MULTIPLY\n    RETURN_VALUE\n",
            &Globals::new(),
        )
        .expect("assembles");

        vm.call_function(&function, vec![tensor(&[1])]).expect("runs");
        let result = vm.call_function(&function, vec![tensor(&[4])]).expect("runs untraced");
        assert_eq!(result.as_tensor().map(|t| t.data().to_vec()), Some(vec![2.0; 4]));
        assert_eq!(jit.stats().skipped, 1);
        assert_eq!(jit.cached_entries(&function), 1);
    }

    #[test]
    fn test_unsupported_function_is_remembered() {
        let vm = Interpreter::new();
        let config = JitConfig {
            max_trace_steps: 1,
            ..JitConfig::default()
        };
        let jit = install(&vm, config);
        let function = assemble_function(
            ".args x\n    LOAD_FAST x\n    LOAD_CONST 1\n    BINARY_ADD\n    RETURN_VALUE\n",
            &Globals::new(),
        )
        .expect("assembles");

        assert!(matches!(vm.call_function(&function, vec![Value::Int(1)]), Ok(Value::Int(2))));
        assert!(matches!(vm.call_function(&function, vec![Value::Int(5)]), Ok(Value::Int(6))));
        let stats = jit.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.translations, 0);
    }

    #[test]
    fn test_loop_functions_are_not_traced() {
        let jit = SymbolicJit::new(JitConfig::default(), Arc::new(ModuleRegistry::with_stdlib()));
        let function = assemble_function(
            ".name __loop_body_7\n.args x\n    LOAD_FAST x\n    RETURN_VALUE\n",
            &Globals::new(),
        )
        .expect("assembles");
        assert!(jit.on_frame(&function, &[Value::Int(1)]).is_none());
        assert_eq!(jit.stats().skipped, 1);
    }

    #[test]
    fn test_racing_inserts_keep_one_entry() {
        let jit = SymbolicJit::new(JitConfig::default(), Arc::new(ModuleRegistry::with_stdlib()));
        let function = assemble_function(".args x\n    LOAD_FAST x\n    RETURN_VALUE\n", &Globals::new())
            .expect("assembles");
        let args = [tensor(&[2])];
        let key = SymbolicJit::key(&function);

        let first = jit.insert(key, &function, &args, GuardExpr::True, Some(function.code.clone()));
        let second = jit.insert(key, &function, &args, GuardExpr::True, None);
        assert!(first.is_some());
        assert!(second.is_some(), "the entry cached first wins");
        assert_eq!(jit.cached_entries(&function), 1);
    }

    #[test]
    fn test_concurrent_first_calls_respect_the_limit() {
        let config = JitConfig {
            cache_size_limit: 1,
            ..JitConfig::default()
        };
        let jit = SymbolicJit::new(config, Arc::new(ModuleRegistry::with_stdlib()));
        let function = assemble_function(
            ".args x\n    LOAD_FAST x\n    LOAD_CONST 3\n    BINARY_MULTIPLY\n    RETURN_VALUE\n",
            &Globals::new(),
        )
        .expect("assembles");

        std::thread::scope(|scope| {
            for n in 0..8 {
                let (jit, function) = (&jit, &function);
                scope.spawn(move || {
                    jit.on_frame(function, &[tensor(&[1 + n % 2])]);
                });
            }
        });
        assert_eq!(jit.cached_entries(&function), 1);
    }
}
