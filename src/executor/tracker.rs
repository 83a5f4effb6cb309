//! Provenance of symbolic values
//!
//! A [`Tracker`] records where a value came from. Values loaded from the
//! frame can be re-derived at call time, which is what guards check and how
//! generated code reloads them. Values computed during the trace carry a
//! [`Tracker::DerivedCall`] with their inputs instead; they have no frame
//! path and asking them for one is an internal error.

use std::fmt;

use crate::bytecode::CodeGen;
use crate::error::{TraceError, TraceResult};
use crate::vm::Value;

use super::guard::FrameExpr;
use super::variables::Variable;

#[derive(Clone)]
pub enum Tracker {
    /// A literal baked into the generated code
    Const(Value),
    Local(String),
    Global(String),
    Builtin(String),
    /// Closure cell of the traced function
    Deref(String),
    GetAttr { base: Box<Tracker>, attr: String },
    GetItem { base: Box<Tracker>, key: Value },
    /// Computed during the trace from `inputs`
    DerivedCall { inputs: Vec<Variable> },
}

impl Tracker {
    pub fn derived(inputs: &[Variable]) -> Self {
        Tracker::DerivedCall {
            inputs: inputs.to_vec(),
        }
    }

    /// Tracker of `parent.attr`: a frame path when the parent has one
    pub fn attr(parent: &Variable, attr: &str) -> Self {
        if parent.tracker().is_traceable() {
            Tracker::GetAttr {
                base: Box::new(parent.tracker().clone()),
                attr: attr.to_string(),
            }
        } else {
            Tracker::derived(std::slice::from_ref(parent))
        }
    }

    /// Tracker of `parent[key]`
    pub fn item(parent: &Variable, key: Value) -> Self {
        if parent.tracker().is_traceable() {
            Tracker::GetItem {
                base: Box::new(parent.tracker().clone()),
                key,
            }
        } else {
            Tracker::derived(std::slice::from_ref(parent))
        }
    }

    /// Tracker of the element `item` stored at `parent[key]` of a container
    /// being classified
    pub fn element(parent: &Tracker, key: Value, item: &Value) -> Self {
        match parent {
            Tracker::Const(_) => Tracker::Const(item.clone()),
            _ if parent.is_traceable() => Tracker::GetItem {
                base: Box::new(parent.clone()),
                key,
            },
            _ => Tracker::derived(&[]),
        }
    }

    /// Whether the value can be re-derived without replaying the trace
    pub fn is_traceable(&self) -> bool {
        match self {
            Tracker::DerivedCall { .. } => false,
            Tracker::GetAttr { base, .. } | Tracker::GetItem { base, .. } => base.is_traceable(),
            _ => true,
        }
    }

    /// Whether the value depends on the frame, so it needs a guard.
    ///
    /// Paths rooted at a baked constant never change between calls.
    pub fn is_frame_dependent(&self) -> bool {
        match self {
            Tracker::Local(_) | Tracker::Global(_) | Tracker::Builtin(_) | Tracker::Deref(_) => true,
            Tracker::GetAttr { base, .. } | Tracker::GetItem { base, .. } => base.is_frame_dependent(),
            Tracker::Const(_) | Tracker::DerivedCall { .. } => false,
        }
    }

    /// Variables this value was computed from
    pub fn inputs(&self) -> &[Variable] {
        match self {
            Tracker::DerivedCall { inputs } => inputs,
            _ => &[],
        }
    }

    /// Expression that re-derives the value from a frame
    pub fn trace_value_from_frame(&self) -> TraceResult<FrameExpr> {
        Ok(match self {
            Tracker::Const(value) => FrameExpr::Const(value.clone()),
            Tracker::Local(name) => FrameExpr::Local(name.clone()),
            Tracker::Global(name) => FrameExpr::Global(name.clone()),
            Tracker::Builtin(name) => FrameExpr::Builtin(name.clone()),
            Tracker::Deref(name) => FrameExpr::Deref(name.clone()),
            Tracker::GetAttr { base, attr } => FrameExpr::Attr(Box::new(base.trace_value_from_frame()?), attr.clone()),
            Tracker::GetItem { base, key } => FrameExpr::Item(Box::new(base.trace_value_from_frame()?), key.clone()),
            Tracker::DerivedCall { .. } => {
                return Err(TraceError::Inner(
                    "value computed during the trace has no frame path".into(),
                ))
            }
        })
    }

    /// Emit instructions that reload the value in generated code
    pub fn gen_instructions(&self, codegen: &mut CodeGen) -> TraceResult<()> {
        match self {
            Tracker::Const(value) => {
                codegen.gen_load_const(value.clone());
            }
            Tracker::Local(name) => {
                codegen.gen_load_fast(name);
            }
            Tracker::Global(name) | Tracker::Builtin(name) => {
                codegen.gen_load_global(name);
            }
            Tracker::Deref(name) => {
                codegen.gen_load_deref(name);
            }
            Tracker::GetAttr { base, attr } => {
                base.gen_instructions(codegen)?;
                codegen.gen_load_attr(attr);
            }
            Tracker::GetItem { base, key } => {
                base.gen_instructions(codegen)?;
                codegen.gen_load_const(key.clone());
                codegen.gen_subscribe();
            }
            Tracker::DerivedCall { .. } => {
                return Err(TraceError::Inner("cannot reload a value computed during the trace".into()))
            }
        }
        Ok(())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Tracker::Const(_) => "ConstTracker",
            Tracker::Local(_) => "LocalTracker",
            Tracker::Global(_) => "GlobalTracker",
            Tracker::Builtin(_) => "BuiltinTracker",
            Tracker::Deref(_) => "DerefTracker",
            Tracker::GetAttr { .. } => "GetAttrTracker",
            Tracker::GetItem { .. } => "GetItemTracker",
            Tracker::DerivedCall { .. } => "DerivedCallTracker",
        }
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.trace_value_from_frame() {
            Ok(expr) => write!(f, "{}({})", self.kind_name(), expr),
            Err(_) => write!(f, "{}({} inputs)", self.kind_name(), self.inputs().len()),
        }
    }
}
