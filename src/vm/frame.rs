//! Activation records of the guest interpreter.

use std::sync::Arc;

use crate::bytecode::CodeObject;

use super::types::{VmError, VmResult};
use super::value::{Cell, Function, Value};

/// One executing guest frame
#[derive(Debug)]
pub struct Frame {
    pub function: Arc<Function>,
    pub code: Arc<CodeObject>,
    pub locals: Vec<Option<Value>>,
    /// Cell variables, then the closure's free variables
    pub cells: Vec<Arc<Cell>>,
    pub stack: Vec<Value>,
    /// Index of the next instruction
    pub ip: usize,
}

impl Frame {
    /// Bind arguments to a fresh frame running `code` on behalf of `function`.
    ///
    /// Arguments are matched against `code`'s parameters, which may differ
    /// from the function's own code when a translated replacement runs.
    /// Missing trailing arguments are taken from the function's defaults.
    pub fn new(function: Arc<Function>, code: Arc<CodeObject>, mut args: Vec<Value>) -> VmResult<Self> {
        let argcount = code.argcount as usize;
        if args.len() < argcount {
            let missing = argcount - args.len();
            if missing > function.defaults.len() {
                return Err(VmError::TypeError(format!(
                    "{}() takes {} positional arguments but {} were given",
                    function.name,
                    argcount,
                    args.len()
                )));
            }
            let defaults = &function.defaults[function.defaults.len() - missing..];
            args.extend(defaults.iter().cloned());
        }
        if args.len() > argcount {
            return Err(VmError::TypeError(format!(
                "{}() takes {} positional arguments but {} were given",
                function.name,
                argcount,
                args.len()
            )));
        }

        let mut locals: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        locals.resize(code.varnames.len(), None);

        // A cell variable that is also a parameter starts with the argument.
        let mut cells: Vec<Arc<Cell>> = code
            .cellvars
            .iter()
            .map(|name| {
                let initial = code.varnames[..argcount]
                    .iter()
                    .position(|param| param == name)
                    .and_then(|index| locals[index].clone());
                Arc::new(Cell::new(initial))
            })
            .collect();
        if function.closure.len() != code.freevars.len() {
            return Err(VmError::Runtime(format!(
                "{} expects {} closure cells, got {}",
                code.name,
                code.freevars.len(),
                function.closure.len()
            )));
        }
        cells.extend(function.closure.iter().cloned());

        Ok(Self {
            stack: Vec::with_capacity(code.stacksize as usize),
            function,
            code,
            locals,
            cells,
            ip: 0,
        })
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Pop `n` values, bottom first
    pub fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if n > self.stack.len() {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    #[inline]
    pub fn peek(&self) -> VmResult<&Value> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    pub fn local(&self, index: usize) -> VmResult<Value> {
        self.locals
            .get(index)
            .cloned()
            .flatten()
            .ok_or_else(|| VmError::UnboundLocal(self.local_name(index)))
    }

    pub fn local_name(&self, index: usize) -> String {
        self.code.varnames.get(index).cloned().unwrap_or_else(|| format!("<local {}>", index))
    }

    pub fn cell(&self, index: usize) -> VmResult<&Arc<Cell>> {
        self.cells
            .get(index)
            .ok_or_else(|| VmError::Runtime(format!("cell index {} out of range", index)))
    }

    pub fn cell_name(&self, index: usize) -> String {
        self.code
            .cell_or_free_name(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<cell {}>", index))
    }

    /// Replace every reference to `old` held by this frame with `new`
    pub fn rebind(&mut self, old: &Value, new: &Value) {
        let Some(identity) = old.identity() else {
            return;
        };
        let same = |v: &Value| v.identity() == Some(identity);
        for slot in self.stack.iter_mut() {
            if same(slot) {
                *slot = new.clone();
            }
        }
        for slot in self.locals.iter_mut().flatten() {
            if same(slot) {
                *slot = new.clone();
            }
        }
        for cell in &self.cells {
            if cell.get().as_ref().is_some_and(same) {
                cell.set(new.clone());
            }
        }
    }
}
