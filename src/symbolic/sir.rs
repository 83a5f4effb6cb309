//! Statement IR
//!
//! The ordered list of tensor operations recorded during a trace. Symbols
//! name values; constant operands are baked into the statement. Two
//! programs that differ only in symbol names hash identically, while a
//! change of statement order, operation or constant changes the hash.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;

use crate::error::{TraceError, TraceResult};
use crate::tensor::{ConstArg, TensorOp};

/// Name of a value inside a statement program
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Symbol(Symbol),
    Const(ConstArg),
}

impl Operand {
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Operand::Symbol(symbol) => Some(symbol),
            Operand::Const(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Symbol(symbol) => write!(f, "{}", symbol),
            Operand::Const(value) => write!(f, "{}", value),
        }
    }
}

/// `output = op(inputs..)`
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub op: TensorOp,
    pub inputs: SmallVec<[Operand; 4]>,
    pub output: Symbol,
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}({})", self.output, self.op, self.inputs.iter().join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementIr {
    pub name: String,
    pub inputs: Vec<Symbol>,
    pub statements: Vec<Statement>,
    pub outputs: Vec<Symbol>,
}

impl StatementIr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            statements: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Structural hash, invariant under consistent renaming of symbols
    pub fn structural_hash(&self) -> u64 {
        let mut renames: HashMap<&Symbol, usize> = HashMap::new();
        let mut hasher = DefaultHasher::new();

        self.inputs.len().hash(&mut hasher);
        for symbol in &self.inputs {
            let next = renames.len();
            renames.entry(symbol).or_insert(next);
        }
        self.statements.len().hash(&mut hasher);
        for statement in &self.statements {
            statement.op.hash(&mut hasher);
            statement.inputs.len().hash(&mut hasher);
            for operand in &statement.inputs {
                match operand {
                    Operand::Symbol(symbol) => {
                        0u8.hash(&mut hasher);
                        hash_symbol(symbol, &renames, &mut hasher);
                    }
                    Operand::Const(value) => {
                        1u8.hash(&mut hasher);
                        value.hash(&mut hasher);
                    }
                }
            }
            let next = renames.len();
            renames.entry(&statement.output).or_insert(next);
        }
        self.outputs.len().hash(&mut hasher);
        for symbol in &self.outputs {
            hash_symbol(symbol, &renames, &mut hasher);
        }
        hasher.finish()
    }

    /// Check that every symbol is defined before use and outputs exist
    pub fn validate(&self) -> TraceResult<()> {
        let mut defined: HashMap<&Symbol, ()> = self.inputs.iter().map(|s| (s, ())).collect();
        if defined.len() != self.inputs.len() {
            return Err(TraceError::Inner(format!("{}: duplicate input symbol", self.name)));
        }
        for statement in &self.statements {
            for symbol in statement.inputs.iter().filter_map(Operand::as_symbol) {
                if !defined.contains_key(symbol) {
                    return Err(TraceError::Inner(format!(
                        "{}: symbol {} used before definition in `{}`",
                        self.name, symbol, statement
                    )));
                }
            }
            if defined.insert(&statement.output, ()).is_some() {
                return Err(TraceError::Inner(format!(
                    "{}: symbol {} assigned twice",
                    self.name, statement.output
                )));
            }
        }
        if let Some(missing) = self.outputs.iter().find(|s| !defined.contains_key(s)) {
            return Err(TraceError::Inner(format!("{}: output {} is never defined", self.name, missing)));
        }
        Ok(())
    }
}

/// Hash a symbol by its first-definition index. Undefined symbols hash by
/// name so a broken program never collides with a well-formed one.
fn hash_symbol(symbol: &Symbol, renames: &HashMap<&Symbol, usize>, hasher: &mut DefaultHasher) {
    match renames.get(symbol) {
        Some(index) => index.hash(hasher),
        None => {
            usize::MAX.hash(hasher);
            symbol.hash(hasher);
        }
    }
}

impl fmt::Display for StatementIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StatementIR: {}", self.name)?;
        writeln!(f, "  inputs: [{}]", self.inputs.iter().join(", "))?;
        writeln!(f, "  outputs: [{}]", self.outputs.iter().join(", "))?;
        writeln!(f, "  statements:")?;
        for statement in &self.statements {
            writeln!(f, "    {}", statement)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn add_one(prefix: &str, op: TensorOp) -> StatementIr {
        let x = Symbol::new(&format!("{}0", prefix));
        let y = Symbol::new(&format!("{}1", prefix));
        StatementIr {
            name: format!("SIR_{}", prefix),
            inputs: vec![x.clone()],
            statements: vec![Statement {
                op,
                inputs: smallvec![Operand::Symbol(x), Operand::Const(ConstArg::Int(1))],
                output: y.clone(),
            }],
            outputs: vec![y],
        }
    }

    #[test]
    fn test_hash_ignores_symbol_names() {
        assert_eq!(
            add_one("var_", TensorOp::Add).structural_hash(),
            add_one("t", TensorOp::Add).structural_hash()
        );
        assert_ne!(
            add_one("var_", TensorOp::Add).structural_hash(),
            add_one("var_", TensorOp::Subtract).structural_hash()
        );
    }

    #[test]
    fn test_hash_is_order_sensitive() {
        let mut sir = add_one("v", TensorOp::Add);
        let x = sir.inputs[0].clone();
        sir.statements.push(Statement {
            op: TensorOp::Relu,
            inputs: smallvec![Operand::Symbol(x.clone())],
            output: Symbol::new("v2"),
        });
        let mut swapped = sir.clone();
        swapped.statements.swap(0, 1);
        assert_ne!(sir.structural_hash(), swapped.structural_hash());
    }

    #[test]
    fn test_hash_sees_constants() {
        let mut sir = add_one("v", TensorOp::Add);
        let before = sir.structural_hash();
        sir.statements[0].inputs[1] = Operand::Const(ConstArg::Int(2));
        assert_ne!(before, sir.structural_hash());
    }

    #[test]
    fn test_validate() {
        assert!(add_one("v", TensorOp::Add).validate().is_ok());
        let mut broken = add_one("v", TensorOp::Add);
        broken.inputs.clear();
        assert!(matches!(broken.validate(), Err(TraceError::Inner(_))));
        let mut dangling = add_one("v", TensorOp::Add);
        dangling.outputs.push(Symbol::new("ghost"));
        assert!(dangling.validate().is_err());
    }

    #[test]
    fn test_display() {
        let text = add_one("var_", TensorOp::Add).to_string();
        assert!(text.contains("StatementIR: SIR_var_"));
        assert!(text.contains("var_1 = add(var_0, 1)"));
    }
}
