//! Plugin bytecode format and loader.
//!
//! The bytecode format is a compact representation of compiled plugin code,
//! executed by the sandboxed interpreter in [`crate::vm`].
//!
//! ## Format
//!
//! ```text
//! +----------------+
//! | Magic (4 bytes)|  "LBC\x01" (optional)
//! +----------------+
//! | Module (JSON)  |  version, metadata, constants, functions, entry point
//! +----------------+
//! ```
//!
//! Jump offsets are relative to the instruction following the jump.

use crate::error::LoadError;
use crate::vm::VmLimits;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Magic bytes for bytecode files.
pub const MAGIC: &[u8; 4] = b"LBC\x01";

/// Bytecode format version understood by the interpreter.
pub const FORMAT_VERSION: u8 = 1;

/// A compiled plugin module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bytecode {
    /// Version of the bytecode format.
    pub version: u8,

    /// Plugin metadata embedded in bytecode.
    pub metadata: BytecodeMetadata,

    /// Constant pool.
    pub constants: Vec<Constant>,

    /// Function definitions.
    pub functions: Vec<Function>,

    /// Entry point function name. Evaluated once when the module loads and
    /// expected to return the hook export table.
    pub entry_point: String,
}

/// Metadata embedded in bytecode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BytecodeMetadata {
    pub plugin_id: String,
    pub plugin_version: String,
    #[serde(default)]
    pub compiled_at: Option<String>,
    #[serde(default)]
    pub compiler_version: Option<String>,
}

/// A constant value in the constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Constant {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Constant::Null => serde_json::Value::Null,
            Constant::Bool(b) => serde_json::Value::Bool(*b),
            Constant::Int(i) => serde_json::Value::from(*i),
            Constant::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Constant::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// A function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,

    /// Parameter names. Arguments occupy the first locals.
    pub params: Vec<String>,

    pub instructions: Vec<Instruction>,

    /// Local variable count, parameters included.
    pub local_count: usize,
}

/// A bytecode instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Instruction {
    /// Load a constant from the pool.
    LoadConst { index: usize },

    /// Load a local variable.
    LoadLocal { index: usize },

    /// Store to a local variable.
    StoreLocal { index: usize },

    /// Load a module global.
    LoadGlobal { name: String },

    /// Store to a module global. Writes during a hook call are visible for
    /// that call only.
    StoreGlobal { name: String },

    /// Call a module function or host builtin.
    Call { name: String, arg_count: usize },

    /// Call a method on the value below the arguments.
    CallMethod { name: String, arg_count: usize },

    /// Return the top of stack (or null) from the function.
    Return,

    /// Jump by offset.
    Jump { offset: i32 },

    /// Pop and jump by offset if the value is falsy.
    JumpIfFalse { offset: i32 },

    Pop,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    And,
    Or,

    /// Create array from N items on stack.
    MakeArray { count: usize },

    /// Create object from N key-value pairs on stack.
    MakeObject { count: usize },

    /// Get property from object.
    GetProperty { name: String },

    /// Set property on object, leaving the updated object on the stack.
    SetProperty { name: String },

    /// Get index from array/object.
    GetIndex,

    /// Set index in array/object, leaving the updated container on the stack.
    SetIndex,

    /// Await an async value. Host calls resolve before pushing, so this is
    /// a no-op kept for compiler compatibility.
    Await,

    Nop,
}

/// Bytecode loader.
pub struct BytecodeLoader;

impl BytecodeLoader {
    /// Parse bytecode from bytes.
    pub fn parse(bytes: &[u8]) -> Result<Bytecode, LoadError> {
        if bytes.len() < 4 {
            return Err(LoadError::ExecutionInit(
                "code too small to be valid bytecode".to_string(),
            ));
        }

        let body = if &bytes[0..4] == MAGIC {
            &bytes[4..]
        } else {
            bytes
        };

        let content = std::str::from_utf8(body)
            .map_err(|e| LoadError::ExecutionInit(format!("invalid UTF-8: {}", e)))?;

        serde_json::from_str(content)
            .map_err(|e| LoadError::ExecutionInit(format!("invalid bytecode: {}", e)))
    }

    /// Validate bytecode structure.
    ///
    /// `entry_point` overrides the module's own entry point when given. A
    /// missing entry function is reported as [`LoadError::EntryPointMissing`];
    /// any other structural problem as [`LoadError::ExecutionInit`].
    pub fn validate(
        bytecode: &Bytecode,
        entry_point: Option<&str>,
        limits: &VmLimits,
    ) -> Result<(), LoadError> {
        if bytecode.version != FORMAT_VERSION {
            return Err(LoadError::ExecutionInit(format!(
                "unsupported bytecode version: {}",
                bytecode.version
            )));
        }

        let mut names = HashSet::new();
        for function in &bytecode.functions {
            if !names.insert(function.name.as_str()) {
                return Err(LoadError::ExecutionInit(format!(
                    "duplicate function '{}'",
                    function.name
                )));
            }
            Self::validate_function(bytecode, function, limits)?;
        }

        let entry = entry_point.unwrap_or(&bytecode.entry_point);
        if !names.contains(entry) {
            return Err(LoadError::EntryPointMissing(entry.to_string()));
        }

        Ok(())
    }

    fn validate_function(
        bytecode: &Bytecode,
        function: &Function,
        limits: &VmLimits,
    ) -> Result<(), LoadError> {
        let fail = |pc: usize, reason: String| {
            LoadError::ExecutionInit(format!("{}@{}: {}", function.name, pc, reason))
        };

        if function.params.len() > function.local_count {
            return Err(fail(0, "more params than locals".to_string()));
        }
        if function.local_count > limits.max_stack {
            return Err(fail(
                0,
                format!("{} locals exceed the limit of {}", function.local_count, limits.max_stack),
            ));
        }

        let len = function.instructions.len() as i64;
        for (pc, instruction) in function.instructions.iter().enumerate() {
            match instruction {
                Instruction::LoadConst { index } if *index >= bytecode.constants.len() => {
                    return Err(fail(pc, format!("constant {} out of range", index)));
                }
                Instruction::LoadLocal { index } | Instruction::StoreLocal { index }
                    if *index >= function.local_count =>
                {
                    return Err(fail(pc, format!("local {} out of range", index)));
                }
                Instruction::MakeArray { count } if *count > limits.max_stack => {
                    return Err(fail(pc, format!("array of {} items exceeds the stack", count)));
                }
                Instruction::MakeObject { count }
                    if count.checked_mul(2).map_or(true, |n| n > limits.max_stack) =>
                {
                    return Err(fail(pc, format!("object of {} entries exceeds the stack", count)));
                }
                Instruction::Jump { offset } | Instruction::JumpIfFalse { offset } => {
                    let target = pc as i64 + 1 + *offset as i64;
                    if target < 0 || target > len {
                        return Err(fail(pc, format!("jump target {} out of range", target)));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}
