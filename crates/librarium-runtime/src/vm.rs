//! Sandboxed bytecode interpreter.
//!
//! Plugin code runs on a small stack machine whose only way out is the
//! builtin table, which forwards network and filesystem calls to the
//! runtime's [`HostApi`]. Values are JSON values.
//!
//! The interpreter is cooperative: it checks the call's deadline and
//! cancellation token every [`CHECK_INTERVAL`] instructions, yields to the
//! scheduler, and enforces instruction, stack and call-depth budgets.

use crate::bytecode::{Bytecode, Function, Instruction};
use crate::context::CallContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::host::{HostApi, HttpRequest, LogLevel};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Instructions executed between deadline checks.
pub const CHECK_INTERVAL: u64 = 1024;

type BoxFuture<'b, T> = Pin<Box<dyn Future<Output = T> + Send + 'b>>;

/// Execution budgets for a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLimits {
    pub max_instructions: u64,

    /// Stack slots per frame; also bounds a function's locals.
    pub max_stack: usize,
    pub max_call_depth: usize,

    /// Largest string (bytes) or array/object (entries) a program may build.
    pub max_value_len: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_instructions: 50_000_000,
            max_stack: 4096,
            max_call_depth: 64,
            max_value_len: 16 * 1024 * 1024,
        }
    }
}

/// A loaded bytecode module.
#[derive(Debug)]
pub struct Module {
    functions: HashMap<String, Function>,
    constants: Vec<Value>,
    globals: Map<String, Value>,
}

impl Module {
    pub fn new(bytecode: Bytecode) -> Self {
        let constants = bytecode.constants.iter().map(|c| c.to_value()).collect();
        let functions = bytecode
            .functions
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        Self {
            functions,
            constants,
            globals: Map::new(),
        }
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Parameter count of a function, if it exists.
    pub fn arity(&self, name: &str) -> Option<usize> {
        self.functions.get(name).map(|f| f.params.len())
    }

    /// Freeze the module globals (the state left by the entry point).
    pub fn set_globals(&mut self, globals: Map<String, Value>) {
        self.globals = globals;
    }

    /// Call a function. Returns the result and the globals as left by the call.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        host: &dyn HostApi,
        cx: &CallContext,
        limits: &VmLimits,
    ) -> RuntimeResult<(Value, Map<String, Value>)> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| RuntimeError::Execution(format!("unknown function '{}'", name)))?;

        let mut interpreter = Interpreter {
            module: self,
            host,
            cx,
            limits,
            globals: self.globals.clone(),
            executed: 0,
        };

        let result = interpreter.run(function, args, 0).await?;
        Ok((result, interpreter.globals))
    }
}

struct Interpreter<'a> {
    module: &'a Module,
    host: &'a dyn HostApi,
    cx: &'a CallContext,
    limits: &'a VmLimits,
    globals: Map<String, Value>,
    executed: u64,
}

fn trap(function: &Function, pc: usize, message: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Execution(format!("{}@{}: {}", function.name, pc, message))
}

impl<'a> Interpreter<'a> {
    async fn tick(&mut self) -> RuntimeResult<()> {
        self.executed += 1;
        if self.executed > self.limits.max_instructions {
            return Err(RuntimeError::Execution(format!(
                "instruction budget of {} exhausted",
                self.limits.max_instructions
            )));
        }
        if self.executed % CHECK_INTERVAL == 0 {
            self.cx.check()?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn run<'b>(
        &'b mut self,
        function: &'a Function,
        args: Vec<Value>,
        depth: usize,
    ) -> BoxFuture<'b, RuntimeResult<Value>> {
        Box::pin(async move {
            if depth > self.limits.max_call_depth {
                return Err(trap(function, 0, "call depth exceeded"));
            }
            if args.len() != function.params.len() {
                return Err(trap(
                    function,
                    0,
                    format!("expected {} arguments, got {}", function.params.len(), args.len()),
                ));
            }

            if function.local_count > self.limits.max_stack {
                return Err(trap(function, 0, "too many locals"));
            }
            let mut locals = vec![Value::Null; function.local_count];
            for (slot, arg) in locals.iter_mut().zip(args) {
                *slot = arg;
            }

            let mut stack: Vec<Value> = Vec::new();
            let mut pc = 0usize;

            while pc < function.instructions.len() {
                self.tick().await?;
                let at = pc;
                let instruction = &function.instructions[pc];
                pc += 1;

                macro_rules! pop {
                    () => {
                        stack
                            .pop()
                            .ok_or_else(|| trap(function, at, "stack underflow"))?
                    };
                }

                match instruction {
                    Instruction::LoadConst { index } => {
                        let value = self
                            .module
                            .constants
                            .get(*index)
                            .cloned()
                            .ok_or_else(|| trap(function, at, "constant out of range"))?;
                        stack.push(value);
                    }
                    Instruction::LoadLocal { index } => {
                        let value = locals
                            .get(*index)
                            .cloned()
                            .ok_or_else(|| trap(function, at, "local out of range"))?;
                        stack.push(value);
                    }
                    Instruction::StoreLocal { index } => {
                        let value = pop!();
                        let slot = locals
                            .get_mut(*index)
                            .ok_or_else(|| trap(function, at, "local out of range"))?;
                        *slot = value;
                    }
                    Instruction::LoadGlobal { name } => {
                        stack.push(self.globals.get(name).cloned().unwrap_or(Value::Null));
                    }
                    Instruction::StoreGlobal { name } => {
                        let value = pop!();
                        self.globals.insert(name.clone(), value);
                    }
                    Instruction::Call { name, arg_count } => {
                        let args = pop_n(&mut stack, *arg_count)
                            .ok_or_else(|| trap(function, at, "stack underflow"))?;
                        let module: &'a Module = self.module;
                        let result = match module.functions.get(name) {
                            Some(callee) => self.run(callee, args, depth + 1).await?,
                            None => self
                                .builtin(name, args)
                                .await
                                .map_err(|e| match e {
                                    RuntimeError::Execution(msg) => trap(function, at, msg),
                                    other => other,
                                })?,
                        };
                        stack.push(result);
                    }
                    Instruction::CallMethod { name, arg_count } => {
                        let args = pop_n(&mut stack, *arg_count)
                            .ok_or_else(|| trap(function, at, "stack underflow"))?;
                        let receiver = pop!();
                        let result =
                            call_method(receiver, name, args).map_err(|e| trap(function, at, e))?;
                        stack.push(result);
                    }
                    Instruction::Return => {
                        return Ok(stack.pop().unwrap_or(Value::Null));
                    }
                    Instruction::Jump { offset } => {
                        pc = jump(pc, *offset, function.instructions.len())
                            .ok_or_else(|| trap(function, at, "jump out of range"))?;
                    }
                    Instruction::JumpIfFalse { offset } => {
                        let condition = pop!();
                        if !truthy(&condition) {
                            pc = jump(pc, *offset, function.instructions.len())
                                .ok_or_else(|| trap(function, at, "jump out of range"))?;
                        }
                    }
                    Instruction::Pop => {
                        pop!();
                    }
                    Instruction::Dup => {
                        let top = stack
                            .last()
                            .cloned()
                            .ok_or_else(|| trap(function, at, "stack underflow"))?;
                        stack.push(top);
                    }
                    Instruction::Add
                    | Instruction::Sub
                    | Instruction::Mul
                    | Instruction::Div => {
                        let b = pop!();
                        let a = pop!();
                        let result =
                            arithmetic(instruction, a, b).map_err(|e| trap(function, at, e))?;
                        if value_len(&result) > self.limits.max_value_len {
                            return Err(trap(function, at, "value size limit exceeded"));
                        }
                        stack.push(result);
                    }
                    Instruction::Eq => {
                        let b = pop!();
                        let a = pop!();
                        stack.push(Value::Bool(loose_eq(&a, &b)));
                    }
                    Instruction::Ne => {
                        let b = pop!();
                        let a = pop!();
                        stack.push(Value::Bool(!loose_eq(&a, &b)));
                    }
                    Instruction::Lt | Instruction::Le | Instruction::Gt | Instruction::Ge => {
                        let b = pop!();
                        let a = pop!();
                        let ordering = compare(&a, &b).map_err(|e| trap(function, at, e))?;
                        let result = match instruction {
                            Instruction::Lt => ordering == Ordering::Less,
                            Instruction::Le => ordering != Ordering::Greater,
                            Instruction::Gt => ordering == Ordering::Greater,
                            _ => ordering != Ordering::Less,
                        };
                        stack.push(Value::Bool(result));
                    }
                    Instruction::Not => {
                        let value = pop!();
                        stack.push(Value::Bool(!truthy(&value)));
                    }
                    Instruction::And => {
                        let b = pop!();
                        let a = pop!();
                        stack.push(Value::Bool(truthy(&a) && truthy(&b)));
                    }
                    Instruction::Or => {
                        let b = pop!();
                        let a = pop!();
                        stack.push(Value::Bool(truthy(&a) || truthy(&b)));
                    }
                    Instruction::MakeArray { count } => {
                        let items = pop_n(&mut stack, *count)
                            .ok_or_else(|| trap(function, at, "stack underflow"))?;
                        stack.push(Value::Array(items));
                    }
                    Instruction::MakeObject { count } => {
                        let items = count
                            .checked_mul(2)
                            .and_then(|n| pop_n(&mut stack, n))
                            .ok_or_else(|| trap(function, at, "stack underflow"))?;
                        let mut object = Map::new();
                        let mut items = items.into_iter();
                        while let (Some(key), Some(value)) = (items.next(), items.next()) {
                            match key {
                                Value::String(key) => {
                                    object.insert(key, value);
                                }
                                other => {
                                    return Err(trap(
                                        function,
                                        at,
                                        format!("object key must be a string, got {}", other),
                                    ))
                                }
                            }
                        }
                        stack.push(Value::Object(object));
                    }
                    Instruction::GetProperty { name } => {
                        let object = pop!();
                        stack.push(object.get(name).cloned().unwrap_or(Value::Null));
                    }
                    Instruction::SetProperty { name } => {
                        let value = pop!();
                        let object = pop!();
                        let mut map = match object {
                            Value::Object(map) => map,
                            Value::Null => Map::new(),
                            other => {
                                return Err(trap(
                                    function,
                                    at,
                                    format!("cannot set property on {}", type_name(&other)),
                                ))
                            }
                        };
                        map.insert(name.clone(), value);
                        stack.push(Value::Object(map));
                    }
                    Instruction::GetIndex => {
                        let index = pop!();
                        let container = pop!();
                        let value = get_index(&container, &index)
                            .map_err(|e| trap(function, at, e))?;
                        stack.push(value);
                    }
                    Instruction::SetIndex => {
                        let value = pop!();
                        let index = pop!();
                        let container = pop!();
                        let updated = set_index(container, &index, value)
                            .map_err(|e| trap(function, at, e))?;
                        stack.push(updated);
                    }
                    Instruction::Await | Instruction::Nop => {}
                }

                if stack.len() > self.limits.max_stack {
                    return Err(trap(function, at, "stack limit exceeded"));
                }
            }

            Ok(Value::Null)
        })
    }

    /// Builtins reachable from plugin code. Network and filesystem access
    /// goes through the host API and is capability checked there.
    async fn builtin(&mut self, name: &str, args: Vec<Value>) -> RuntimeResult<Value> {
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);

        match name {
            "http_get" => {
                let url = expect_string(next(), "http_get url")?;
                let mut request = HttpRequest::get(url);
                request.headers = headers(next())?;
                self.http(request).await
            }
            "http_post" => {
                let url = expect_string(next(), "http_post url")?;
                let body = match next() {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let mut request = HttpRequest::post(url, body);
                request.headers = headers(next())?;
                self.http(request).await
            }
            "read_file" => {
                let path = expect_string(next(), "read_file path")?;
                let bytes = self.host.read_file(self.cx, Path::new(&path)).await?;
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
            "write_file" => {
                let path = expect_string(next(), "write_file path")?;
                let contents = match next() {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.host
                    .write_file(self.cx, Path::new(&path), contents.as_bytes())
                    .await?;
                Ok(Value::Null)
            }
            "list_dir" => {
                let path = expect_string(next(), "list_dir path")?;
                let names = self.host.list_dir(self.cx, Path::new(&path)).await?;
                Ok(Value::Array(names.into_iter().map(Value::String).collect()))
            }
            "temp_dir" => Ok(self
                .cx
                .temp_dir()
                .map(|p| Value::String(p.display().to_string()))
                .unwrap_or(Value::Null)),
            "log" => {
                let level = expect_string(next(), "log level")?;
                let message = match next() {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.host
                    .log(LogLevel::parse(&level).unwrap_or(LogLevel::Info), &message);
                Ok(Value::Null)
            }
            "now_millis" => Ok(Value::from(self.host.now_millis())),
            "json_parse" => {
                let text = expect_string(next(), "json_parse input")?;
                serde_json::from_str(&text)
                    .map_err(|e| RuntimeError::Execution(format!("json_parse: {}", e)))
            }
            "json_stringify" => Ok(Value::String(next().to_string())),
            "to_string" => Ok(Value::String(display(&next()))),
            other => Err(RuntimeError::Execution(format!("unknown function '{}'", other))),
        }
    }

    async fn http(&mut self, request: HttpRequest) -> RuntimeResult<Value> {
        let response = self.host.http_request(self.cx, request).await?;
        let headers = response
            .headers
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let mut object = Map::new();
        object.insert("status".to_string(), Value::from(response.status));
        object.insert("headers".to_string(), Value::Object(headers));
        object.insert("body".to_string(), Value::String(response.body));
        Ok(Value::Object(object))
    }
}

/// Length counted against [`VmLimits::max_value_len`].
fn value_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 0,
    }
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Option<Vec<Value>> {
    if stack.len() < n {
        return None;
    }
    Some(stack.split_off(stack.len() - n))
}

fn jump(pc: usize, offset: i32, len: usize) -> Option<usize> {
    let target = pc as i64 + offset as i64;
    if target < 0 || target > len as i64 {
        None
    } else {
        Some(target as usize)
    }
}

fn expect_string(value: Value, what: &str) -> RuntimeResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(RuntimeError::Execution(format!(
            "{} must be a string, got {}",
            what,
            type_name(&other)
        ))),
    }
}

fn headers(value: Value) -> RuntimeResult<BTreeMap<String, String>> {
    match value {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, display(&v))).collect()),
        other => Err(RuntimeError::Execution(format!(
            "headers must be an object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| "cannot compare NaN".to_string())
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(format!(
            "cannot compare {} with {}",
            type_name(a),
            type_name(b)
        )),
    }
}

fn float(value: f64) -> Result<Value, String> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| "non-finite arithmetic result".to_string())
}

fn arithmetic(op: &Instruction, a: Value, b: Value) -> Result<Value, String> {
    match (op, a, b) {
        (Instruction::Add, Value::String(x), y) => Ok(Value::String(x + &display(&y))),
        (Instruction::Add, Value::Array(mut x), Value::Array(y)) => {
            x.extend(y);
            Ok(Value::Array(x))
        }
        (op, Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                let result = match op {
                    Instruction::Add => x.checked_add(y),
                    Instruction::Sub => x.checked_sub(y),
                    Instruction::Mul => x.checked_mul(y),
                    _ => {
                        if y == 0 {
                            return Err("division by zero".to_string());
                        }
                        if x % y != 0 {
                            return float(x as f64 / y as f64);
                        }
                        x.checked_div(y)
                    }
                };
                return result
                    .map(Value::from)
                    .ok_or_else(|| "integer overflow".to_string());
            }

            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            match op {
                Instruction::Add => float(x + y),
                Instruction::Sub => float(x - y),
                Instruction::Mul => float(x * y),
                _ if y == 0.0 => Err("division by zero".to_string()),
                _ => float(x / y),
            }
        }
        (op, a, b) => Err(format!(
            "unsupported operands for {:?}: {} and {}",
            op,
            type_name(&a),
            type_name(&b)
        )),
    }
}

fn get_index(container: &Value, index: &Value) -> Result<Value, String> {
    match (container, index) {
        (Value::Array(items), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (Value::Null, _) => Ok(Value::Null),
        (c, i) => Err(format!("cannot index {} with {}", type_name(c), type_name(i))),
    }
}

fn set_index(container: Value, index: &Value, value: Value) -> Result<Value, String> {
    match (container, index) {
        (Value::Array(mut items), Value::Number(n)) => {
            let i = n
                .as_u64()
                .map(|i| i as usize)
                .ok_or_else(|| "array index must be a non-negative integer".to_string())?;
            match i.cmp(&items.len()) {
                Ordering::Less => items[i] = value,
                Ordering::Equal => items.push(value),
                Ordering::Greater => return Err(format!("array index {} out of range", i)),
            }
            Ok(Value::Array(items))
        }
        (Value::Object(mut map), Value::String(key)) => {
            map.insert(key.clone(), value);
            Ok(Value::Object(map))
        }
        (c, i) => Err(format!("cannot index {} with {}", type_name(&c), type_name(i))),
    }
}

fn call_method(receiver: Value, name: &str, args: Vec<Value>) -> Result<Value, String> {
    let mut args = args.into_iter();
    match (name, receiver) {
        ("len", Value::Array(a)) => Ok(Value::from(a.len())),
        ("len", Value::String(s)) => Ok(Value::from(s.chars().count())),
        ("len", Value::Object(m)) => Ok(Value::from(m.len())),
        ("keys", Value::Object(m)) => Ok(Value::Array(m.keys().cloned().map(Value::String).collect())),
        ("push", Value::Array(mut a)) => {
            a.extend(args);
            Ok(Value::Array(a))
        }
        ("contains", Value::Array(a)) => {
            let needle = args.next().unwrap_or(Value::Null);
            Ok(Value::Bool(a.iter().any(|v| loose_eq(v, &needle))))
        }
        ("contains", Value::String(s)) => match args.next() {
            Some(Value::String(needle)) => Ok(Value::Bool(s.contains(&needle))),
            _ => Err("contains expects a string".to_string()),
        },
        ("contains", Value::Object(m)) => match args.next() {
            Some(Value::String(key)) => Ok(Value::Bool(m.contains_key(&key))),
            _ => Err("contains expects a string key".to_string()),
        },
        ("get", Value::Object(m)) => match args.next() {
            Some(Value::String(key)) => Ok(m
                .get(&key)
                .cloned()
                .unwrap_or_else(|| args.next().unwrap_or(Value::Null))),
            _ => Err("get expects a string key".to_string()),
        },
        ("lower", Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        ("upper", Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        ("trim", Value::String(s)) => Ok(Value::String(s.trim().to_string())),
        ("starts_with", Value::String(s)) => match args.next() {
            Some(Value::String(prefix)) => Ok(Value::Bool(s.starts_with(&prefix))),
            _ => Err("starts_with expects a string".to_string()),
        },
        ("split", Value::String(s)) => match args.next() {
            Some(Value::String(sep)) if !sep.is_empty() => Ok(Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            _ => Err("split expects a non-empty separator".to_string()),
        },
        ("join", Value::Array(a)) => {
            let sep = match args.next() {
                Some(Value::String(sep)) => sep,
                _ => String::new(),
            };
            Ok(Value::String(
                a.iter().map(display).collect::<Vec<_>>().join(&sep),
            ))
        }
        (name, receiver) => Err(format!(
            "unknown method '{}' on {}",
            name,
            type_name(&receiver)
        )),
    }
}
