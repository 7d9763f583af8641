use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use jisp_patch::Patch;

/// A variable object: JSON object keys to JSON values.
pub type Variables = Map<String, Value>;

/// A variable map that can be aliased by several call frames. Body frames
/// (if/while/for/try and the higher-order bodies) share the enclosing frame's
/// map; call-invoked bodies get a fresh one. Serializing writes the map
/// content, so reloading a document severs the aliasing.
pub type SharedVars = Rc<RefCell<Variables>>;

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Value equality with numeric coercion: numbers compare by double value
/// regardless of their integer/float representation, collections recurse.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn paths_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
}

/// Wrap an arithmetic result, normalizing exact integers so that `5 + 7`
/// serializes as `12` rather than `12.0`.
fn number_value(x: f64) -> Result<Value, OpError> {
    if !x.is_finite() {
        return Err("result is not a finite number".into());
    }
    const SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;
    if x.fract() == 0.0 && x.abs() <= SAFE_INTEGER {
        return Ok(Value::from(x as i64));
    }
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".into())
}

// ---------------------------------------------------------------------------
// Signals and errors
// ---------------------------------------------------------------------------

/// A non-error control-flow result. Signals propagate up through frames and
/// are never stored on the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Break,
    Continue,
    Return,
    Exit,
    Breakpoint,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Break => write!(f, "break"),
            Signal::Continue => write!(f, "continue"),
            Signal::Return => write!(f, "return"),
            Signal::Exit => write!(f, "exit"),
            Signal::Breakpoint => write!(f, "breakpoint"),
        }
    }
}

/// A structured runtime error, stored in the program's `error` slot. The
/// message carries no operation-name prefix; `operation_name` has that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JispError {
    #[serde(default)]
    pub operation_name: String,
    #[serde(default)]
    pub instruction_pointer: Vec<Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack_snapshot: Vec<Value>,
    #[serde(default)]
    pub call_stack_snapshot: Vec<CallFrame>,
    #[serde(default)]
    pub variables_snapshot: Variables,
}

impl fmt::Display for JispError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = serde_json::to_string(&self.instruction_pointer).unwrap_or_default();
        write!(
            f,
            "error in '{}' at {}: {}",
            self.operation_name, path, self.message
        )
    }
}

impl std::error::Error for JispError {}

/// What an operation handler can come back with besides success. The
/// dispatcher interprets each variant: signals propagate, raised errors are
/// stored verbatim, plain messages are wrapped with the current program state.
#[derive(Debug)]
pub enum OpError {
    Signal(Signal),
    Raised(JispError),
    Message(String),
}

impl From<Signal> for OpError {
    fn from(signal: Signal) -> Self {
        OpError::Signal(signal)
    }
}

impl From<String> for OpError {
    fn from(message: String) -> Self {
        OpError::Message(message)
    }
}

impl From<&str> for OpError {
    fn from(message: &str) -> Self {
        OpError::Message(message.to_string())
    }
}

type OpResult = Result<(), OpError>;

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// One instruction. Serialized as a JSON array `[name, ...args]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub args: Vec<Value>,
}

impl Operation {
    fn from_raw(raw: &[Value]) -> Result<Operation, String> {
        let Some(first) = raw.first() else {
            return Err("operation array is empty".to_string());
        };
        let Value::String(name) = first else {
            return Err(format!(
                "operation name is not a string, got {}",
                type_name(first)
            ));
        };
        Ok(Operation {
            name: name.clone(),
            args: raw[1..].to_vec(),
        })
    }
}

impl Serialize for Operation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(1 + self.args.len()))?;
        seq.serialize_element(&self.name)?;
        for arg in &self.args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Vec::<Value>::deserialize(deserializer)?;
        Operation::from_raw(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse an operation list out of a JSON value (a body argument or a
/// function value fetched from a variable).
fn parse_ops(raw: &Value) -> Result<Vec<Operation>, String> {
    let Value::Array(items) = raw else {
        return Err(format!(
            "expected an array of operations, got {}",
            type_name(raw)
        ));
    };
    let mut ops = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Value::Array(raw_op) = item else {
            return Err(format!(
                "expected operation {index} to be an array, got {}",
                type_name(item)
            ));
        };
        ops.push(
            Operation::from_raw(raw_op)
                .map_err(|err| format!("error parsing operation at index {index}: {err}"))?,
        );
    }
    Ok(ops)
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

/// A declarative import: a file path (resolved once on load) or a URL
/// (declared but unresolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

// ---------------------------------------------------------------------------
// Call frames
// ---------------------------------------------------------------------------

/// One level of execution: an operation list, the zero-based index of the
/// next instruction, the JSON path of the operation list inside the program
/// document, and a variable map (owned or aliased, see [`SharedVars`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "FrameRepr", try_from = "FrameRepr")]
pub struct CallFrame {
    pub ops: Vec<Operation>,
    pub ip: usize,
    pub base_path: Vec<Value>,
    pub variables: SharedVars,
}

/// Wire form of a call frame: `ip` is the full current-instruction path
/// (`base_path ++ [ip]`); the prefix is peeled back off on load.
#[derive(Clone, Serialize, Deserialize)]
struct FrameRepr {
    ops: Vec<Operation>,
    ip: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    variables: Variables,
}

impl From<CallFrame> for FrameRepr {
    fn from(frame: CallFrame) -> Self {
        let mut path = frame.base_path;
        path.push(Value::from(frame.ip as u64));
        FrameRepr {
            ops: frame.ops,
            ip: Some(path),
            variables: frame.variables.borrow().clone(),
        }
    }
}

impl TryFrom<FrameRepr> for CallFrame {
    type Error = String;

    fn try_from(repr: FrameRepr) -> Result<Self, String> {
        let (ip, base_path) = match repr.ip {
            // A frame that has not started executing may omit its ip.
            None => (0, Vec::new()),
            Some(path) => {
                let Some((last, prefix)) = path.split_last() else {
                    return Err(
                        "could not read ip: instruction pointer path cannot be an empty array"
                            .to_string(),
                    );
                };
                let Some(ip) = last.as_f64() else {
                    return Err(
                        "could not read ip: last element of the path is not a number".to_string()
                    );
                };
                (ip.max(0.0) as usize, prefix.to_vec())
            }
        };
        Ok(CallFrame {
            ops: repr.ops,
            ip,
            base_path,
            variables: Rc::new(RefCell::new(repr.variables)),
        })
    }
}

// ---------------------------------------------------------------------------
// The program document
// ---------------------------------------------------------------------------

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// The entire state of a program: one JSON document in, one out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default)]
    pub stack: Vec<Value>,
    #[serde(default)]
    pub variables: SharedVars,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub code: Vec<Operation>,
    #[serde(default)]
    pub call_stack: Vec<CallFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JispError>,
    #[serde(default)]
    pub history: Vec<Patch>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub save_history: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breakpoints: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub running: bool,
}

impl Program {
    pub fn from_value(value: Value) -> Result<Program, String> {
        serde_json::from_value(value).map_err(|err| format!("failed to parse program: {err}"))
    }

    pub fn to_value(&self) -> Result<Value, String> {
        serde_json::to_value(self).map_err(|err| format!("failed to serialize program: {err}"))
    }

    fn current_frame(&self) -> Option<&CallFrame> {
        self.call_stack.last()
    }

    fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.call_stack.last_mut()
    }

    /// The JSON path of the instruction the current frame will execute next.
    pub fn current_instruction_path(&self) -> Vec<Value> {
        match self.current_frame() {
            Some(frame) => {
                let mut path = frame.base_path.clone();
                path.push(Value::from(frame.ip as u64));
                path
            }
            None => Vec::new(),
        }
    }

    fn new_error(&self, operation_name: &str, message: impl Into<String>) -> JispError {
        JispError {
            operation_name: operation_name.to_string(),
            instruction_pointer: self.current_instruction_path(),
            message: message.into(),
            stack_snapshot: self.stack.clone(),
            call_stack_snapshot: self.call_stack.clone(),
            variables_snapshot: self.variables.borrow().clone(),
        }
    }

    /// Record a fatal interpreter-level failure (a signal escaping the root).
    pub fn set_fatal_error(&mut self, message: impl Into<String>) {
        let err = self.new_error("fatal", message);
        self.error = Some(err);
    }

    /// Resolve file imports: `<name>.jisp`, falling back to `<name>.json`,
    /// parsed as JSON and stored under `variables[<name>]`. URL imports are
    /// declared but unresolved.
    pub fn process_imports(&mut self) -> Result<(), String> {
        for import in &self.imports {
            let Some(name) = import.path.first() else {
                continue;
            };
            let data = fs::read_to_string(format!("{name}.jisp"))
                .or_else(|_| fs::read_to_string(format!("{name}.json")))
                .map_err(|err| format!("could not read file for import '{name}': {err}"))?;
            let code: Value = serde_json::from_str(&data)
                .map_err(|err| format!("could not parse JSON for import '{name}': {err}"))?;
            self.variables.borrow_mut().insert(name.clone(), code);
        }
        Ok(())
    }

    // -- stack ------------------------------------------------------------

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop_value(&mut self) -> Result<Value, OpError> {
        self.stack
            .pop()
            .ok_or_else(|| "stack underflow: expected 1 value".into())
    }

    fn popn(&mut self, n: usize) -> Result<Vec<Value>, OpError> {
        if self.stack.len() < n {
            return Err(format!("stack underflow: expected {n} values").into());
        }
        let split = self.stack.len() - n;
        Ok(self.stack.split_off(split))
    }

    fn pop_string(&mut self) -> Result<String, OpError> {
        match self.pop_value()? {
            Value::String(s) => Ok(s),
            other => Err(format!("expected a string on stack, got {}", type_name(&other)).into()),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, OpError> {
        match self.pop_value()? {
            Value::Bool(b) => Ok(b),
            other => Err(format!("expected a boolean on stack, got {}", type_name(&other)).into()),
        }
    }

    fn pop_number(&mut self) -> Result<f64, OpError> {
        match self.pop_value()? {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| "expected a finite number on stack".into()),
            other => Err(format!("expected a number on stack, got {}", type_name(&other)).into()),
        }
    }

    fn pop_array(&mut self) -> Result<Vec<Value>, OpError> {
        match self.pop_value()? {
            Value::Array(items) => Ok(items),
            other => Err(format!("expected an array on stack, got {}", type_name(&other)).into()),
        }
    }

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), OpError> {
        if self.stack.len() < 2 {
            return Err("stack underflow: expected 2 values".into());
        }
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        Ok((a, b))
    }

    fn pop_two_strings(&mut self) -> Result<(String, String), OpError> {
        if self.stack.len() < 2 {
            return Err("stack underflow: expected 2 values".into());
        }
        let b = self.pop_string()?;
        let a = self.pop_string()?;
        Ok((a, b))
    }

    fn pop_two_bools(&mut self) -> Result<(bool, bool), OpError> {
        if self.stack.len() < 2 {
            return Err("stack underflow: expected 2 values".into());
        }
        let b = self.pop_bool()?;
        let a = self.pop_bool()?;
        Ok((a, b))
    }

    /// Pop a serialized program document and reconstruct it.
    fn pop_sub_program(&mut self) -> Result<Program, OpError> {
        let value = self.pop_value()?;
        Program::from_value(value)
            .map_err(|err| format!("could not reconstruct sub-program from stack value: {err}").into())
    }

    // -- variable paths ---------------------------------------------------

    /// Scoped lookup for a string name: call frames inner to outer, then the
    /// program globals.
    fn lookup_variable(&self, name: &str) -> Option<Value> {
        for frame in self.call_stack.iter().rev() {
            if let Some(value) = frame.variables.borrow().get(name) {
                return Some(value.clone());
            }
        }
        self.variables.borrow().get(name).cloned()
    }

    /// Resolve a path value: a string uses scoped lookup, an array navigates
    /// from the globals.
    fn get_value_for_path(&self, path: &Value) -> Result<Value, OpError> {
        match path {
            Value::String(name) => self
                .lookup_variable(name)
                .ok_or_else(|| format!("variable '{name}' not found").into()),
            Value::Array(segments) => self.get_value_by_path(segments),
            other => {
                Err(format!("expected a string or an array path, got {}", type_name(other)).into())
            }
        }
    }

    fn get_value_by_path(&self, path: &[Value]) -> Result<Value, OpError> {
        let Some(first) = path.first() else {
            return Err("path array cannot be empty".into());
        };
        let Value::String(first_key) = first else {
            return Err(format!(
                "first element of a path must be a string variable name, got {}",
                type_name(first)
            )
            .into());
        };
        let vars = self.variables.borrow();
        let mut current = vars
            .get(first_key)
            .ok_or_else(|| OpError::from(format!("variable '{first_key}' not found")))?;
        for segment in &path[1..] {
            current = match segment {
                Value::String(key) => {
                    let Value::Object(map) = current else {
                        return Err(format!(
                            "trying to access a non-object with string key '{key}'"
                        )
                        .into());
                    };
                    map.get(key)
                        .ok_or_else(|| OpError::from(format!("key '{key}' not found in path")))?
                }
                Value::Number(n) => {
                    let index = number_index(n)?;
                    let Value::Array(items) = current else {
                        return Err(format!(
                            "trying to access a non-array with numeric index {index}"
                        )
                        .into());
                    };
                    items.get(index).ok_or_else(|| {
                        OpError::from(format!("index {index} out of bounds in path"))
                    })?
                }
                other => {
                    return Err(format!("invalid path segment type {}", type_name(other)).into())
                }
            };
        }
        Ok(current.clone())
    }

    /// Assign through a path value. A string assigns in the current frame's
    /// map (the globals at the root); an array navigates from the globals,
    /// auto-vivifying missing intermediate objects but never arrays.
    fn set_value_for_path(&mut self, path: &Value, value: Value) -> Result<(), OpError> {
        match path {
            Value::String(name) => {
                match self.call_stack.last() {
                    Some(frame) => frame.variables.borrow_mut().insert(name.clone(), value),
                    None => self.variables.borrow_mut().insert(name.clone(), value),
                };
                Ok(())
            }
            Value::Array(segments) => self.set_value_by_path(segments, value),
            other => {
                Err(format!("expected a string or an array path, got {}", type_name(other)).into())
            }
        }
    }

    fn set_value_by_path(&mut self, path: &[Value], value: Value) -> Result<(), OpError> {
        let Some(first) = path.first() else {
            return Err("path array cannot be empty".into());
        };
        let Value::String(first_key) = first else {
            return Err(format!(
                "first element of a path must be a string variable name, got {}",
                type_name(first)
            )
            .into());
        };
        let mut vars = self.variables.borrow_mut();
        if path.len() == 1 {
            vars.insert(first_key.clone(), value);
            return Ok(());
        }
        let mut current = vars
            .entry(first_key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in &path[1..path.len() - 1] {
            current = match segment {
                Value::String(key) => {
                    let Value::Object(map) = current else {
                        return Err(format!(
                            "trying to access a non-object with string key '{key}'"
                        )
                        .into());
                    };
                    map.entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()))
                }
                Value::Number(n) => {
                    let index = number_index(n)?;
                    let Value::Array(items) = current else {
                        return Err(format!(
                            "trying to access a non-array with numeric index {index}"
                        )
                        .into());
                    };
                    let len = items.len();
                    items.get_mut(index).ok_or_else(|| {
                        OpError::from(format!("index {index} out of bounds for array of {len}"))
                    })?
                }
                other => {
                    return Err(format!("invalid path segment type {}", type_name(other)).into())
                }
            };
        }
        match &path[path.len() - 1] {
            Value::String(key) => {
                let Value::Object(map) = current else {
                    return Err(format!("cannot set string key '{key}' on a non-object").into());
                };
                map.insert(key.clone(), value);
            }
            Value::Number(n) => {
                let index = number_index(n)?;
                let Value::Array(items) = current else {
                    return Err(format!("cannot set numeric index {index} on a non-array").into());
                };
                let len = items.len();
                let slot = items.get_mut(index).ok_or_else(|| {
                    OpError::from(format!("index {index} out of bounds for array of {len}"))
                })?;
                *slot = value;
            }
            other => return Err(format!("invalid path segment type {}", type_name(other)).into()),
        }
        Ok(())
    }

    // -- execution --------------------------------------------------------

    /// Execute the instruction under the current frame's ip and advance the
    /// ip. The ip advances even when the instruction fails, so a faulty
    /// instruction cannot loop. On success, the next instruction's path is
    /// checked against the breakpoint list.
    fn execute_instruction(&mut self) -> Result<(), Signal> {
        let op = {
            let Some(frame) = self.current_frame() else {
                return Ok(());
            };
            let Some(op) = frame.ops.get(frame.ip) else {
                return Ok(());
            };
            op.clone()
        };

        let Some(handler) = handler_for_name(&op.name) else {
            let err = self.new_error(&op.name, format!("unknown operation: {}", op.name));
            self.error = Some(err);
            if let Some(frame) = self.current_frame_mut() {
                frame.ip += 1;
            }
            return Ok(());
        };

        let result = handler(self, &op);

        if let Some(frame) = self.current_frame_mut() {
            frame.ip += 1;
        }

        match result {
            Ok(()) => {}
            Err(OpError::Signal(signal)) => return Err(signal),
            Err(OpError::Raised(err)) => {
                self.error = Some(err);
                return Ok(());
            }
            Err(OpError::Message(message)) => {
                let err = self.new_error(&op.name, message);
                self.error = Some(err);
                return Ok(());
            }
        }

        if self.debug && !self.breakpoints.is_empty() {
            if let Some(frame) = self.current_frame() {
                if frame.ip < frame.ops.len() {
                    let path = self.current_instruction_path();
                    if self.breakpoints.iter().any(|bp| paths_equal(&path, bp)) {
                        return Err(Signal::Breakpoint);
                    }
                }
            }
        }

        Ok(())
    }

    /// Push a frame for `ops` and step it until exhaustion, a signal, or the
    /// instruction limit (negative means unlimited). Always pops exactly the
    /// frame it pushed. Return and Breakpoint end the frame quietly; other
    /// signals propagate to the caller.
    pub fn execute_frame(
        &mut self,
        ops: Vec<Operation>,
        base_path: Vec<Value>,
        use_parent_scope: bool,
        limit: i64,
    ) -> Result<(), Signal> {
        if ops.is_empty() {
            return Ok(());
        }
        let variables = match self.call_stack.last() {
            Some(parent) if use_parent_scope => Rc::clone(&parent.variables),
            Some(_) => Rc::new(RefCell::new(Map::new())),
            None => Rc::clone(&self.variables),
        };
        self.call_stack.push(CallFrame {
            ops,
            ip: 0,
            base_path,
            variables,
        });
        let depth = self.call_stack.len();

        let mut remaining = limit;
        let result = loop {
            if remaining == 0 {
                break Ok(());
            }
            let frame = &self.call_stack[depth - 1];
            if frame.ip >= frame.ops.len() {
                break Ok(());
            }
            if self.error.is_some() {
                break Ok(());
            }
            match self.execute_instruction() {
                Ok(()) => {}
                Err(Signal::Breakpoint) | Err(Signal::Return) => break Ok(()),
                Err(signal) => break Err(signal),
            }
            if remaining > 0 {
                remaining -= 1;
            }
        };

        if self.call_stack.len() == depth {
            self.call_stack.pop();
        }
        result
    }

    /// Execute a nested body whose path is the current instruction path plus
    /// one segment.
    fn execute_block(
        &mut self,
        ops: Vec<Operation>,
        segment: Value,
        use_parent_scope: bool,
    ) -> Result<(), Signal> {
        let mut path = self.current_instruction_path();
        path.push(segment);
        self.execute_frame(ops, path, use_parent_scope, -1)
    }

    /// Top-level driver: step until the call stack empties, reaping exhausted
    /// frames. Halts gracefully on a breakpoint (the call stack stays intact
    /// so a later `step` resumes there) and propagates only Exit.
    pub fn run(&mut self) -> Result<(), Signal> {
        if self.current_frame().is_none() {
            if self.code.is_empty() {
                return Ok(());
            }
            let frame = CallFrame {
                ops: self.code.clone(),
                ip: 0,
                base_path: vec![Value::from("code")],
                variables: Rc::clone(&self.variables),
            };
            self.call_stack.push(frame);
        }

        loop {
            let Some(frame) = self.current_frame() else {
                return Ok(());
            };
            if frame.ip >= frame.ops.len() {
                self.call_stack.pop();
                continue;
            }
            if self.error.is_some() {
                return Ok(());
            }
            match self.execute_instruction() {
                Ok(()) => {}
                Err(Signal::Breakpoint) => return Ok(()),
                Err(Signal::Return) => {
                    self.call_stack.pop();
                }
                Err(Signal::Exit) => return Err(Signal::Exit),
                // Break or continue escaping the root: halt quietly; the
                // outermost caller decides whether that is fatal.
                Err(_) => return Ok(()),
            }
        }
    }
}

fn number_index(n: &serde_json::Number) -> Result<usize, OpError> {
    let raw = n.as_f64().unwrap_or(-1.0);
    if raw < 0.0 {
        return Err(format!("negative index {raw} in path").into());
    }
    Ok(raw as usize)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

type Handler = fn(&mut Program, &Operation) -> OpResult;

fn handler_for_name(name: &str) -> Option<Handler> {
    Some(match name {
        "push" => op_push,
        "pop" => op_pop,
        "set" => op_set,
        "get" => op_get,
        "exists" => op_exists,
        "delete" => op_delete,
        "eq" => op_eq,
        "lt" => op_lt,
        "gt" => op_gt,
        "add" => op_add,
        "sub" => op_sub,
        "mul" => op_mul,
        "div" => op_div,
        "mod" => op_mod,
        "and" => op_and,
        "or" => op_or,
        "not" => op_not,
        "trim" => op_trim,
        "lower" => op_lower,
        "upper" => op_upper,
        "concat" => op_concat,
        "replace" => op_replace,
        "to_string" => op_to_string,
        "slice" => op_slice,
        "len" => op_len,
        "keys" => op_keys,
        "values" => op_values,
        "range" => op_range,
        "sort" => op_sort,
        "union" => op_union,
        "intersection" => op_intersection,
        "difference" => op_difference,
        "join" => op_join,
        "map" => op_map,
        "filter" => op_filter,
        "reduce" => op_reduce,
        "for" => op_for,
        "foreach" => op_for,
        "while" => op_while,
        "if" => op_if,
        "try" => op_try,
        "raise" => op_raise,
        "assert" => op_assert,
        "call" => op_call,
        "return" => op_return,
        "break" => op_break,
        "continue" => op_continue,
        "exit" => op_exit,
        "noop" => op_noop,
        "valid" => op_valid,
        "run" => op_run,
        "step" => op_step,
        "undo" => op_undo,
        "spawn" => op_spawn,
        "await" => op_await,
        "breakpoint" => op_breakpoint,
        _ => return None,
    })
}

fn expect_no_args(op: &Operation) -> OpResult {
    if op.args.is_empty() {
        Ok(())
    } else {
        Err(format!("expected 0 arguments, got {}", op.args.len()).into())
    }
}

// ---------------------------------------------------------------------------
// Stack and variable operations
// ---------------------------------------------------------------------------

fn op_push(program: &mut Program, op: &Operation) -> OpResult {
    let Some(value) = op.args.first() else {
        return Err("no argument provided".into());
    };
    program.push(value.clone());
    Ok(())
}

fn op_pop(program: &mut Program, op: &Operation) -> OpResult {
    let Some(arg) = op.args.first() else {
        return Err("no argument provided for the field name".into());
    };
    let Value::String(field) = arg else {
        return Err(format!(
            "expected a string argument for the field name, got {}",
            type_name(arg)
        )
        .into());
    };
    let value = program.pop_value()?;
    program.variables.borrow_mut().insert(field.clone(), value);
    Ok(())
}

fn op_set(program: &mut Program, op: &Operation) -> OpResult {
    match op.args.len() {
        // No args: pop the value, then the path, off the stack.
        0 => {
            let values = program.popn(2)?;
            let path = values[1].clone();
            program.set_value_for_path(&path, values[0].clone())
        }
        // One arg: pop the value, the arg is the path.
        1 => {
            let value = program.pop_value()?;
            program.set_value_for_path(&op.args[0], value)
        }
        // Multi-arg: pop one value per path; the deepest popped value goes
        // to the first path.
        n => {
            let values = program.popn(n)?;
            for (path, value) in op.args.iter().zip(values) {
                let path = path.clone();
                program.set_value_for_path(&path, value)?;
            }
            Ok(())
        }
    }
}

fn op_get(program: &mut Program, op: &Operation) -> OpResult {
    if op.args.is_empty() {
        let path = program.pop_value()?;
        let value = program.get_value_for_path(&path)?;
        program.push(value);
        return Ok(());
    }
    for path in &op.args {
        let value = program.get_value_for_path(path)?;
        program.push(value);
    }
    Ok(())
}

fn op_exists(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let key = program.pop_string()?;
    let found = program.variables.borrow().contains_key(&key);
    program.push(Value::Bool(found));
    Ok(())
}

fn op_delete(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let key = program.pop_string()?;
    program.variables.borrow_mut().shift_remove(&key);
    Ok(())
}

// ---------------------------------------------------------------------------
// Arithmetic, comparison, boolean
// ---------------------------------------------------------------------------

fn binary_number_op(
    program: &mut Program,
    op: &Operation,
    apply: fn(f64, f64) -> Result<f64, String>,
) -> OpResult {
    expect_no_args(op)?;
    let (a, b) = program.pop_two_numbers()?;
    let result = apply(a, b).map_err(OpError::Message)?;
    program.push(number_value(result)?);
    Ok(())
}

fn op_add(program: &mut Program, op: &Operation) -> OpResult {
    binary_number_op(program, op, |a, b| Ok(a + b))
}

fn op_sub(program: &mut Program, op: &Operation) -> OpResult {
    binary_number_op(program, op, |a, b| Ok(a - b))
}

fn op_mul(program: &mut Program, op: &Operation) -> OpResult {
    binary_number_op(program, op, |a, b| Ok(a * b))
}

fn op_div(program: &mut Program, op: &Operation) -> OpResult {
    binary_number_op(program, op, |a, b| {
        if b == 0.0 {
            Err("division by zero".to_string())
        } else {
            Ok(a / b)
        }
    })
}

fn op_mod(program: &mut Program, op: &Operation) -> OpResult {
    binary_number_op(program, op, |a, b| {
        if b == 0.0 {
            Err("modulo by zero".to_string())
        } else {
            Ok(a % b)
        }
    })
}

fn op_eq(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let values = program.popn(2)?;
    program.push(Value::Bool(values_equal(&values[0], &values[1])));
    Ok(())
}

fn compare_op(
    program: &mut Program,
    op: &Operation,
    numbers: fn(f64, f64) -> bool,
    strings: fn(&str, &str) -> bool,
) -> OpResult {
    expect_no_args(op)?;
    let values = program.popn(2)?;
    let result = match (&values[0], &values[1]) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => numbers(a, b),
            _ => return Err("expected finite numbers for comparison".into()),
        },
        (Value::String(a), Value::String(b)) => strings(a, b),
        (Value::Number(_), other) => {
            return Err(format!("cannot compare a number with {}", type_name(other)).into())
        }
        (Value::String(_), other) => {
            return Err(format!("cannot compare a string with {}", type_name(other)).into())
        }
        (other, _) => {
            return Err(format!("unsupported type for comparison: {}", type_name(other)).into())
        }
    };
    program.push(Value::Bool(result));
    Ok(())
}

fn op_lt(program: &mut Program, op: &Operation) -> OpResult {
    compare_op(program, op, |a, b| a < b, |a, b| a < b)
}

fn op_gt(program: &mut Program, op: &Operation) -> OpResult {
    compare_op(program, op, |a, b| a > b, |a, b| a > b)
}

fn op_and(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (a, b) = program.pop_two_bools()?;
    program.push(Value::Bool(a && b));
    Ok(())
}

fn op_or(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (a, b) = program.pop_two_bools()?;
    program.push(Value::Bool(a || b));
    Ok(())
}

fn op_not(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_bool()?;
    program.push(Value::Bool(!value));
    Ok(())
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn string_unary_op(program: &mut Program, op: &Operation, apply: fn(&str) -> String) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_string()?;
    program.push(Value::String(apply(&value)));
    Ok(())
}

fn op_trim(program: &mut Program, op: &Operation) -> OpResult {
    string_unary_op(program, op, |s| s.trim().to_string())
}

fn op_lower(program: &mut Program, op: &Operation) -> OpResult {
    string_unary_op(program, op, |s| s.to_lowercase())
}

fn op_upper(program: &mut Program, op: &Operation) -> OpResult {
    string_unary_op(program, op, |s| s.to_uppercase())
}

fn op_concat(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (a, b) = program.pop_two_strings()?;
    program.push(Value::String(a + &b));
    Ok(())
}

fn op_replace(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    if program.stack.len() < 3 {
        return Err("stack underflow: expected 3 values".into());
    }
    let new = program.pop_string()?;
    let old = program.pop_string()?;
    let input = program.pop_string()?;
    program.push(Value::String(input.replace(&old, &new)));
    Ok(())
}

fn op_to_string(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_value()?;
    let text = match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    program.push(Value::String(text));
    Ok(())
}

fn slice_bounds(start: f64, end: Option<f64>, length: usize) -> Result<(usize, usize), OpError> {
    let start = start as i64;
    let end = end.map_or(length as i64, |e| e as i64);
    if start < 0 || end < start || end > length as i64 {
        return Err(format!(
            "invalid indices [{start}:{end}] for a collection of length {length}"
        )
        .into());
    }
    Ok((start as usize, end as usize))
}

fn op_slice(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    // Three values (input, start, end), or two with the end defaulting to
    // the input length.
    let values = if program.stack.len() >= 3 {
        program.popn(3)?
    } else {
        program.popn(2).map_err(|_| {
            OpError::from("stack underflow: expected at least 2 values (input, start)")
        })?
    };
    let Some(start) = values[1].as_f64() else {
        return Err(format!("expected a numeric start index, got {}", type_name(&values[1])).into());
    };
    let end = match values.get(2) {
        Some(value) => {
            let Some(end) = value.as_f64() else {
                return Err(
                    format!("expected a numeric end index, got {}", type_name(value)).into(),
                );
            };
            Some(end)
        }
        None => None,
    };
    match &values[0] {
        Value::String(s) => {
            let (start, end) = slice_bounds(start, end, s.len())?;
            let Some(piece) = s.get(start..end) else {
                return Err("slice indices are not on a character boundary".into());
            };
            program.push(Value::String(piece.to_string()));
        }
        Value::Array(items) => {
            let (start, end) = slice_bounds(start, end, items.len())?;
            program.push(Value::Array(items[start..end].to_vec()));
        }
        other => {
            return Err(format!(
                "unsupported type {} for slicing, expected string or array",
                type_name(other)
            )
            .into())
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

fn op_len(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_value()?;
    let length = match &value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(format!("unsupported type {}", type_name(other)).into()),
    };
    program.push(Value::from(length as i64));
    Ok(())
}

fn op_keys(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_value()?;
    let Value::Object(map) = value else {
        return Err(format!("unsupported type {}", type_name(&value)).into());
    };
    let keys = map.keys().map(|k| Value::String(k.clone())).collect();
    program.push(Value::Array(keys));
    Ok(())
}

fn op_values(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_value()?;
    let Value::Object(map) = value else {
        return Err(format!("unsupported type {}", type_name(&value)).into());
    };
    let values = map.into_iter().map(|(_, v)| v).collect();
    program.push(Value::Array(values));
    Ok(())
}

fn op_range(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    if program.stack.len() < 3 {
        return Err("stack underflow: expected 3 values".into());
    }
    let step = program.pop_number()?;
    let stop = program.pop_number()?;
    let start = program.pop_number()?;
    if step == 0.0 {
        return Err("range step cannot be zero".into());
    }
    let mut result = Vec::new();
    let mut i = start;
    while i < stop {
        result.push(number_value(i)?);
        i += step;
    }
    program.push(Value::Array(result));
    Ok(())
}

fn op_sort(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_value()?;
    let Value::Array(mut items) = value else {
        return Err(format!(
            "unsupported type {} for sorting, expected array",
            type_name(&value)
        )
        .into());
    };
    if items.is_empty() {
        program.push(Value::Array(items));
        return Ok(());
    }
    match &items[0] {
        Value::Number(_) => {
            if !items.iter().all(|item| item.is_number()) {
                return Err("array contains mixed types".into());
            }
            items.sort_by(|a, b| {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        Value::String(_) => {
            if !items.iter().all(|item| item.is_string()) {
                return Err("array contains mixed types".into());
            }
            items.sort_by(|a, b| a.as_str().unwrap_or("").cmp(b.as_str().unwrap_or("")));
        }
        _ => return Err("array contains unsortable types".into()),
    }
    program.push(Value::Array(items));
    Ok(())
}

// ---------------------------------------------------------------------------
// Set operations
// ---------------------------------------------------------------------------

/// Hashable identity for set-operation elements, which must be scalars.
/// Numbers key by their double value so `2` and `2.0` collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SetKey {
    Null,
    Bool(bool),
    Number(u64),
    Str(String),
}

fn scalar_key(value: &Value) -> Result<SetKey, OpError> {
    Ok(match value {
        Value::Null => SetKey::Null,
        Value::Bool(b) => SetKey::Bool(*b),
        Value::Number(n) => {
            let x = n.as_f64().unwrap_or(f64::NAN);
            let x = if x == 0.0 { 0.0 } else { x };
            SetKey::Number(x.to_bits())
        }
        Value::String(s) => SetKey::Str(s.clone()),
        other => {
            return Err(format!(
                "unsupported type {} in array, expected number, string, boolean or null",
                type_name(other)
            )
            .into())
        }
    })
}

fn pop_two_scalar_arrays(program: &mut Program) -> Result<(Vec<Value>, Vec<Value>), OpError> {
    if program.stack.len() < 2 {
        return Err("stack underflow: expected 2 values".into());
    }
    let second = program.pop_array()?;
    let first = program.pop_array()?;
    for item in first.iter().chain(second.iter()) {
        scalar_key(item)?;
    }
    Ok((first, second))
}

fn op_union(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (first, second) = pop_two_scalar_arrays(program)?;
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for item in first.into_iter().chain(second) {
        if seen.insert(scalar_key(&item)?) {
            result.push(item);
        }
    }
    program.push(Value::Array(result));
    Ok(())
}

fn op_intersection(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (first, second) = pop_two_scalar_arrays(program)?;
    let mut keys: HashSet<SetKey> = HashSet::new();
    for item in &first {
        keys.insert(scalar_key(item)?);
    }
    let mut result = Vec::new();
    for item in second {
        // Removing as we match keeps the intersection de-duplicated.
        if keys.remove(&scalar_key(&item)?) {
            result.push(item);
        }
    }
    program.push(Value::Array(result));
    Ok(())
}

fn op_difference(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (first, second) = pop_two_scalar_arrays(program)?;
    let mut exclude: HashSet<SetKey> = HashSet::new();
    for item in &second {
        exclude.insert(scalar_key(item)?);
    }
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for item in first {
        let key = scalar_key(&item)?;
        if !exclude.contains(&key) && seen.insert(key) {
            result.push(item);
        }
    }
    program.push(Value::Array(result));
    Ok(())
}

// ---------------------------------------------------------------------------
// Higher-order operations
// ---------------------------------------------------------------------------

/// Pop the (input array, loop variable name, body) triple shared by `map`
/// and `filter`.
fn pop_collection_args(
    program: &mut Program,
) -> Result<(Vec<Value>, String, Vec<Operation>), OpError> {
    let values = program.popn(3)?;
    let Value::Array(input) = &values[0] else {
        return Err(format!(
            "expected an array on stack for the input, got {}",
            type_name(&values[0])
        )
        .into());
    };
    let Value::String(var_name) = &values[1] else {
        return Err(format!(
            "expected a string on stack for the loop variable, got {}",
            type_name(&values[1])
        )
        .into());
    };
    let ops = parse_ops(&values[2])
        .map_err(|err| OpError::Message(format!("invalid operations block: {err}")))?;
    Ok((input.clone(), var_name.clone(), ops))
}

fn op_map(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (input, var_name, body) = pop_collection_args(program)?;
    let mut result = Vec::with_capacity(input.len());
    for item in input {
        program.variables.borrow_mut().insert(var_name.clone(), item);
        program.execute_block(body.clone(), Value::from("map_ops_from_stack"), true)?;
        result.push(program.pop_value()?);
    }
    program.push(Value::Array(result));
    Ok(())
}

fn op_filter(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let (input, var_name, body) = pop_collection_args(program)?;
    let mut result = Vec::new();
    for item in input {
        program
            .variables
            .borrow_mut()
            .insert(var_name.clone(), item.clone());
        program.execute_block(body.clone(), Value::from("filter_ops_from_stack"), true)?;
        if program.pop_bool()? {
            result.push(item);
        }
    }
    program.push(Value::Array(result));
    Ok(())
}

fn op_reduce(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let values = program.popn(3)?;
    let Value::Array(input) = &values[0] else {
        return Err(format!(
            "expected an array on stack for the input, got {}",
            type_name(&values[0])
        )
        .into());
    };
    let body = parse_ops(&values[1])
        .map_err(|err| OpError::Message(format!("invalid operations block: {err}")))?;
    let mut accumulator = values[2].clone();
    for item in input {
        program.push(accumulator);
        program.push(item.clone());
        let stack_len = program.stack.len();
        program.execute_block(body.clone(), Value::from("reduce_ops_from_stack"), true)?;
        if program.stack.len() == stack_len {
            return Err("operations block did not push a result to the stack".into());
        }
        accumulator = program.pop_value()?;
    }
    program.push(accumulator);
    Ok(())
}

fn op_join(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let values = program.popn(5)?;
    let Value::Array(left) = &values[0] else {
        return Err(format!(
            "expected an array on stack for the left input, got {}",
            type_name(&values[0])
        )
        .into());
    };
    let Value::Array(right) = &values[1] else {
        return Err(format!(
            "expected an array on stack for the right input, got {}",
            type_name(&values[1])
        )
        .into());
    };
    let Value::String(left_name) = &values[2] else {
        return Err(format!(
            "expected a string on stack for the left name, got {}",
            type_name(&values[2])
        )
        .into());
    };
    let Value::String(right_name) = &values[3] else {
        return Err(format!(
            "expected a string on stack for the right name, got {}",
            type_name(&values[3])
        )
        .into());
    };
    let body = parse_ops(&values[4])
        .map_err(|err| OpError::Message(format!("invalid operations block: {err}")))?;

    let mut result = Vec::new();
    for left_item in left {
        for right_item in right {
            {
                let mut vars = program.variables.borrow_mut();
                vars.insert(left_name.clone(), left_item.clone());
                vars.insert(right_name.clone(), right_item.clone());
            }
            program.execute_block(body.clone(), Value::from("join_ops_from_stack"), true)?;
            if program.pop_bool()? {
                let mut pair = Map::new();
                pair.insert(left_name.clone(), left_item.clone());
                pair.insert(right_name.clone(), right_item.clone());
                result.push(Value::Object(pair));
            }
        }
    }
    program.push(Value::Array(result));
    Ok(())
}

fn op_for(program: &mut Program, op: &Operation) -> OpResult {
    if op.args.len() != 3 {
        return Err(format!(
            "expected 3 arguments: loop variable, collection, body, got {}",
            op.args.len()
        )
        .into());
    }
    let Value::String(loop_var) = &op.args[0] else {
        return Err(format!(
            "expected the loop variable to be a string, got {}",
            type_name(&op.args[0])
        )
        .into());
    };
    let mut collection = op.args[1].clone();
    if collection.is_string() {
        // A string collection names a variable holding the real one.
        collection = program.get_value_for_path(&collection)?;
    }
    let body = parse_ops(&op.args[2])
        .map_err(|err| OpError::Message(format!("invalid body operations: {err}")))?;

    match collection {
        Value::Array(items) => {
            for item in items {
                program.variables.borrow_mut().insert(loop_var.clone(), item);
                match program.execute_block(body.clone(), Value::from(2u64), true) {
                    Ok(()) | Err(Signal::Continue) => {}
                    Err(Signal::Break) => break,
                    Err(signal) => return Err(signal.into()),
                }
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                {
                    let mut vars = program.variables.borrow_mut();
                    vars.insert(loop_var.clone(), Value::String(key));
                    vars.insert(format!("{loop_var}_value"), value);
                }
                match program.execute_block(body.clone(), Value::from(2u64), true) {
                    Ok(()) | Err(Signal::Continue) => {}
                    Err(Signal::Break) => break,
                    Err(signal) => return Err(signal.into()),
                }
            }
        }
        other => {
            return Err(format!("unsupported collection type {}", type_name(&other)).into())
        }
    }
    Ok(())
}

fn op_while(program: &mut Program, op: &Operation) -> OpResult {
    if op.args.len() != 2 {
        return Err(format!(
            "expected 2 arguments: condition path and body, got {}",
            op.args.len()
        )
        .into());
    }
    let Value::String(condition_path) = &op.args[0] else {
        return Err(format!(
            "expected the condition path to be a string, got {}",
            type_name(&op.args[0])
        )
        .into());
    };
    let body = parse_ops(&op.args[1])
        .map_err(|err| OpError::Message(format!("invalid body operations: {err}")))?;

    loop {
        // Re-fetch the condition each pass; the body is expected to flip it.
        let condition = program.get_value_for_path(&op.args[0])?;
        let Value::Bool(condition) = condition else {
            return Err(format!(
                "expected a boolean condition at '{condition_path}', got {}",
                type_name(&condition)
            )
            .into());
        };
        if !condition {
            break;
        }
        match program.execute_block(body.clone(), Value::from(1u64), true) {
            Ok(()) | Err(Signal::Continue) => {}
            Err(Signal::Break) => break,
            Err(signal) => return Err(signal.into()),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Control and error flow
// ---------------------------------------------------------------------------

fn op_if(program: &mut Program, op: &Operation) -> OpResult {
    if op.args.is_empty() || op.args.len() > 2 {
        return Err(format!(
            "expected 1 or 2 array arguments for the then/else bodies, got {}",
            op.args.len()
        )
        .into());
    }
    let then_body = parse_ops(&op.args[0])
        .map_err(|err| OpError::Message(format!("invalid 'then' body: {err}")))?;
    let else_body = match op.args.get(1) {
        Some(arg) => Some(
            parse_ops(arg).map_err(|err| OpError::Message(format!("invalid 'else' body: {err}")))?,
        ),
        None => None,
    };

    let condition = program.pop_value()?;
    let Value::Bool(condition) = condition else {
        return Err(format!(
            "expected a boolean condition on stack, got {}",
            type_name(&condition)
        )
        .into());
    };

    if condition {
        program.execute_block(then_body, Value::from(0u64), true)?;
    } else if let Some(body) = else_body {
        program.execute_block(body, Value::from(1u64), true)?;
    }
    Ok(())
}

fn op_try(program: &mut Program, op: &Operation) -> OpResult {
    if op.args.len() < 2 || op.args.len() > 3 {
        return Err(format!(
            "expected 2 or 3 arguments: try body, catch variable, optional catch body, got {}",
            op.args.len()
        )
        .into());
    }
    let try_body = parse_ops(&op.args[0])
        .map_err(|err| OpError::Message(format!("invalid try body: {err}")))?;
    let Value::String(catch_var) = &op.args[1] else {
        return Err(format!(
            "expected the catch variable to be a string, got {}",
            type_name(&op.args[1])
        )
        .into());
    };
    let catch_body = match op.args.get(2) {
        Some(arg) => Some(
            parse_ops(arg).map_err(|err| OpError::Message(format!("invalid catch body: {err}")))?,
        ),
        None => None,
    };

    // Signals pass through unchanged; only the error slot is caught.
    program.execute_block(try_body, Value::from(0u64), true)?;

    if let Some(caught) = program.error.take() {
        program
            .variables
            .borrow_mut()
            .insert(catch_var.clone(), Value::String(caught.message));
        if let Some(body) = catch_body {
            let _ = program.execute_block(body, Value::from(2u64), true);
        }
    }
    Ok(())
}

fn op_raise(program: &mut Program, op: &Operation) -> OpResult {
    let message = program.pop_string()?;
    let err = program.new_error(&op.name, message);
    program.error = Some(err);
    Ok(())
}

fn op_assert(program: &mut Program, op: &Operation) -> OpResult {
    let value = program.pop_value()?;
    let Value::Bool(condition) = value else {
        return Err(format!(
            "expected a boolean on the stack, got {}",
            type_name(&value)
        )
        .into());
    };
    if !condition {
        let message = match op.args.first() {
            Some(Value::String(custom)) => custom.clone(),
            _ => "assertion failed".to_string(),
        };
        let err = program.new_error(&op.name, message);
        program.error = Some(err);
    }
    Ok(())
}

fn op_call(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let func = program.pop_value()?;
    let func_ops = match &func {
        Value::String(name) => {
            let code = program.get_value_for_path(&func).map_err(|err| match err {
                OpError::Message(msg) => {
                    OpError::Message(format!("could not find function '{name}': {msg}"))
                }
                other => other,
            })?;
            parse_ops(&code).map_err(|err| {
                OpError::Message(format!("invalid operations block for function '{name}': {err}"))
            })?
        }
        Value::Array(_) => parse_ops(&func)
            .map_err(|err| OpError::Message(format!("invalid raw operations block: {err}")))?,
        other => {
            return Err(format!(
                "expected a function name (string) or raw function code (array) on the stack, got {}",
                type_name(other)
            )
            .into())
        }
    };
    // A fresh scope: the callee sees the caller's variables only through the
    // global fallback, and Return ends the frame inside execute_frame.
    program.execute_block(func_ops, Value::from("function_call"), false)?;
    Ok(())
}

fn op_return(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    if program.call_stack.len() <= 1 {
        return Err("return can only be called within a function execution context".into());
    }
    Err(Signal::Return.into())
}

fn op_break(_program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    Err(Signal::Break.into())
}

fn op_continue(_program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    Err(Signal::Continue.into())
}

fn op_exit(_program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    Err(Signal::Exit.into())
}

fn op_breakpoint(_program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    Err(Signal::Breakpoint.into())
}

fn op_noop(_program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Schema validation
// ---------------------------------------------------------------------------

fn op_valid(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let values = program.popn(2)?;
    let schema = &values[0];
    let document = &values[1];
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| OpError::Message(format!("failed to compile schema: {err}")))?;
    program.push(Value::Bool(validator.is_valid(document)));
    Ok(())
}

// ---------------------------------------------------------------------------
// Reflective sub-program operations
// ---------------------------------------------------------------------------

fn op_run(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let mut sub = program.pop_sub_program()?;
    if let Err(signal) = sub.run() {
        if signal != Signal::Exit {
            return Err(format!("unexpected signal during sub-program execution: {signal}").into());
        }
    }
    program.push(sub.to_value()?);
    Ok(())
}

fn op_step(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let mut sub = program.pop_sub_program()?;
    if sub.code.is_empty() {
        program.push(sub.to_value()?);
        return Ok(());
    }
    if sub.current_frame().is_none() {
        let frame = CallFrame {
            ops: sub.code.clone(),
            ip: 0,
            base_path: vec![Value::from("code")],
            variables: Rc::clone(&sub.variables),
        };
        sub.call_stack.push(frame);
    }

    let executable = sub
        .current_frame()
        .is_some_and(|frame| frame.ip < frame.ops.len());
    if executable && sub.save_history {
        let before = sub.to_value()?;
        step_sub_instruction(&mut sub)?;
        let after = sub.to_value()?;
        // A reverse delta: applying it to the post-state restores the
        // pre-state. Both sides carry the history as it was, so the patch
        // never touches the history field itself.
        let patch = jisp_patch::diff(&after, &before);
        sub.history.push(patch);
    } else if executable {
        step_sub_instruction(&mut sub)?;
    }
    program.push(sub.to_value()?);
    Ok(())
}

fn step_sub_instruction(sub: &mut Program) -> OpResult {
    match sub.execute_instruction() {
        Ok(()) | Err(Signal::Breakpoint) => Ok(()),
        Err(signal) => Err(format!("during single instruction execution: {signal}").into()),
    }
}

fn op_undo(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let sub = program.pop_sub_program()?;
    let Some(patch) = sub.history.last().cloned() else {
        return Err("no history to undo".into());
    };
    let serialized = sub.to_value()?;
    let reverted = jisp_patch::apply(serialized, &patch)
        .map_err(|err| OpError::Message(format!("failed to apply patch: {err}")))?;
    let mut reverted = Program::from_value(reverted)
        .map_err(|err| OpError::Message(format!("failed to reconstruct reverted program: {err}")))?;
    reverted.history.pop();
    program.push(reverted.to_value()?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Process table, spawn and await
// ---------------------------------------------------------------------------

/// The completion slot for one spawned program. The `done` channel is never
/// sent on; the worker dropping its sender is the one-shot completion
/// signal, so any number of `await`s unblock.
struct ProcessSlot {
    state: Mutex<Option<Value>>,
    done: Receiver<()>,
}

struct ProcessTable {
    programs: Mutex<HashMap<String, Arc<ProcessSlot>>>,
    next_pid: AtomicU64,
}

impl ProcessTable {
    fn register(&self) -> (String, Arc<ProcessSlot>, Sender<()>) {
        let pid = format!("pid-{}", self.next_pid.fetch_add(1, Ordering::Relaxed) + 1);
        let (done_tx, done_rx) = bounded(0);
        let slot = Arc::new(ProcessSlot {
            state: Mutex::new(None),
            done: done_rx,
        });
        self.programs
            .lock()
            .unwrap()
            .insert(pid.clone(), Arc::clone(&slot));
        (pid, slot, done_tx)
    }

    fn get(&self, pid: &str) -> Option<Arc<ProcessSlot>> {
        self.programs.lock().unwrap().get(pid).cloned()
    }
}

fn process_table() -> &'static ProcessTable {
    static TABLE: OnceLock<ProcessTable> = OnceLock::new();
    TABLE.get_or_init(|| ProcessTable {
        programs: Mutex::new(HashMap::new()),
        next_pid: AtomicU64::new(0),
    })
}

fn op_spawn(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let mut sub = program.pop_sub_program()?;
    let (pid, slot, done_tx) = process_table().register();
    sub.pid = Some(pid);
    sub.running = true;

    // The handle on the stack is a snapshot; the worker owns its own copy
    // rebuilt from the same document.
    let handle = sub.to_value()?;
    program.push(handle.clone());

    thread::spawn(move || {
        let Ok(mut worker) = Program::from_value(handle) else {
            drop(done_tx);
            return;
        };
        let _ = worker.run();
        worker.running = false;
        if let Ok(state) = worker.to_value() {
            *slot.state.lock().unwrap() = Some(state);
        }
        drop(done_tx);
    });
    Ok(())
}

fn op_await(program: &mut Program, op: &Operation) -> OpResult {
    expect_no_args(op)?;
    let value = program.pop_value()?;
    let handle = Program::from_value(value).map_err(|err| {
        OpError::Message(format!(
            "could not reconstruct sub-program handle from stack value: {err}"
        ))
    })?;
    let Some(pid) = handle.pid else {
        return Err("program object on stack has no pid, was it spawned?".into());
    };
    let Some(slot) = process_table().get(&pid) else {
        return Err(format!("no running program found for pid '{pid}'").into());
    };
    // Blocks until the worker drops its sender.
    let _ = slot.done.recv();
    let state = slot.state.lock().unwrap().clone();
    let Some(state) = state else {
        return Err(format!("spawned program '{pid}' produced no final state").into());
    };
    program.push(state);
    Ok(())
}
