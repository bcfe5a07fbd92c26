//! Call frames and variable storage.
//!
//! The stack's bottom frame is always the global frame.  Variable lookups
//! go to the innermost frame that owns variables: `Engine` frames are
//! transparent bookkeeping markers, and a `GlobalAlias` frame redirects to
//! the global frame.

use std::collections::{BTreeMap, HashMap};

use crate::script::result::Flow;
use crate::script::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Global,
    Procedure,
    Scope,
    /// Evaluate at global scope until popped.
    GlobalAlias,
    /// Pushed by the engine around script, file and stream evaluation.
    Engine,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Scalar(Value),
    Array(BTreeMap<String, Value>),
    /// Alias for a variable in another frame (`global`).
    Link { frame: usize, name: String },
}

/// Failure of a variable operation, formatted the Tcl way:
/// `can't read "x": no such variable`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("can't {op} \"{name}\": {reason}")]
pub struct VarError {
    pub op: &'static str,
    pub name: String,
    pub reason: &'static str,
}

impl VarError {
    fn new(op: &'static str, name: &str, index: Option<&str>, reason: &'static str) -> Self {
        let name = match index {
            Some(i) => format!("{name}({i})"),
            None => name.to_owned(),
        };
        VarError { op, name, reason }
    }
}

impl From<VarError> for Flow {
    fn from(e: VarError) -> Self {
        Flow::error(e.to_string())
    }
}

#[derive(Debug)]
pub struct CallFrame {
    pub kind: FrameKind,
    pub name: String,
    /// Pushed by the engine itself rather than by a command.
    pub automatic: bool,
    disposed: bool,
    vars: HashMap<String, Variable>,
}

impl CallFrame {
    pub fn new(kind: FrameKind, name: impl Into<String>) -> Self {
        CallFrame {
            kind,
            name: name.into(),
            automatic: matches!(kind, FrameKind::Engine | FrameKind::GlobalAlias),
            disposed: false,
            vars: HashMap::new(),
        }
    }

    pub fn procedure(name: impl Into<String>) -> Self {
        Self::new(FrameKind::Procedure, name)
    }

    pub fn engine(name: impl Into<String>) -> Self {
        Self::new(FrameKind::Engine, name)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.vars.clear();
    }

    /// Define a local scalar directly (procedure arguments).
    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), Variable::Scalar(value));
    }

    fn owns_variables(&self) -> bool {
        matches!(self.kind, FrameKind::Global | FrameKind::Procedure | FrameKind::Scope)
    }
}

#[derive(Debug)]
pub struct CallFrameStack {
    frames: Vec<CallFrame>,
}

impl Default for CallFrameStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CallFrameStack {
    pub fn new() -> Self {
        CallFrameStack { frames: vec![CallFrame::new(FrameKind::Global, "global")] }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push a frame, returning the depth before the push.
    pub fn push(&mut self, frame: CallFrame) -> usize {
        let before = self.frames.len();
        self.frames.push(frame);
        before
    }

    /// Pop the innermost frame.  The global frame is never popped.
    pub fn pop(&mut self) -> Option<CallFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    pub fn peek(&self) -> &CallFrame {
        // The global frame is always present.
        &self.frames[self.frames.len() - 1]
    }

    pub fn peek_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Pop every frame above `depth`, returning how many were removed.
    pub fn pop_to(&mut self, depth: usize) -> usize {
        let depth = depth.max(1);
        let mut popped = 0;
        while self.frames.len() > depth {
            self.frames.pop();
            popped += 1;
        }
        popped
    }

    /// Pop automatic frames left behind by an aborted call until the stack
    /// is back at `depth`.  Stops early at a frame that is not automatic or
    /// is already disposed.
    pub fn pop_automatic_until(&mut self, depth: usize) -> usize {
        let depth = depth.max(1);
        let mut popped = 0;
        let bound = self.frames.len().saturating_sub(depth);
        while popped < bound && self.frames.len() > depth {
            let top = self.peek();
            if top.disposed || !top.automatic {
                break;
            }
            self.frames.pop();
            popped += 1;
        }
        popped
    }

    /// Whether a procedure frame is active below any alias.
    pub fn in_procedure(&self) -> bool {
        self.frames[self.variable_frame()].kind == FrameKind::Procedure
    }

    /// Index of the frame that receives variable operations.
    pub fn variable_frame(&self) -> usize {
        for (i, f) in self.frames.iter().enumerate().rev() {
            match f.kind {
                FrameKind::GlobalAlias => return 0,
                FrameKind::Engine => continue,
                _ if f.owns_variables() => return i,
                _ => continue,
            }
        }
        0
    }

    /// Follow links from `(frame, name)` to the frame and name that hold the value.
    fn resolve(&self, mut frame: usize, name: &str) -> (usize, String) {
        let mut name = name.to_owned();
        for _ in 0..self.frames.len() {
            match self.frames.get(frame).and_then(|f| f.vars.get(&name)) {
                Some(Variable::Link { frame: f, name: n }) => {
                    frame = *f;
                    name = n.clone();
                }
                _ => break,
            }
        }
        (frame, name)
    }

    pub fn get(&self, name: &str, index: Option<&str>) -> Result<Value, VarError> {
        let (frame, name) = self.resolve(self.variable_frame(), name);
        let var = self.frames.get(frame).and_then(|f| f.vars.get(&name));
        match (var, index) {
            (None, _) | (Some(Variable::Link { .. }), _) => {
                Err(VarError::new("read", &name, index, "no such variable"))
            }
            (Some(Variable::Scalar(v)), None) => Ok(v.clone()),
            (Some(Variable::Scalar(_)), Some(_)) => {
                Err(VarError::new("read", &name, index, "variable isn't array"))
            }
            (Some(Variable::Array(_)), None) => {
                Err(VarError::new("read", &name, index, "variable is array"))
            }
            (Some(Variable::Array(map)), Some(i)) => map
                .get(i)
                .cloned()
                .ok_or_else(|| VarError::new("read", &name, index, "no such element in array")),
        }
    }

    pub fn set(&mut self, name: &str, index: Option<&str>, value: Value) -> Result<Value, VarError> {
        let (frame, name) = self.resolve(self.variable_frame(), name);
        let Some(target) = self.frames.get_mut(frame) else {
            return Err(VarError::new("set", &name, index, "no such variable"));
        };
        let slot = target.vars.get_mut(&name);
        match (slot, index) {
            (Some(Variable::Array(_)), None) => Err(VarError::new("set", &name, index, "variable is array")),
            (Some(Variable::Scalar(_)), Some(_)) => {
                Err(VarError::new("set", &name, index, "variable isn't array"))
            }
            (Some(Variable::Array(map)), Some(i)) => {
                map.insert(i.to_owned(), value.clone());
                Ok(value)
            }
            (_, Some(i)) => {
                let mut map = BTreeMap::new();
                map.insert(i.to_owned(), value.clone());
                target.vars.insert(name, Variable::Array(map));
                Ok(value)
            }
            (_, None) => {
                target.vars.insert(name, Variable::Scalar(value.clone()));
                Ok(value)
            }
        }
    }

    pub fn unset(&mut self, name: &str, index: Option<&str>) -> Result<(), VarError> {
        let local = self.variable_frame();
        let (frame, target_name) = self.resolve(local, name);
        let vars = &mut self.frames[frame].vars;
        match index {
            None => {
                if vars.remove(&target_name).is_none() {
                    return Err(VarError::new("unset", name, None, "no such variable"));
                }
            }
            Some(i) => match vars.get_mut(&target_name) {
                Some(Variable::Array(map)) => {
                    if map.remove(i).is_none() {
                        return Err(VarError::new("unset", name, index, "no such element in array"));
                    }
                }
                Some(_) => return Err(VarError::new("unset", name, index, "variable isn't array")),
                None => return Err(VarError::new("unset", name, index, "no such variable")),
            },
        }
        if index.is_none() && frame != local {
            self.frames[local].vars.remove(name);
        }
        Ok(())
    }

    pub fn exists(&self, name: &str, index: Option<&str>) -> bool {
        self.get(name, index).is_ok()
            || (index.is_none() && {
                let (frame, name) = self.resolve(self.variable_frame(), name);
                matches!(self.frames[frame].vars.get(&name), Some(Variable::Array(_)))
            })
    }

    /// Make `name` in the current variable frame refer to the global `name`.
    /// A no-op at global scope.
    pub fn link_global(&mut self, name: &str) {
        let local = self.variable_frame();
        if local == 0 {
            return;
        }
        self.frames[local]
            .vars
            .insert(name.to_owned(), Variable::Link { frame: 0, name: name.to_owned() });
    }

    pub fn global_get(&self, name: &str) -> Option<Value> {
        match self.frames[0].vars.get(name) {
            Some(Variable::Scalar(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn global_set(&mut self, name: &str, value: Value) {
        self.frames[0].vars.insert(name.to_owned(), Variable::Scalar(value));
    }

    /// Local variable names of the current variable frame, sorted.
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.frames[self.variable_frame()].vars.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_array_errors() {
        let mut s = CallFrameStack::new();
        assert_eq!(s.get("x", None).unwrap_err().to_string(), "can't read \"x\": no such variable");
        s.set("x", None, Value::from(1)).unwrap();
        assert_eq!(s.get("x", None).unwrap(), Value::Int(1));
        s.set("a", Some("k"), Value::from("v")).unwrap();
        assert_eq!(s.get("a", None).unwrap_err().to_string(), "can't read \"a\": variable is array");
        assert_eq!(
            s.get("a", Some("z")).unwrap_err().to_string(),
            "can't read \"a(z)\": no such element in array"
        );
        assert!(s.set("x", Some("i"), Value::empty()).is_err());
        assert!(s.exists("a", None));
    }

    #[test]
    fn procedure_frames_are_isolated_and_globals_link() {
        let mut s = CallFrameStack::new();
        s.set("g", None, Value::from("global")).unwrap();
        let depth = s.push(CallFrame::procedure("p"));
        assert!(s.get("g", None).is_err());
        s.link_global("g");
        assert_eq!(s.get("g", None).unwrap(), Value::from("global"));
        s.set("g", None, Value::from("changed")).unwrap();
        s.pop_to(depth);
        assert_eq!(s.global_get("g"), Some(Value::from("changed")));
    }

    #[test]
    fn engine_frames_are_transparent_and_alias_goes_global() {
        let mut s = CallFrameStack::new();
        s.push(CallFrame::procedure("p"));
        s.set("local", None, Value::from(1)).unwrap();
        s.push(CallFrame::engine("eval"));
        assert!(s.get("local", None).is_ok());
        s.push(CallFrame::new(FrameKind::GlobalAlias, "global"));
        assert!(s.get("local", None).is_err());
        s.set("top", None, Value::from(2)).unwrap();
        assert_eq!(s.global_get("top"), Some(Value::Int(2)));
    }

    #[test]
    fn pop_automatic_stops_at_disposed_or_manual_frames() {
        let mut s = CallFrameStack::new();
        s.push(CallFrame::procedure("p"));
        s.push(CallFrame::engine("a"));
        s.push(CallFrame::engine("b"));
        s.peek_mut().dispose();
        s.push(CallFrame::engine("c"));
        assert_eq!(s.pop_automatic_until(1), 1);
        assert_eq!(s.depth(), 4);
        s.pop();
        assert_eq!(s.pop_automatic_until(1), 1);
        assert_eq!(s.depth(), 2, "manual procedure frame is left alone");
        assert!(s.pop().is_some());
        assert!(s.pop().is_none(), "global frame stays");
    }
}
