//! Per-function control-flow state.
//!
//! Lowering pushes one frame per lexical construct (block, if-arm, loop
//! body, switch case) and records what that construct can do: return,
//! break, continue, throw. Popping hands the child's flags back to the
//! caller, which decides what propagates — an `if` only returns when both
//! arms do, a loop swallows its own breaks, a `do` body passes everything
//! through because it always executes.
//!
//! Frames also carry the active break/continue labels and the scoped
//! locals of the construct, including virtual (constant-folded) locals
//! that never get a slot.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::program::ConstantValue;
use crate::types::Type;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FlowFlags: u8 {
        const RETURNS            = 1 << 0;
        const POSSIBLY_BREAKS    = 1 << 1;
        const POSSIBLY_CONTINUES = 1 << 2;
        const POSSIBLY_THROWS    = 1 << 3;
    }
}

/// A local introduced by a lexical scope. Virtual locals carry index `-1`
/// and a cached constant that replaces every read.
#[derive(Clone, Debug)]
pub struct ScopedLocal {
    pub index: i32,
    pub ty: Type,
    pub constant_value: Option<ConstantValue>,
    pub is_const: bool,
}

#[derive(Debug, Default)]
struct Frame {
    flags: FlowFlags,
    break_label: Option<String>,
    continue_label: Option<String>,
    scoped: HashMap<String, ScopedLocal>,
}

/// The flow frame stack of the function currently being compiled.
#[derive(Debug)]
pub struct Flow {
    frames: Vec<Frame>,
}

impl Flow {
    pub fn new() -> Flow {
        Flow {
            frames: vec![Frame::default()],
        }
    }

    /// Enters a plain scope: a block, an if-arm, a loop body without its
    /// own labels.
    pub fn enter_scope(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Enters a loop body, binding both labels.
    pub fn enter_loop(&mut self, break_label: String, continue_label: String) {
        self.frames.push(Frame {
            break_label: Some(break_label),
            continue_label: Some(continue_label),
            ..Frame::default()
        });
    }

    /// Enters a switch case, which binds only the break label; `continue`
    /// still refers to the enclosing loop.
    pub fn enter_break_context(&mut self, break_label: String) {
        self.frames.push(Frame {
            break_label: Some(break_label),
            ..Frame::default()
        });
    }

    /// Leaves the innermost frame, returning its accumulated flags for
    /// the caller to merge.
    pub fn leave(&mut self) -> FlowFlags {
        assert!(self.frames.len() > 1, "cannot leave the root flow frame");
        self.frames.pop().expect("flow frame stack underflow").flags
    }

    pub fn set(&mut self, flags: FlowFlags) {
        let top = self.frames.last_mut().expect("empty flow frame stack");
        top.flags |= flags;
    }

    /// Merges flags a child construct propagates into the current frame.
    pub fn inherit(&mut self, flags: FlowFlags) {
        self.set(flags);
    }

    pub fn is(&self, flags: FlowFlags) -> bool {
        self.frames
            .last()
            .expect("empty flow frame stack")
            .flags
            .contains(flags)
    }

    /// Nearest enclosing break label, if any.
    pub fn break_label(&self) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.break_label.as_deref())
    }

    /// Nearest enclosing continue label, if any.
    pub fn continue_label(&self) -> Option<&str> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.continue_label.as_deref())
    }

    /// Adds a scoped local to the current frame. Returns `false` when the
    /// name already exists in this scope.
    pub fn add_scoped_local(&mut self, name: String, local: ScopedLocal) -> bool {
        let top = self.frames.last_mut().expect("empty flow frame stack");
        if top.scoped.contains_key(&name) {
            return false;
        }
        top.scoped.insert(name, local);
        true
    }

    /// Looks a name up through all enclosing scopes, innermost first.
    pub fn lookup_scoped(&self, name: &str) -> Option<&ScopedLocal> {
        self.frames.iter().rev().find_map(|f| f.scoped.get(name))
    }
}

impl Default for Flow {
    fn default() -> Self {
        Flow::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_propagates_only_when_inherited() {
        let mut flow = Flow::new();
        flow.enter_scope();
        flow.set(FlowFlags::RETURNS);
        let inner = flow.leave();
        assert!(inner.contains(FlowFlags::RETURNS));
        assert!(!flow.is(FlowFlags::RETURNS));
        flow.inherit(inner & FlowFlags::RETURNS);
        assert!(flow.is(FlowFlags::RETURNS));
    }

    #[test]
    fn labels_resolve_to_the_nearest_loop() {
        let mut flow = Flow::new();
        assert!(flow.break_label().is_none());
        flow.enter_loop("break|0".into(), "continue|0".into());
        flow.enter_break_context("case0|1".into());
        assert_eq!(flow.break_label(), Some("case0|1"));
        assert_eq!(flow.continue_label(), Some("continue|0"));
        flow.leave();
        assert_eq!(flow.break_label(), Some("break|0"));
    }

    #[test]
    fn scoped_locals_shadow_outer_scopes_but_not_siblings() {
        let mut flow = Flow::new();
        assert!(flow.add_scoped_local(
            "x".into(),
            ScopedLocal { index: 1, ty: Type::I32, constant_value: None, is_const: false }
        ));
        flow.enter_scope();
        assert!(flow.add_scoped_local(
            "x".into(),
            ScopedLocal { index: 2, ty: Type::I64, constant_value: None, is_const: false }
        ));
        assert_eq!(flow.lookup_scoped("x").unwrap().index, 2);
        flow.leave();
        assert_eq!(flow.lookup_scoped("x").unwrap().index, 1);
        assert!(!flow.add_scoped_local(
            "x".into(),
            ScopedLocal { index: 3, ty: Type::I32, constant_value: None, is_const: false }
        ));
    }
}
