//! Canonical DAG path tracking for use-sites.
//!
//! The stack is rooted at Root. Step segments are siblings, not nested:
//! entering a new step replaces the previous one. Decorator segments
//! nest, and sibling decorators of the same name at the same level are
//! distinguished by a per-level index that resets on each step.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Root,
    Step(usize),
    Decorator { name: String, index: usize },
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("root"),
            Self::Step(n) => write!(f, "step-{}", n),
            Self::Decorator { name, index } => write!(f, "@{}[{}]", name, index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathStack {
    segments: Vec<PathSegment>,
    step_counter: usize,
    /// Next index per (level, decorator name); reset on each step
    counts: HashMap<(usize, String), usize>,
}

impl Default for PathStack {
    fn default() -> Self {
        Self::new()
    }
}

impl PathStack {
    pub fn new() -> Self {
        Self {
            segments: vec![PathSegment::Root],
            step_counter: 0,
            counts: HashMap::new(),
        }
    }

    /// Replace any existing top-of-stack step with the next step and
    /// reset the per-level decorator counts.
    pub fn enter_step(&mut self) -> usize {
        if matches!(self.segments.last(), Some(PathSegment::Step(_))) {
            self.segments.pop();
        }
        self.step_counter += 1;
        self.segments.push(PathSegment::Step(self.step_counter));
        self.counts.clear();
        self.step_counter
    }

    /// Push a decorator segment; returns its index among same-named
    /// siblings at this level.
    pub fn enter_decorator(&mut self, name: &str) -> usize {
        let level = self.segments.len();
        let slot = self.counts.entry((level, name.to_string())).or_insert(0);
        let index = *slot;
        *slot += 1;
        self.segments.push(PathSegment::Decorator {
            name: name.to_string(),
            index,
        });
        index
    }

    pub fn exit_decorator(&mut self) {
        if matches!(self.segments.last(), Some(PathSegment::Decorator { .. })) {
            self.segments.pop();
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Render the current stack as
    /// `root/step-N/@dec1[i1]/.../params/<param_name>`.
    pub fn render(&self, param_name: &str) -> String {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(&segment.to_string());
        }
        out.push_str("/params/");
        out.push_str(param_name);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path() {
        let path = PathStack::new();
        assert_eq!(path.render("command"), "root/params/command");
    }

    #[test]
    fn test_step_and_decorator() {
        let mut path = PathStack::new();
        path.enter_step();
        path.enter_decorator("shell");
        assert_eq!(path.render("command"), "root/step-1/@shell[0]/params/command");
    }

    #[test]
    fn test_steps_replace_not_nest() {
        let mut path = PathStack::new();
        path.enter_step();
        path.enter_step();
        assert_eq!(path.render("x"), "root/step-2/params/x");
        let steps = path
            .segments()
            .iter()
            .filter(|s| matches!(s, PathSegment::Step(_)))
            .count();
        assert_eq!(steps, 1);
    }

    #[test]
    fn test_sibling_indices() {
        let mut path = PathStack::new();
        path.enter_step();
        assert_eq!(path.enter_decorator("retry"), 0);
        path.exit_decorator();
        assert_eq!(path.enter_decorator("retry"), 1);
        assert_eq!(path.render("cmd"), "root/step-1/@retry[1]/params/cmd");
    }

    #[test]
    fn test_nested_same_name_independent_indices() {
        let mut path = PathStack::new();
        path.enter_step();
        assert_eq!(path.enter_decorator("retry"), 0);
        // Nested level: its own count starts over
        assert_eq!(path.enter_decorator("retry"), 0);
        assert_eq!(path.render("cmd"), "root/step-1/@retry[0]/@retry[0]/params/cmd");
    }

    #[test]
    fn test_indices_reset_on_new_step() {
        let mut path = PathStack::new();
        path.enter_step();
        path.enter_decorator("shell");
        path.exit_decorator();
        path.enter_step();
        assert_eq!(path.enter_decorator("shell"), 0);
    }
}
