//! Attribute tree: hierarchical attribute paths mapped to integer quarks.
//!
//! Attributes form a tree of named segments (for example
//! `CPUs/0/Current_thread`). Every node gets a [`Quark`] the first time it is
//! referenced. Quarks are handed out in increasing order and are never reused;
//! the tree has no removal operation. Quark [`ROOT_QUARK`] is the unnamed root
//! and carries no state.

use crate::buffer::{encoded_string_size, SafeBufferReader, SafeBufferWriter};
use crate::error::{Result, StateError};
use std::collections::HashMap;

/// Integer handle of an attribute.
pub type Quark = u32;

/// Quark of the attribute tree root.
pub const ROOT_QUARK: Quark = 0;

/// Path segment matching any single segment in [`AttributeTree::quarks_matching`].
pub const WILDCARD: &str = "*";

/// Separator used by [`AttributeTree::full_path`].
pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone)]
struct AttributeNode {
    name: String,
    parent: Quark,
    /// Children in creation order.
    children: Vec<Quark>,
    by_name: HashMap<String, Quark>,
}

impl AttributeNode {
    fn new(name: String, parent: Quark) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

/// Append-only mapping between attribute paths and quarks.
#[derive(Debug, Clone)]
pub struct AttributeTree {
    nodes: Vec<AttributeNode>,
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeTree {
    /// Creates a tree holding only the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![AttributeNode::new(String::new(), ROOT_QUARK)],
        }
    }

    /// Returns the number of quarks, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no attribute besides the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Returns true if `quark` names an attribute that can hold state.
    pub fn contains(&self, quark: Quark) -> bool {
        quark != ROOT_QUARK && (quark as usize) < self.nodes.len()
    }

    fn node(&self, quark: Quark) -> Result<&AttributeNode> {
        self.nodes
            .get(quark as usize)
            .ok_or_else(|| StateError::AttributeNotFound(format!("quark {quark}")))
    }

    /// Returns the quark for `path`, creating it and any missing ancestor.
    ///
    /// Calling this again with the same path always returns the same quark.
    pub fn get_or_create<S: AsRef<str>>(&mut self, path: &[S]) -> Quark {
        let mut current = ROOT_QUARK;
        for segment in path {
            current = self.child_or_create(current, segment.as_ref());
        }
        current
    }

    /// Same as [`get_or_create`](Self::get_or_create), starting from `parent`.
    pub fn get_or_create_relative<S: AsRef<str>>(
        &mut self,
        parent: Quark,
        path: &[S],
    ) -> Result<Quark> {
        self.node(parent)?;
        let mut current = parent;
        for segment in path {
            current = self.child_or_create(current, segment.as_ref());
        }
        Ok(current)
    }

    fn child_or_create(&mut self, parent: Quark, name: &str) -> Quark {
        if let Some(&existing) = self.nodes[parent as usize].by_name.get(name) {
            return existing;
        }
        let quark = self.nodes.len() as Quark;
        self.nodes.push(AttributeNode::new(name.to_string(), parent));
        let parent_node = &mut self.nodes[parent as usize];
        parent_node.children.push(quark);
        parent_node.by_name.insert(name.to_string(), quark);
        quark
    }

    /// Looks up the quark of an absolute path.
    pub fn quark<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.quark_relative(ROOT_QUARK, path)
    }

    /// Looks up the quark of `path` below `parent`.
    pub fn quark_relative<S: AsRef<str>>(&self, parent: Quark, path: &[S]) -> Result<Quark> {
        let mut current = parent;
        self.node(current)?;
        for segment in path {
            current = *self.nodes[current as usize]
                .by_name
                .get(segment.as_ref())
                .ok_or_else(|| StateError::AttributeNotFound(join_path(path)))?;
        }
        Ok(current)
    }

    /// Returns the path segments of `quark`, from the top level down.
    pub fn path(&self, quark: Quark) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = quark;
        while current != ROOT_QUARK {
            let node = self.node(current)?;
            segments.push(node.name.clone());
            current = node.parent;
        }
        segments.reverse();
        Ok(segments)
    }

    /// Returns the path of `quark` with segments joined by `/`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        self.path(quark).map(|segments| join_path(&segments))
    }

    /// Returns the last path segment of `quark`.
    pub fn name(&self, quark: Quark) -> Result<&str> {
        self.node(quark).map(|node| node.name.as_str())
    }

    /// Returns the parent of `quark`, or `None` for the root.
    pub fn parent(&self, quark: Quark) -> Result<Option<Quark>> {
        let node = self.node(quark)?;
        Ok((quark != ROOT_QUARK).then_some(node.parent))
    }

    /// Returns the children of `quark` in creation order, or its whole
    /// subtree in depth-first order when `recursive` is set.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        let node = self.node(quark)?;
        if !recursive {
            return Ok(node.children.clone());
        }
        let mut out = Vec::new();
        let mut stack: Vec<Quark> = node.children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.nodes[current as usize].children.iter().rev());
        }
        Ok(out)
    }

    /// Returns every quark whose path matches `pattern`, where a `*` segment
    /// matches any single segment.
    pub fn quarks_matching<S: AsRef<str>>(&self, pattern: &[S]) -> Vec<Quark> {
        let mut frontier = vec![ROOT_QUARK];
        for segment in pattern {
            let segment = segment.as_ref();
            let mut next = Vec::new();
            for quark in frontier {
                let node = &self.nodes[quark as usize];
                if segment == WILDCARD {
                    next.extend(node.children.iter().copied());
                } else if let Some(&child) = node.by_name.get(segment) {
                    next.push(child);
                }
            }
            frontier = next;
        }
        frontier.retain(|&quark| quark != ROOT_QUARK);
        frontier
    }

    /// Returns the number of bytes [`write_to`](Self::write_to) produces.
    pub fn encoded_size(&self) -> usize {
        4 + self.nodes[1..]
            .iter()
            .map(|node| 4 + encoded_string_size(&node.name))
            .sum::<usize>()
    }

    /// Serializes the tree.
    ///
    /// Format:
    /// - count: u32 (root excluded)
    /// - per quark, in quark order: parent u32, name (length-prefixed)
    pub fn write_to(&self, writer: &mut SafeBufferWriter<'_>) -> Result<()> {
        writer.put_u32((self.nodes.len() - 1) as u32)?;
        for node in &self.nodes[1..] {
            writer.put_u32(node.parent)?;
            writer.put_string(&node.name)?;
        }
        Ok(())
    }

    /// Rebuilds a tree serialized by [`write_to`](Self::write_to).
    pub fn read_from(reader: &mut SafeBufferReader<'_>) -> Result<Self> {
        let count = reader.get_u32()? as usize;
        let mut tree = Self::new();
        for _ in 0..count {
            let parent = reader.get_u32()?;
            let name = reader.get_string()?;
            if parent as usize >= tree.nodes.len() {
                return Err(StateError::corrupt(format!(
                    "attribute {name:?} references unknown parent {parent}"
                )));
            }
            let quark = tree.nodes.len() as Quark;
            if tree.child_or_create(parent, &name) != quark {
                return Err(StateError::corrupt(format!(
                    "duplicate attribute {name:?} under parent {parent}"
                )));
            }
        }
        Ok(tree)
    }
}

fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push(PATH_SEPARATOR);
        }
        out.push_str(segment.as_ref());
    }
    out
}
