//! Graphviz output for slices: one node per assignment (and per free input register), with an edge
//! from each assignment to each definition it reads.

use crate::arch::Architecture;
use crate::containers::unordered::UnorderedMap;
use crate::error::Result;
use crate::expr::{Assignment, VersionedRegister};
use crate::slicer::referenced_registers;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Node {
    /// Index into the slice
    Assignment(usize),
    /// Index into the free inputs
    Input(usize),
}
type Edge = (Node, Node, String);

struct Graph<'a> {
    slice: &'a [Assignment],
    inputs: Vec<VersionedRegister>,
    edges: Vec<Edge>,
}

impl<'a> Graph<'a> {
    fn new(slice: &'a [Assignment], arch: &Architecture) -> Self {
        let defs: UnorderedMap<&VersionedRegister, usize> = slice
            .iter()
            .enumerate()
            .filter_map(|(i, a)| Some((a.defined_register()?, i)))
            .collect();
        let mut inputs: Vec<VersionedRegister> = vec![];
        let mut edges: Vec<Edge> = vec![];
        for (i, a) in slice.iter().enumerate() {
            for r in referenced_registers(a, arch) {
                let target = match defs.get(&r) {
                    Some(&j) => Node::Assignment(j),
                    None => match inputs.iter().position(|x| x == &r) {
                        Some(k) => Node::Input(k),
                        None => {
                            inputs.push(r.clone());
                            Node::Input(inputs.len() - 1)
                        }
                    },
                };
                edges.push((Node::Assignment(i), target, r.to_string()));
            }
        }
        Self {
            slice,
            inputs,
            edges,
        }
    }
}

impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("Slice").expect("valid identifier")
    }
    fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
        dot::Id::new(match n {
            Node::Assignment(i) => format!("a{}", i),
            Node::Input(i) => format!("in{}", i),
        })
        .expect("identifiers are alphanumeric")
    }
    fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
        match n {
            Node::Assignment(i) => dot::LabelText::label(self.slice[*i].to_string()),
            Node::Input(i) => dot::LabelText::label(format!("input {}", self.inputs[*i])),
        }
    }
    fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
        match n {
            Node::Assignment(_) => Some(dot::LabelText::label("box")),
            Node::Input(_) => None,
        }
    }
    fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
        dot::LabelText::label(e.2.clone())
    }
}

impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, Node> {
        (0..self.slice.len())
            .map(Node::Assignment)
            .chain((0..self.inputs.len()).map(Node::Input))
            .collect::<Vec<_>>()
            .into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        self.edges.clone().into()
    }
    fn source(&self, e: &Edge) -> Node {
        e.0.clone()
    }
    fn target(&self, e: &Edge) -> Node {
        e.1.clone()
    }
}

/// Write a `.dot` representation of `slice` to `w`.
pub fn write_slice_dot<W: std::io::Write>(
    slice: &[Assignment],
    arch: &Architecture,
    w: &mut W,
) -> Result<()> {
    dot::render(&Graph::new(slice, arch), w)?;
    Ok(())
}

/// Generate a `.dot` representation of `slice`.
pub fn generate_slice_dot(slice: &[Assignment], arch: &Architecture) -> Result<String> {
    let mut s: Vec<u8> = vec![];
    write_slice_dot(slice, arch, &mut s)?;
    Ok(String::from_utf8_lossy(&s).into_owned())
}
