use crate::types::*;

/// Find a pane by id anywhere in the tree (depth-first).
pub fn find_pane(node: &Node, id: NodeId) -> Option<&Pane> {
    match node {
        Node::Pane(p) => if p.id == id { Some(p) } else { None },
        Node::Split(s) => s.children.iter().find_map(|c| find_pane(c, id)),
    }
}

pub fn find_pane_mut(node: &mut Node, id: NodeId) -> Option<&mut Pane> {
    match node {
        Node::Pane(p) => if p.id == id { Some(p) } else { None },
        Node::Split(s) => s.children.iter_mut().find_map(|c| find_pane_mut(c, id)),
    }
}

/// Replace the pane with `pane_id`, wherever it sits, by a two-child split
/// along `kind`: the original pane first (its share halved), `second` after
/// it with the same halved share. The split inherits the pane's old share.
pub fn split_pane_node(node: &mut Node, pane_id: NodeId, kind: LayoutKind, split_id: NodeId, mut second: Pane) -> bool {
    match node {
        Node::Pane(p) if p.id == pane_id => {
            let size = p.size;
            let half = (size / 2).max(1);
            let old = std::mem::replace(node, Node::Split(Split { id: split_id, kind, children: Vec::new(), size }));
            if let (Node::Split(split), Node::Pane(mut first)) = (&mut *node, old) {
                first.size = half;
                second.size = half;
                split.children.push(Node::Pane(first));
                split.children.push(Node::Pane(second));
            }
            true
        }
        Node::Pane(_) => false,
        Node::Split(s) => {
            for child in s.children.iter_mut() {
                if split_pane_node(child, pane_id, kind, split_id, second.clone()) {
                    return true;
                }
            }
            false
        }
    }
}

/// Remove the pane with `pane_id` from the tree and return it. A split left
/// with a single child is replaced by that child (one promotion restores the
/// >=2-children invariant; ancestors keep their shape). Removing the root
/// pane is the caller's no-op case, not handled here.
pub fn remove_pane_node(node: &mut Node, pane_id: NodeId) -> Option<Pane> {
    let Node::Split(split) = node else { return None };
    if let Some(idx) = split.children.iter().position(|c| matches!(c, Node::Pane(p) if p.id == pane_id)) {
        let removed = match split.children.remove(idx) {
            Node::Pane(p) => p,
            Node::Split(s) => {
                // Guarded against by the position() match above.
                split.children.insert(idx, Node::Split(s));
                return None;
            }
        };
        if split.children.len() == 1 {
            let size = split.size;
            if let Some(mut only) = split.children.pop() {
                set_node_size(&mut only, size);
                *node = only;
            }
        }
        return Some(removed);
    }
    for child in split.children.iter_mut() {
        if let Some(p) = remove_pane_node(child, pane_id) {
            return Some(p);
        }
    }
    None
}

fn set_node_size(node: &mut Node, size: u16) {
    match node {
        Node::Pane(p) => p.size = size,
        Node::Split(s) => s.size = size,
    }
}

/// All pane ids in depth-first (left-to-right) order.
pub fn pane_ids(node: &Node) -> Vec<NodeId> {
    fn rec(node: &Node, out: &mut Vec<NodeId>) {
        match node {
            Node::Pane(p) => out.push(p.id),
            Node::Split(s) => for c in &s.children { rec(c, out); },
        }
    }
    let mut ids = Vec::new();
    rec(node, &mut ids);
    ids
}

/// The first pane in depth-first order.
pub fn first_pane_id(node: &Node) -> Option<NodeId> {
    match node {
        Node::Pane(p) => Some(p.id),
        Node::Split(s) => s.children.first().and_then(first_pane_id),
    }
}

pub fn count_panes(node: &Node) -> usize {
    match node {
        Node::Pane(_) => 1,
        Node::Split(s) => s.children.iter().map(count_panes).sum(),
    }
}

pub fn count_tabs(node: &Node) -> usize {
    match node {
        Node::Pane(p) => p.tabs.len(),
        Node::Split(s) => s.children.iter().map(count_tabs).sum(),
    }
}
