//! Branching conversation model.
//!
//! Messages reference their parent by id; the tree is an arena of nodes keyed
//! by [`MessageId`] with parent/child links stored as ids. The tree is rebuilt
//! wholesale from the flat message list whenever that list changes.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::chat_manager::types::{Message, MessageId};

#[derive(Debug, Clone, PartialEq)]
pub struct MessageNode {
    pub message: Message,
    pub parent: Option<MessageId>,
    /// Children in insertion order.
    pub children: Vec<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
}

#[derive(Debug, Clone, Default)]
pub struct MessageTree {
    nodes: HashMap<MessageId, MessageNode>,
    roots: Vec<MessageId>,
    latest: Option<MessageId>,
}

impl MessageTree {
    pub fn build(messages: &[Message]) -> Self {
        if messages.is_empty() {
            return Self::default();
        }

        let mut nodes: HashMap<MessageId, MessageNode> = HashMap::with_capacity(messages.len());
        let mut order: Vec<MessageId> = Vec::with_capacity(messages.len());
        for message in messages {
            if nodes.contains_key(&message.id) {
                tracing::warn!(target: "message_tree", id = %message.id, "duplicate message id ignored");
                continue;
            }
            order.push(message.id.clone());
            nodes.insert(
                message.id.clone(),
                MessageNode {
                    message: message.clone(),
                    parent: None,
                    children: Vec::new(),
                },
            );
        }

        let mut roots = Vec::new();
        for id in &order {
            let parent = nodes
                .get(id)
                .and_then(|n| n.message.parent_id.clone())
                .filter(|p| p != id && nodes.contains_key(p));

            match parent {
                Some(parent_id) => {
                    if let Some(parent_node) = nodes.get_mut(&parent_id) {
                        parent_node.children.push(id.clone());
                    }
                    if let Some(node) = nodes.get_mut(id) {
                        node.parent = Some(parent_id);
                    }
                }
                None => {
                    if let Some(parent_id) = nodes.get(id).and_then(|n| n.message.parent_id.as_ref()) {
                        tracing::debug!(target: "message_tree", id = %id, parent = %parent_id, "unknown parent, treating as root");
                    }
                    roots.push(id.clone());
                }
            }
        }

        let mut tree = Self {
            nodes,
            roots,
            latest: None,
        };
        tree.break_cycles(&order);
        tree.latest = tree.compute_latest();
        tree
    }

    /// Parent links that loop back on themselves leave nodes unreachable from
    /// any root. The smallest id of each such component is promoted to a root.
    fn break_cycles(&mut self, order: &[MessageId]) {
        loop {
            let reachable = self.reachable_ids();
            if reachable.len() == self.nodes.len() {
                return;
            }
            let Some(orphan) = order
                .iter()
                .filter(|id| !reachable.contains(*id))
                .min()
                .cloned()
            else {
                return;
            };

            tracing::warn!(target: "message_tree", id = %orphan, "parent cycle detected, promoting to root");
            if let Some(parent_id) = self.nodes.get(&orphan).and_then(|n| n.parent.clone()) {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.children.retain(|c| c != &orphan);
                }
            }
            if let Some(node) = self.nodes.get_mut(&orphan) {
                node.parent = None;
            }
            self.roots.push(orphan);
        }
    }

    fn reachable_ids(&self) -> HashSet<MessageId> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let mut queue: VecDeque<&MessageId> = self.roots.iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                queue.extend(node.children.iter());
            }
        }
        seen
    }

    fn compute_latest(&self) -> Option<MessageId> {
        self.roots.iter().map(|root| self.descend_latest(root)).max()
    }

    /// Follows the child with the greatest id at each level until a leaf.
    fn descend_latest(&self, from: &MessageId) -> MessageId {
        let mut current = from.clone();
        while let Some(next) = self
            .nodes
            .get(&current)
            .and_then(|n| n.children.iter().max())
        {
            current = next.clone();
        }
        current
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn roots(&self) -> &[MessageId] {
        &self.roots
    }

    pub fn latest(&self) -> Option<&MessageId> {
        self.latest.as_ref()
    }

    pub fn get(&self, id: &MessageId) -> Option<&MessageNode> {
        self.nodes.get(id)
    }

    /// Ids from the root down to `id`, inclusive. Empty when `id` is unknown.
    pub fn clone_path_to(&self, id: &MessageId) -> Vec<MessageId> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(id).map(|_| id.clone());
        while let Some(current) = cursor {
            cursor = self.nodes.get(&current).and_then(|n| n.parent.clone());
            path.push(current);
        }
        path.reverse();
        path
    }

    /// The branch shown for generation. Without a selection this ends at the
    /// tree's latest leaf; with one it runs through the selected node and then
    /// follows the locally latest child below it.
    pub fn active_branch(&self, selection: Option<&MessageId>) -> Vec<&Message> {
        let tail = match selection {
            Some(id) if self.nodes.contains_key(id) => self.descend_latest(id),
            Some(id) => {
                tracing::warn!(target: "message_tree", id = %id, "selected message not in tree, using latest branch");
                match &self.latest {
                    Some(latest) => latest.clone(),
                    None => return Vec::new(),
                }
            }
            None => match &self.latest {
                Some(latest) => latest.clone(),
                None => return Vec::new(),
            },
        };

        self.clone_path_to(&tail)
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| &n.message))
            .collect()
    }

    fn sibling_list(&self, id: &MessageId) -> Option<&[MessageId]> {
        let node = self.nodes.get(id)?;
        match &node.parent {
            Some(parent) => self.nodes.get(parent).map(|p| p.children.as_slice()),
            None => Some(self.roots.as_slice()),
        }
    }

    /// Position of `id` among its siblings and the sibling count.
    pub fn siblings(&self, id: &MessageId) -> Option<(usize, usize)> {
        let siblings = self.sibling_list(id)?;
        let index = siblings.iter().position(|s| s == id)?;
        Some((index, siblings.len()))
    }

    /// Moves to the previous or next sibling of `id`. Returns `id` unchanged
    /// when there is no sibling in that direction.
    pub fn navigate(&self, id: &MessageId, direction: Direction) -> MessageId {
        let Some(siblings) = self.sibling_list(id) else {
            return id.clone();
        };
        let Some(index) = siblings.iter().position(|s| s == id) else {
            return id.clone();
        };
        let target = match direction {
            Direction::Prev => index.checked_sub(1),
            Direction::Next => Some(index + 1).filter(|i| *i < siblings.len()),
        };
        match target {
            Some(i) => siblings[i].clone(),
            None => id.clone(),
        }
    }

    /// Sibling move that returns the whole new branch; below the sibling the
    /// branch follows the locally latest child at every level.
    pub fn navigate_branch(&self, id: &MessageId, direction: Direction) -> Vec<&Message> {
        let target = self.navigate(id, direction);
        self.active_branch(Some(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_manager::types::Role;

    fn msg(id: &str, parent: Option<&str>) -> Message {
        let m = Message::text(Role::User, id, format!("text {}", id));
        match parent {
            Some(p) => m.with_parent(p),
            None => m,
        }
    }

    fn ids(branch: &[&Message]) -> Vec<String> {
        branch.iter().map(|m| m.id.0.clone()).collect()
    }

    fn sample_tree() -> MessageTree {
        // 01 ─┬─ 02 ── 04
        //     └─ 03 ─┬─ 05
        //            └─ 06
        MessageTree::build(&[
            msg("01", None),
            msg("02", Some("01")),
            msg("03", Some("01")),
            msg("04", Some("02")),
            msg("05", Some("03")),
            msg("06", Some("03")),
        ])
    }

    #[test]
    fn empty_input_builds_empty_tree() {
        let tree = MessageTree::build(&[]);
        assert!(tree.is_empty());
        assert!(tree.latest().is_none());
        assert!(tree.active_branch(None).is_empty());
    }

    #[test]
    fn latest_follows_greatest_child() {
        let tree = sample_tree();
        assert_eq!(tree.latest(), Some(&MessageId::new("06")));
        assert_eq!(ids(&tree.active_branch(None)), vec!["01", "03", "06"]);
    }

    #[test]
    fn unknown_parent_becomes_root() {
        let tree = MessageTree::build(&[msg("01", None), msg("02", Some("zz"))]);
        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.latest(), Some(&MessageId::new("02")));
    }

    #[test]
    fn parent_cycles_are_broken() {
        let tree = MessageTree::build(&[msg("01", Some("02")), msg("02", Some("01")), msg("03", Some("03"))]);
        assert_eq!(tree.len(), 3);
        assert!(tree.roots().contains(&MessageId::new("01")));
        assert!(tree.roots().contains(&MessageId::new("03")));
        assert_eq!(tree.clone_path_to(&MessageId::new("02")).len(), 2);
    }

    #[test]
    fn navigation_descends_into_locally_latest_child() {
        let tree = sample_tree();
        let prev = tree.navigate(&MessageId::new("03"), Direction::Prev);
        assert_eq!(prev, MessageId::new("02"));
        let branch = tree.navigate_branch(&MessageId::new("03"), Direction::Prev);
        assert_eq!(ids(&branch), vec!["01", "02", "04"]);
    }

    #[test]
    fn navigation_round_trip_returns_to_start() {
        let tree = sample_tree();
        let start = MessageId::new("05");
        let next = tree.navigate(&start, Direction::Next);
        assert_eq!(next, MessageId::new("06"));
        assert_eq!(tree.navigate(&next, Direction::Prev), start);
    }

    #[test]
    fn navigation_without_sibling_is_a_no_op() {
        let tree = sample_tree();
        let id = MessageId::new("06");
        assert_eq!(tree.navigate(&id, Direction::Next), id);
        assert_eq!(tree.navigate(&MessageId::new("04"), Direction::Prev), MessageId::new("04"));
    }

    #[test]
    fn selection_overrides_latest() {
        let tree = sample_tree();
        let branch = tree.active_branch(Some(&MessageId::new("05")));
        assert_eq!(ids(&branch), vec!["01", "03", "05"]);
        let branch = tree.active_branch(Some(&MessageId::new("02")));
        assert_eq!(ids(&branch), vec!["01", "02", "04"]);
    }

    #[test]
    fn clone_path_lists_root_to_node() {
        let tree = sample_tree();
        let path = tree.clone_path_to(&MessageId::new("05"));
        assert_eq!(path, vec![MessageId::new("01"), MessageId::new("03"), MessageId::new("05")]);
        assert!(tree.clone_path_to(&MessageId::new("nope")).is_empty());
    }

    #[test]
    fn siblings_report_position() {
        let tree = sample_tree();
        assert_eq!(tree.siblings(&MessageId::new("06")), Some((1, 2)));
        assert_eq!(tree.siblings(&MessageId::new("01")), Some((0, 1)));
    }
}
