//! Cached Children and the Active View
//!
//! `ChildEntry` is the worker's record of one child node. `ActiveView`
//! is derived from the cached entries: one entry per container (the
//! highest sequence wins), ordered by ascending sequence. Index 0 is the
//! master.

use std::cmp::Ordering;
use std::collections::HashMap;

use super::codec;
use super::NodeState;
use crate::store::{sequence_of, Stat};

/// Last known state of one child node
#[derive(Debug, Clone)]
pub struct ChildEntry<T> {
    path: String,
    stat: Stat,
    data: Vec<u8>,
    node: Option<T>,
    handshake: Option<String>,
}

impl<T: NodeState> ChildEntry<T> {
    /// Build an entry from raw node data. Undecodable payloads keep their
    /// bytes but carry no state.
    pub fn decode(path: String, stat: Stat, data: Vec<u8>) -> Self {
        let (node, handshake) = match codec::decode::<T>(&data) {
            Ok(decoded) => (Some(decoded.state), decoded.handshake),
            Err(e) => {
                tracing::debug!("Ignoring undecodable payload at {}: {}", path, e);
                (None, None)
            }
        };
        Self {
            path,
            stat,
            data,
            node,
            handshake,
        }
    }
}

impl<T> ChildEntry<T> {
    /// Full path of the node
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }

    /// Raw payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decoded state, if the payload could be decoded
    pub fn node(&self) -> Option<&T> {
        self.node.as_ref()
    }

    /// Sequence number assigned by the store
    pub fn sequence(&self) -> Option<u64> {
        sequence_of(&self.path)
    }

    pub(crate) fn handshake(&self) -> Option<&str> {
        self.handshake.as_deref()
    }

    // nodes without a sequence suffix sort last
    fn order_key(&self) -> (u64, &str) {
        (self.sequence().unwrap_or(u64::MAX), &self.path)
    }
}

impl<T> PartialEq for ChildEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl<T> Eq for ChildEntry<T> {}

impl<T> PartialOrd for ChildEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ChildEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Deduplicated members in election order
#[derive(Debug, Clone)]
pub struct ActiveView<T> {
    members: Vec<ChildEntry<T>>,
}

impl<T> Default for ActiveView<T> {
    fn default() -> Self {
        Self {
            members: Vec::new(),
        }
    }
}

impl<T: NodeState> ActiveView<T> {
    /// Derive the active view from cached children
    pub fn from_children<'a, I>(children: I) -> Self
    where
        I: IntoIterator<Item = &'a ChildEntry<T>>,
    {
        let mut latest: HashMap<&str, &ChildEntry<T>> = HashMap::new();
        for entry in children {
            let Some(node) = entry.node() else {
                continue;
            };
            latest
                .entry(node.container())
                .and_modify(|current| {
                    if entry > *current {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }

        let mut members: Vec<ChildEntry<T>> = latest.into_values().cloned().collect();
        members.sort();
        Self { members }
    }

    /// The master's entry (lowest active sequence)
    pub fn master_entry(&self) -> Option<&ChildEntry<T>> {
        self.members.first()
    }

    pub fn master(&self) -> Option<&T> {
        self.master_entry().and_then(ChildEntry::node)
    }

    /// Everyone but the master, in election order
    pub fn slaves(&self) -> impl Iterator<Item = &T> {
        self.members.iter().skip(1).filter_map(ChildEntry::node)
    }

    /// First member, in election order, whose role is `id`
    pub fn first_for_id(&self, id: &str) -> Option<&ChildEntry<T>> {
        self.members
            .iter()
            .find(|entry| entry.node().map(|n| n.id() == id).unwrap_or(false))
    }

    pub fn get(&self, path: &str) -> Option<&T> {
        self.members
            .iter()
            .find(|entry| entry.path() == path)
            .and_then(ChildEntry::node)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.members.iter().any(|entry| entry.path() == path)
    }

    /// `(path, state)` pairs in election order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.members
            .iter()
            .filter_map(|entry| entry.node().map(|n| (entry.path(), n)))
    }

    pub fn paths(&self) -> Vec<&str> {
        self.members.iter().map(ChildEntry::path).collect()
    }

    pub fn entries(&self) -> &[ChildEntry<T>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ServiceState;

    fn entry(path: &str, id: &str, container: &str) -> ChildEntry<ServiceState> {
        let data = codec::encode(&ServiceState::new(id, container), None).unwrap();
        ChildEntry::decode(path.to_string(), Stat::default(), data)
    }

    #[test]
    fn test_ordering_by_sequence() {
        let children = vec![
            entry("/g/member-0000000012", "s", "c"),
            entry("/g/member-0000000003", "s", "a"),
            entry("/g/member-0000000007", "s", "b"),
        ];
        let view = ActiveView::from_children(&children);

        assert_eq!(
            view.paths(),
            vec!["/g/member-0000000003", "/g/member-0000000007", "/g/member-0000000012"]
        );
        assert_eq!(view.master().unwrap().container, "a");
        let slaves: Vec<&str> = view.slaves().map(|s| s.container.as_str()).collect();
        assert_eq!(slaves, vec!["b", "c"]);
    }

    #[test]
    fn test_duplicate_container_keeps_newest() {
        let children = vec![
            entry("/g/member-0000000001", "s", "a"),
            entry("/g/member-0000000002", "s", "b"),
            entry("/g/member-0000000005", "s", "a"),
        ];
        let view = ActiveView::from_children(&children);

        assert_eq!(view.len(), 2);
        assert!(!view.contains("/g/member-0000000001"));
        assert!(view.contains("/g/member-0000000005"));
        // the surviving "a" registration is newer than "b"
        assert_eq!(view.master().unwrap().container, "b");
    }

    #[test]
    fn test_numeric_not_lexicographic_order() {
        let children = vec![
            entry("/g/n-10", "s", "late"),
            entry("/g/n-9", "s", "early"),
        ];
        let view = ActiveView::from_children(&children);
        assert_eq!(view.master().unwrap().container, "early");
    }

    #[test]
    fn test_undecodable_entries_are_excluded() {
        let garbage = ChildEntry::<ServiceState>::decode(
            "/g/member-0000000000".to_string(),
            Stat::default(),
            b"\x00\x01".to_vec(),
        );
        assert!(garbage.node().is_none());
        assert_eq!(garbage.data(), b"\x00\x01");

        let children = vec![garbage, entry("/g/member-0000000001", "s", "a")];
        let view = ActiveView::from_children(&children);
        assert_eq!(view.paths(), vec!["/g/member-0000000001"]);
    }

    #[test]
    fn test_first_for_id_follows_election_order() {
        let children = vec![
            entry("/g/member-0000000004", "gateway", "c4"),
            entry("/g/member-0000000001", "broker", "c1"),
            entry("/g/member-0000000002", "gateway", "c2"),
            entry("/g/member-0000000003", "broker", "c3"),
        ];
        let view = ActiveView::from_children(&children);

        assert_eq!(view.first_for_id("broker").unwrap().path(), "/g/member-0000000001");
        assert_eq!(view.first_for_id("gateway").unwrap().path(), "/g/member-0000000002");
        assert!(view.first_for_id("scheduler").is_none());
    }

    #[test]
    fn test_handshake_is_kept_out_of_state() {
        let data = codec::encode(&ServiceState::new("s", "a"), Some("tag-1")).unwrap();
        let entry = ChildEntry::<ServiceState>::decode("/g/member-0000000000".into(), Stat::default(), data);
        assert_eq!(entry.handshake(), Some("tag-1"));
        assert_eq!(entry.node(), Some(&ServiceState::new("s", "a")));
    }

    #[test]
    fn test_entries_compare_by_path() {
        let a = entry("/g/member-0000000001", "s", "a");
        let b = entry("/g/member-0000000001", "s", "different");
        assert_eq!(a, b);
        assert!(entry("/g/member-0000000001", "s", "a") < entry("/g/member-0000000002", "s", "a"));
    }
}
