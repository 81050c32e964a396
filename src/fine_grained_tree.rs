//! External BST with one lock per node, traversed by lock coupling.
//!
//! Locks are only ever taken top-down, a child while holding its parent, so lockers cannot form a
//! cycle. Find and insert hold at most two locks at a time, remove at most three (grandparent,
//! parent, leaf).

use std::fmt;
use std::hash::Hash;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::concurrent_set::ConcurrentSet;
use crate::key::{HashKey, Key, KeyFn};

type Link<T> = Arc<Mutex<Node<T>>>;
type NodeGuard<T> = ArcMutexGuard<RawMutex, Node<T>>;

enum Node<T> {
    Internal {
        key: Key,
        left: Link<T>,
        right: Link<T>,
    },
    Leaf {
        key: Key,
        value: Option<T>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    L,
    R,
}

impl Direction {
    /// Which side of an internal node with routing key `routing` holds `key`.
    #[inline]
    fn of(key: u64, routing: &Key) -> Self {
        if *routing > key {
            Direction::L
        } else {
            Direction::R
        }
    }

    #[inline]
    fn oppo(self) -> Self {
        match self {
            Direction::L => Direction::R,
            Direction::R => Direction::L,
        }
    }
}

impl<T> Node<T> {
    fn leaf(key: Key, value: Option<T>) -> Link<T> {
        Arc::new(Mutex::new(Node::Leaf { key, value }))
    }

    fn internal(key: Key, left: Link<T>, right: Link<T>) -> Link<T> {
        Arc::new(Mutex::new(Node::Internal { key, left, right }))
    }

    #[inline]
    fn key(&self) -> Key {
        match self {
            Node::Internal { key, .. } | Node::Leaf { key, .. } => *key,
        }
    }

    #[inline]
    fn child(&self, dir: Direction) -> &Link<T> {
        match (self, dir) {
            (Node::Internal { left, .. }, Direction::L) => left,
            (Node::Internal { right, .. }, Direction::R) => right,
            (Node::Leaf { .. }, _) => unreachable!("leaves have no children"),
        }
    }

    #[inline]
    fn child_mut(&mut self, dir: Direction) -> &mut Link<T> {
        match (self, dir) {
            (Node::Internal { left, .. }, Direction::L) => left,
            (Node::Internal { right, .. }, Direction::R) => right,
            (Node::Leaf { .. }, _) => unreachable!("leaves have no children"),
        }
    }
}

/// A locked leaf together with its locked parent.
struct Cursor<T> {
    parent: NodeGuard<T>,
    /// Side of `parent` that holds `leaf`.
    dir: Direction,
    leaf: NodeGuard<T>,
}

/// Concurrent ordered set protected by per-node locks.
pub struct FineGrainedBst<T, K = HashKey> {
    root: Link<T>,
    key_fn: K,
    len: AtomicUsize,
}

impl<T: Hash> FineGrainedBst<T> {
    pub fn new() -> Self {
        Self::with_key_fn(HashKey::new())
    }
}

impl<T: Hash> Default for FineGrainedBst<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> FineGrainedBst<T, K>
where
    K: KeyFn<T>,
{
    pub fn with_key_fn(key_fn: K) -> Self {
        Self {
            root: Node::internal(
                Key::Inf2,
                Node::leaf(Key::Inf1, None),
                Node::leaf(Key::Inf2, None),
            ),
            key_fn,
            len: AtomicUsize::new(0),
        }
    }

    /// Descends to the leaf where `key` is or would be, coupling locks on the way down.
    ///
    /// The search starts below the root's left child link, since the right subtree only ever
    /// holds the `Inf2` sentinel.
    fn search(&self, key: u64) -> Cursor<T> {
        let mut parent = self.root.lock_arc();
        let mut dir = Direction::L;
        let mut curr = parent.child(dir).lock_arc();
        loop {
            let next_dir = match &*curr {
                Node::Leaf { .. } => None,
                Node::Internal { key: routing, .. } => Some(Direction::of(key, routing)),
            };
            let Some(next_dir) = next_dir else {
                return Cursor {
                    parent,
                    dir,
                    leaf: curr,
                };
            };
            drop(parent);
            let next = curr.child(next_dir).lock_arc();
            parent = curr;
            curr = next;
            dir = next_dir;
        }
    }

    pub fn find(&self, item: &T) -> bool {
        let key = self.key_fn.key(item);
        let cursor = self.search(key);
        cursor.leaf.key() == key
    }

    pub fn insert(&self, item: T) -> bool {
        let key = self.key_fn.key(&item);
        let mut cursor = self.search(key);
        let leaf_key = cursor.leaf.key();
        if leaf_key == key {
            return false;
        }

        let new_leaf = Node::leaf(Key::Fin(key), Some(item));
        let old_leaf = ArcMutexGuard::mutex(&cursor.leaf).clone();
        // The routing key is the larger of the two, and the smaller leaf goes left.
        let new_internal = if leaf_key > key {
            Node::internal(leaf_key, new_leaf, old_leaf)
        } else {
            Node::internal(Key::Fin(key), old_leaf, new_leaf)
        };
        *cursor.parent.child_mut(cursor.dir) = new_internal;
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn remove(&self, item: &T) -> bool {
        let key = self.key_fn.key(item);

        let mut gp = self.root.lock_arc();
        let mut gp_dir = Direction::L;
        let mut p = gp.child(gp_dir).lock_arc();
        let mut p_dir = match &*p {
            // Only the `Inf1` sentinel is left.
            Node::Leaf { .. } => return false,
            Node::Internal { key: routing, .. } => Direction::of(key, routing),
        };
        let mut curr = p.child(p_dir).lock_arc();

        loop {
            let next_dir = match &*curr {
                Node::Leaf { .. } => break,
                Node::Internal { key: routing, .. } => Direction::of(key, routing),
            };
            drop(gp);
            let next = curr.child(next_dir).lock_arc();
            gp = p;
            gp_dir = p_dir;
            p = curr;
            p_dir = next_dir;
            curr = next;
        }

        if curr.key() != key {
            return false;
        }

        // Splice out the leaf and its parent at once, putting the sibling in the parent's place.
        let sibling = p.child(p_dir.oppo()).clone();
        *gp.child_mut(gp_dir) = sibling;
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Number of elements. Exact whenever no operation is in flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, K> FineGrainedBst<T, K>
where
    T: fmt::Debug,
    K: KeyFn<T>,
{
    /// Writes every node below the root's left link in pre-order, one per line.
    pub fn dump<W: io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        writeln!(w, "elements: {}", self.len())?;
        let mut stack = vec![(self.root.lock().child(Direction::L).clone(), 0usize)];
        while let Some((link, depth)) = stack.pop() {
            let node = link.lock();
            match &*node {
                Node::Internal { key, left, right } => {
                    writeln!(w, "{:indent$}internal {}", "", key, indent = depth * 2)?;
                    stack.push((right.clone(), depth + 1));
                    stack.push((left.clone(), depth + 1));
                }
                Node::Leaf { key, value } => match value {
                    Some(value) => {
                        writeln!(w, "{:indent$}leaf {} {:?}", "", key, value, indent = depth * 2)?
                    }
                    None => writeln!(w, "{:indent$}leaf {}", "", key, indent = depth * 2)?,
                },
            }
        }
        Ok(())
    }
}

impl<T, K> Drop for FineGrainedBst<T, K> {
    fn drop(&mut self) {
        // Unlinks iteratively: the tree is not balanced and may be as deep as it is large.
        let mut stack = Vec::new();
        let mut root = self.root.lock();
        if let Node::Internal { left, right, .. } =
            mem::replace(&mut *root, Node::Leaf { key: Key::Inf2, value: None })
        {
            stack.push(left);
            stack.push(right);
        }
        drop(root);
        while let Some(link) = stack.pop() {
            if let Ok(node) = Arc::try_unwrap(link) {
                if let Node::Internal { left, right, .. } = node.into_inner() {
                    stack.push(left);
                    stack.push(right);
                }
            }
        }
    }
}

impl<T, K> ConcurrentSet<T> for FineGrainedBst<T, K>
where
    K: KeyFn<T>,
{
    type Handle<'s> = () where Self: 's;

    fn handle(&self) -> Self::Handle<'_> {}

    #[inline]
    fn insert<'s>(&'s self, _: &mut Self::Handle<'s>, item: T) -> bool {
        self.insert(item)
    }

    #[inline]
    fn remove<'s>(&'s self, _: &mut Self::Handle<'s>, item: &T) -> bool {
        self.remove(item)
    }

    #[inline]
    fn find<'s>(&'s self, _: &mut Self::Handle<'s>, item: &T) -> bool {
        self.find(item)
    }

    fn len(&self) -> usize {
        self.len()
    }
}
