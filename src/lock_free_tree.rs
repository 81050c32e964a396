//! Non-blocking external BST (Ellen, Fatourou, Ruppert and van Breugel, PODC 2010) with hazard
//! pointer reclamation.
//!
//! Every internal node carries an [`AtomicStateRef`] to an `Info` record announcing the change in
//! flight below it:
//!
//! * insert: `Clean -> InsertFlag -> Clean` on the parent of the replaced leaf.
//! * remove: `Clean -> DeleteFlag -> Clean` on the grandparent, and `-> Marked` (final) on the
//!   parent that is spliced out together with the leaf.
//!
//! A thread that runs into a flagged node finishes that change before retrying its own.
//!
//! Hazard pointer validation relies on three facts of the protocol:
//!
//! * A node is never linked again once it is unlinked, and an info record is never installed again
//!   once replaced.
//! * The children of an internal node only change while its info field holds a new record, so an
//!   unchanged info field means unchanged children.
//! * The children of a node are retired only after the node is marked or after they are unlinked
//!   from it.

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::io;
use std::thread::available_parallelism;

use crate::asr::{AtomicStateRef, State, StateRef};
use crate::concurrent_set::ConcurrentSet;
use crate::hp::{Domain, HazardPointer, Thread};
use crate::key::{HashKey, Key, KeyFn};
use crate::registry::RegistryFull;

/// Hazard pointers a [`Handle`] holds.
pub const SLOTS_PER_THREAD: usize = 8;

/// Thread capacity of trees built without an explicit one.
pub fn default_threads() -> usize {
    let cpus = available_parallelism().map(|v| v.get()).unwrap_or(1);
    (cpus * 4).max(64)
}

enum Node<T> {
    Internal(Internal<T>),
    Leaf(Leaf<T>),
}

struct Internal<T> {
    key: Key,
    update: AtomicStateRef<Info<T>>,
    left: AtomicPtr<Node<T>>,
    right: AtomicPtr<Node<T>>,
}

struct Leaf<T> {
    key: Key,
    value: Option<T>,
}

/// A structural change announced on an internal node.
enum Info<T> {
    Insert {
        p: *mut Node<T>,
        /// Side of `p` that holds `l`.
        dir: Direction,
        l: *mut Node<T>,
        new_internal: *mut Node<T>,
    },
    Delete {
        gp: *mut Node<T>,
        gp_dir: Direction,
        p: *mut Node<T>,
        p_dir: Direction,
        l: *mut Node<T>,
        l_other: *mut Node<T>,
        pupdate: StateRef<Info<T>>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Direction {
    L,
    R,
}

impl Direction {
    #[inline]
    fn of(key: u64, routing: &Key) -> Self {
        if *routing > key {
            Direction::L
        } else {
            Direction::R
        }
    }

    #[inline]
    fn src<T>(self, node: &Internal<T>) -> &AtomicPtr<Node<T>> {
        match self {
            Direction::L => &node.left,
            Direction::R => &node.right,
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
    fn leaf(key: Key, value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Node::Leaf(Leaf { key, value })))
    }

    fn internal(key: Key, left: *mut Self, right: *mut Self) -> *mut Self {
        Box::into_raw(Box::new(Node::Internal(Internal {
            key,
            update: AtomicStateRef::null(),
            left: AtomicPtr::new(left),
            right: AtomicPtr::new(right),
        })))
    }

    #[inline]
    fn key(&self) -> Key {
        match self {
            Node::Internal(internal) => internal.key,
            Node::Leaf(leaf) => leaf.key,
        }
    }
}

/// # Safety
/// `node` points to a live internal node that stays allocated for `'a`.
#[inline]
unsafe fn internal<'a, T>(node: *mut Node<T>) -> &'a Internal<T> {
    match &*node {
        Node::Internal(internal) => internal,
        Node::Leaf(_) => unreachable!("expected an internal node"),
    }
}

/// # Safety
/// `info` references a live record that stays allocated for `'a`.
#[inline]
unsafe fn info<'a, T>(info: StateRef<Info<T>>) -> &'a Info<T> {
    &*info.ptr()
}

/// Publishes the record behind `snapshot`, then checks that `src` still holds exactly `snapshot`.
#[inline]
fn protect_update<T>(
    hp: &mut HazardPointer<'_>,
    snapshot: StateRef<Info<T>>,
    src: &AtomicStateRef<Info<T>>,
) -> Result<(), StateRef<Info<T>>> {
    hp.protect_raw(snapshot.ptr());
    fence(Ordering::SeqCst);
    let current = src.load(Ordering::SeqCst);
    if current == snapshot {
        Ok(())
    } else {
        Err(current)
    }
}

/// Per-thread context of a [`LockFreeBst`]: a registered thread and its hazard pointers.
pub struct Handle<'domain> {
    gp_h: HazardPointer<'domain>,
    p_h: HazardPointer<'domain>,
    l_h: HazardPointer<'domain>,
    l_other_h: HazardPointer<'domain>,
    pupdate_h: HazardPointer<'domain>,
    gpupdate_h: HazardPointer<'domain>,
    aux_update_h: HazardPointer<'domain>,
    aux_node_h: HazardPointer<'domain>,
    // Dropped last: the slots above belong to this thread's row.
    thread: Thread<'domain>,
}

impl<'domain> Handle<'domain> {
    fn new(thread: Thread<'domain>) -> Self {
        Self {
            gp_h: thread.hazard_pointer(),
            p_h: thread.hazard_pointer(),
            l_h: thread.hazard_pointer(),
            l_other_h: thread.hazard_pointer(),
            pupdate_h: thread.hazard_pointer(),
            gpupdate_h: thread.hazard_pointer(),
            aux_update_h: thread.hazard_pointer(),
            aux_node_h: thread.hazard_pointer(),
            thread,
        }
    }

    /// The dense id of the registered thread.
    pub fn id(&self) -> usize {
        self.thread.id()
    }
}

impl fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("id", &self.id()).finish()
    }
}

/// Result of a search. Every pointer is protected by the matching hazard pointer of the handle.
struct Cursor<T> {
    gp: *mut Node<T>,
    /// Side of `gp` that holds `p`.
    gp_dir: Direction,
    p: *mut Node<T>,
    /// Side of `p` that holds `l`.
    p_dir: Direction,
    l: *mut Node<T>,
    l_other: *mut Node<T>,
    pupdate: StateRef<Info<T>>,
    gpupdate: StateRef<Info<T>>,
}

impl<T> Cursor<T> {
    /// The grandparent and the side of it holding `p`, unless `p` is the root.
    fn above_p(&self) -> Option<(*mut Node<T>, Direction)> {
        if self.gp.is_null() {
            None
        } else {
            Some((self.gp, self.gp_dir))
        }
    }

    fn new(root: *mut Node<T>) -> Self {
        Self {
            gp: ptr::null_mut(),
            gp_dir: Direction::L,
            p: ptr::null_mut(),
            p_dir: Direction::L,
            l: root,
            l_other: ptr::null_mut(),
            pupdate: StateRef::null(),
            gpupdate: StateRef::null(),
        }
    }
}

/// Concurrent ordered set built from compare-and-swap only.
///
/// Threads operate through a [`Handle`]. At most `threads` handles, the capacity given at
/// construction, can be alive at once.
pub struct LockFreeBst<T, K = HashKey> {
    root: *mut Node<T>,
    key_fn: K,
    len: AtomicUsize,
    domain: Domain,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync, K: Send + Sync> Send for LockFreeBst<T, K> {}
unsafe impl<T: Send + Sync, K: Send + Sync> Sync for LockFreeBst<T, K> {}

impl<T: Hash + Clone> LockFreeBst<T> {
    pub fn new() -> Self {
        Self::with_key_fn(HashKey::new())
    }

    pub fn with_threads(threads: usize) -> Self {
        Self::with_key_fn_and_threads(HashKey::new(), threads)
    }
}

impl<T: Hash + Clone> Default for LockFreeBst<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> LockFreeBst<T, K>
where
    T: Clone,
    K: KeyFn<T>,
{
    pub fn with_key_fn(key_fn: K) -> Self {
        Self::with_key_fn_and_threads(key_fn, default_threads())
    }

    pub fn with_key_fn_and_threads(key_fn: K, threads: usize) -> Self {
        Self {
            root: Node::internal(
                Key::Inf2,
                Node::leaf(Key::Inf1, None),
                Node::leaf(Key::Inf2, None),
            ),
            key_fn,
            len: AtomicUsize::new(0),
            domain: Domain::new(threads, SLOTS_PER_THREAD),
            _marker: PhantomData,
        }
    }

    /// Registers the calling thread.
    ///
    /// # Panics
    /// Panics if `threads` handles are already alive.
    pub fn handle(&self) -> Handle<'_> {
        match self.try_handle() {
            Ok(handle) => handle,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_handle(&self) -> Result<Handle<'_>, RegistryFull> {
        Ok(Handle::new(self.domain.register()?))
    }

    /// The hazard pointer domain of this tree.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Walks from the root to the leaf where `key` is or would be.
    ///
    /// On return `l` is a leaf and `p` the internal node it was read from. Unless `l` is the
    /// `Inf1` sentinel directly below the root, `gp` is the parent of `p`. Both info snapshots
    /// were observed unmarked together with the child read below them.
    fn search(&self, key: u64, cursor: &mut Cursor<T>, handle: &mut Handle<'_>) {
        assert!(
            ptr::eq(handle.thread.domain, &self.domain),
            "handle registered with another tree"
        );
        'search: loop {
            *cursor = Cursor::new(self.root);
            handle.l_h.protect_raw(self.root);

            loop {
                let l_node = unsafe { &*cursor.l };
                let p_node = match l_node {
                    Node::Leaf(_) => return,
                    Node::Internal(internal) => internal,
                };

                cursor.gp = cursor.p;
                cursor.gp_dir = cursor.p_dir;
                cursor.p = cursor.l;
                cursor.gpupdate = cursor.pupdate;
                HazardPointer::swap(&mut handle.gp_h, &mut handle.p_h);
                HazardPointer::swap(&mut handle.p_h, &mut handle.l_h);
                HazardPointer::swap(&mut handle.gpupdate_h, &mut handle.pupdate_h);

                let dir = Direction::of(key, &p_node.key);
                loop {
                    let pupdate = p_node.update.load(Ordering::SeqCst);
                    let l = dir.src(p_node).load(Ordering::SeqCst);
                    let l_other = dir.oppo().src(p_node).load(Ordering::SeqCst);
                    handle.pupdate_h.protect_raw(pupdate.ptr());
                    handle.l_h.protect_raw(l);
                    handle.l_other_h.protect_raw(l_other);
                    fence(Ordering::SeqCst);

                    if p_node.update.load(Ordering::SeqCst) != pupdate {
                        continue;
                    }
                    if pupdate.state() == State::Marked {
                        // The children of `p` may already be retired. Finish the splice if `p`
                        // still hangs below the grandparent we came from, then start over.
                        if !cursor.gp.is_null() {
                            self.help_marked_if_linked(
                                pupdate,
                                cursor.gp,
                                cursor.gp_dir,
                                cursor.p,
                                &handle.thread,
                            );
                        }
                        continue 'search;
                    }
                    if dir.src(p_node).load(Ordering::SeqCst) != l
                        || dir.oppo().src(p_node).load(Ordering::SeqCst) != l_other
                    {
                        continue;
                    }

                    cursor.p_dir = dir;
                    cursor.l = l;
                    cursor.l_other = l_other;
                    cursor.pupdate = pupdate;
                    break;
                }
            }
        }
    }

    pub fn find_with(&self, item: &T, handle: &mut Handle<'_>) -> bool {
        let key = self.key_fn.key(item);
        let mut cursor = Cursor::new(self.root);
        self.search(key, &mut cursor, handle);
        let l_node = unsafe { &*cursor.l };
        // A leaf below a marked parent is on its way out.
        l_node.key() == key && cursor.pupdate.state() != State::Marked
    }

    pub fn insert_with(&self, item: T, handle: &mut Handle<'_>) -> bool {
        let key = self.key_fn.key(&item);
        let mut item = Some(item);
        let mut cursor = Cursor::new(self.root);
        loop {
            self.search(key, &mut cursor, handle);
            let p_node = unsafe { internal(cursor.p) };
            let l_leaf = match unsafe { &*cursor.l } {
                Node::Leaf(leaf) => leaf,
                Node::Internal(_) => unreachable!("search ends at a leaf"),
            };

            if l_leaf.key == key {
                return false;
            }
            if !cursor.pupdate.is_clean() {
                self.help(cursor.pupdate, cursor.p, cursor.above_p(), handle);
                continue;
            }

            let Some(value) = item.take() else {
                unreachable!("the item is put back after every failed attempt")
            };
            let new = Node::leaf(Key::Fin(key), Some(value));
            // A copy of the displaced leaf, so that the leaf itself is never linked again.
            let new_sibling = Node::leaf(l_leaf.key, l_leaf.value.clone());
            // The routing key is the larger of the two, and the smaller leaf goes left.
            let new_internal = if l_leaf.key > key {
                Node::internal(l_leaf.key, new, new_sibling)
            } else {
                Node::internal(Key::Fin(key), new_sibling, new)
            };
            let op = Box::into_raw(Box::new(Info::Insert {
                p: cursor.p,
                dir: cursor.p_dir,
                l: cursor.l,
                new_internal,
            }));
            let new_pupdate = StateRef::new(op, State::InsertFlag);
            handle.aux_update_h.protect_raw(op);

            match p_node
                .update
                .compare_exchange(cursor.pupdate, new_pupdate)
            {
                Ok(_) => {
                    if !cursor.pupdate.ptr().is_null() {
                        unsafe { handle.thread.retire(cursor.pupdate.ptr()) };
                    }
                    self.len.fetch_add(1, Ordering::Relaxed);
                    self.help_insert(new_pupdate, &mut handle.l_h, &handle.thread);
                    return true;
                }
                Err(current) => {
                    // Nothing else has seen the new nodes yet.
                    unsafe {
                        drop(Box::from_raw(op));
                        drop(Box::from_raw(new_internal));
                        drop(Box::from_raw(new_sibling));
                    }
                    item = Some(value_of_failed_insert(new));
                    self.help(current, cursor.p, cursor.above_p(), handle);
                }
            }
        }
    }

    pub fn remove_with(&self, item: &T, handle: &mut Handle<'_>) -> bool {
        let key = self.key_fn.key(item);
        let mut cursor = Cursor::new(self.root);
        loop {
            self.search(key, &mut cursor, handle);
            if unsafe { &*cursor.l }.key() != key {
                return false;
            }
            // User leaves always hang below the root's left child.
            debug_assert!(!cursor.gp.is_null());
            let gp_node = unsafe { internal(cursor.gp) };
            let p_node = unsafe { internal(cursor.p) };

            if !cursor.gpupdate.is_clean() {
                self.help(cursor.gpupdate, cursor.gp, None, handle);
                continue;
            }
            if !cursor.pupdate.is_clean() {
                self.help(cursor.pupdate, cursor.p, cursor.above_p(), handle);
                continue;
            }

            let op = Box::into_raw(Box::new(Info::Delete {
                gp: cursor.gp,
                gp_dir: cursor.gp_dir,
                p: cursor.p,
                p_dir: cursor.p_dir,
                l: cursor.l,
                l_other: cursor.l_other,
                pupdate: cursor.pupdate,
            }));
            let new_update = StateRef::new(op, State::DeleteFlag);
            handle.aux_update_h.protect_raw(op);

            match gp_node
                .update
                .compare_exchange(cursor.gpupdate, new_update)
            {
                Ok(_) => {
                    if !cursor.gpupdate.ptr().is_null() {
                        unsafe { handle.thread.retire(cursor.gpupdate.ptr()) };
                    }
                    // `p` has been protected since the search, so its final state tells whether
                    // this operation won, even when a helper did the work.
                    if self.help_delete(
                        new_update,
                        &mut handle.p_h,
                        &mut handle.pupdate_h,
                        Some([&mut handle.l_h, &mut handle.l_other_h, &mut handle.aux_node_h]),
                        &handle.thread,
                    ) || p_node.update.load(Ordering::SeqCst) == new_update.with_state(State::Marked)
                    {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        return true;
                    }
                }
                Err(current) => {
                    unsafe { drop(Box::from_raw(op)) };
                    self.help(current, cursor.gp, None, handle);
                }
            }
        }
    }

    /// Finishes the change `op` announced on the internal node `owner`, if `owner` still holds
    /// it. A marked `owner` is only helped when `above` names its parent.
    ///
    /// `owner` and the node in `above` must be protected by the caller, in `gp_h` or `p_h`.
    fn help(
        &self,
        op: StateRef<Info<T>>,
        owner: *mut Node<T>,
        above: Option<(*mut Node<T>, Direction)>,
        handle: &mut Handle<'_>,
    ) {
        let src = unsafe { &internal(owner).update };
        if protect_update(&mut handle.aux_update_h, op, src).is_err() {
            return;
        }
        match op.state() {
            State::InsertFlag => self.help_insert(op, &mut handle.aux_node_h, &handle.thread),
            State::DeleteFlag => {
                let _ = self.help_delete(
                    op,
                    &mut handle.aux_node_h,
                    &mut handle.l_other_h,
                    Some([
                        &mut handle.l_h,
                        &mut handle.gpupdate_h,
                        &mut handle.pupdate_h,
                    ]),
                    &handle.thread,
                );
            }
            State::Marked => {
                if let Some((gp, gp_dir)) = above {
                    self.help_marked_if_linked(op, gp, gp_dir, owner, &handle.thread);
                }
            }
            State::Clean => {}
        }
    }

    /// Links the new internal node of the insert `op` in place of its leaf, then clears the flag.
    ///
    /// `op` and its parent must be protected. `l_h` is used to protect the replaced leaf.
    fn help_insert(
        &self,
        op: StateRef<Info<T>>,
        l_h: &mut HazardPointer<'_>,
        thread: &Thread<'_>,
    ) {
        let Info::Insert {
            p,
            dir,
            l,
            new_internal,
        } = *(unsafe { info(op) })
        else {
            unreachable!("expected an insert record")
        };
        let p_node = unsafe { internal(p) };
        let flagged = op.with_state(State::InsertFlag);

        // Once replaced, `l` may be freed and its address reused. Only act on it while it is
        // provably still the leaf `op` is about.
        l_h.protect_raw(l);
        fence(Ordering::SeqCst);
        if dir.src(p_node).load(Ordering::SeqCst) == l
            && p_node.update.load(Ordering::SeqCst) == flagged
            && Self::cas_child(p_node, dir, l, new_internal).is_ok()
        {
            unsafe { thread.retire(l) };
        }
        let _ = p_node
            .update
            .compare_exchange(flagged, op.with_state(State::Clean));
    }

    /// Marks the parent of the delete `op`, then splices it out. Returns whether the parent ended
    /// up marked by `op`. Otherwise the operation that took the parent first is helped with the
    /// `spare` hazard pointers, if given, and the grandparent is unflagged.
    ///
    /// `op` and its grandparent must be protected. `p_h` and `pupdate_h` are used to protect the
    /// parent and its recorded info.
    fn help_delete(
        &self,
        op: StateRef<Info<T>>,
        p_h: &mut HazardPointer<'_>,
        pupdate_h: &mut HazardPointer<'_>,
        spare: Option<[&mut HazardPointer<'_>; 3]>,
        thread: &Thread<'_>,
    ) -> bool {
        let Info::Delete {
            gp,
            gp_dir,
            p,
            p_dir,
            l,
            l_other,
            pupdate,
        } = *(unsafe { info(op) })
        else {
            unreachable!("expected a delete record")
        };
        let gp_node = unsafe { internal(gp) };
        let flagged = op.with_state(State::DeleteFlag);
        let marked = op.with_state(State::Marked);

        // While `gp` is flagged only this operation moves `p`, and the remover keeps `pupdate`
        // protected.
        p_h.protect_raw(p);
        pupdate_h.protect_raw(pupdate.ptr());
        fence(Ordering::SeqCst);
        if gp_dir.src(gp_node).load(Ordering::SeqCst) != p
            || gp_node.update.load(Ordering::SeqCst) != flagged
        {
            return false;
        }

        let p_node = unsafe { internal(p) };
        let mut current = p_node.update.load(Ordering::SeqCst);
        if current == marked {
            self.help_marked(op, thread);
            return true;
        }
        let intact = current == pupdate
            && p_dir.src(p_node).load(Ordering::SeqCst) == l
            && p_dir.oppo().src(p_node).load(Ordering::SeqCst) == l_other
            && gp_node.update.load(Ordering::SeqCst) == flagged;
        if intact {
            match p_node.update.compare_exchange(pupdate, marked) {
                Ok(_) => {
                    if !pupdate.ptr().is_null() {
                        unsafe { thread.retire(pupdate.ptr()) };
                    }
                    self.help_marked(op, thread);
                    return true;
                }
                Err(now) if now == marked => {
                    self.help_marked(op, thread);
                    return true;
                }
                Err(now) => current = now,
            }
        }

        // `p` changed under the remover, which retries from scratch. Clear the way first.
        if let Some([info_h, node_h, update_h]) = spare {
            if protect_update(info_h, current, &p_node.update).is_ok() {
                match current.state() {
                    State::InsertFlag => self.help_insert(current, node_h, thread),
                    State::DeleteFlag => {
                        let _ = self.help_delete(current, node_h, update_h, None, thread);
                    }
                    State::Marked => {
                        self.help_marked_if_linked(current, gp, gp_dir, p, thread);
                    }
                    State::Clean => {}
                }
            }
        }
        let _ = gp_node
            .update
            .compare_exchange(flagged, op.with_state(State::Clean));
        false
    }

    /// Helps the delete that marked `p` with `op`, if `p` still hangs below `gp`.
    ///
    /// A marked node stays below its grandparent only while the grandparent is flagged with the
    /// same record, so the link check proves `op` is not retired. `op` must be published before
    /// the call, and `gp` and `p` protected. Returns whether `op` was dereferenced.
    fn help_marked_if_linked(
        &self,
        op: StateRef<Info<T>>,
        gp: *mut Node<T>,
        gp_dir: Direction,
        p: *mut Node<T>,
        thread: &Thread<'_>,
    ) -> bool {
        debug_assert_eq!(op.state(), State::Marked);
        fence(Ordering::SeqCst);
        let gp_node = unsafe { internal(gp) };
        if gp_dir.src(gp_node).load(Ordering::SeqCst) != p {
            return false;
        }
        if let Info::Delete { gp: op_gp, .. } = *(unsafe { info(op) }) {
            if op_gp == gp {
                self.help_marked(op, thread);
            }
        }
        true
    }

    /// Replaces the marked parent of `op` by the sibling of its leaf, then unflags the
    /// grandparent.
    ///
    /// `op`, its grandparent and its parent must be protected.
    fn help_marked(&self, op: StateRef<Info<T>>, thread: &Thread<'_>) {
        let Info::Delete {
            gp,
            gp_dir,
            p,
            l,
            l_other,
            ..
        } = *(unsafe { info(op) })
        else {
            unreachable!("expected a delete record")
        };
        let gp_node = unsafe { internal(gp) };

        if Self::cas_child(gp_node, gp_dir, p, l_other).is_ok() {
            unsafe {
                thread.retire(p);
                thread.retire(l);
            }
        }
        let _ = gp_node.update.compare_exchange(
            op.with_state(State::DeleteFlag),
            op.with_state(State::Clean),
        );
    }

    #[inline]
    fn cas_child(
        parent: &Internal<T>,
        dir: Direction,
        old: *mut Node<T>,
        new: *mut Node<T>,
    ) -> Result<*mut Node<T>, *mut Node<T>> {
        dir.src(parent)
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Inserts `item` with a temporary handle.
    ///
    /// Registering and dropping the handle costs a registry lock and a scan of the whole slot
    /// table on every call. Threads doing more than a few operations should keep a [`Handle`]
    /// and use [`LockFreeBst::insert_with`].
    ///
    /// # Panics
    /// Panics if `threads` handles are already alive. See [`LockFreeBst::try_insert`].
    pub fn insert(&self, item: T) -> bool {
        self.insert_with(item, &mut self.handle())
    }

    /// Removes `item` with a temporary handle. Costs as much as [`LockFreeBst::insert`].
    ///
    /// # Panics
    /// Panics if `threads` handles are already alive.
    pub fn remove(&self, item: &T) -> bool {
        self.remove_with(item, &mut self.handle())
    }

    /// Looks `item` up with a temporary handle. Costs as much as [`LockFreeBst::insert`].
    ///
    /// # Panics
    /// Panics if `threads` handles are already alive.
    pub fn find(&self, item: &T) -> bool {
        self.find_with(item, &mut self.handle())
    }

    pub fn try_insert(&self, item: T) -> Result<bool, RegistryFull> {
        Ok(self.insert_with(item, &mut self.try_handle()?))
    }

    pub fn try_remove(&self, item: &T) -> Result<bool, RegistryFull> {
        Ok(self.remove_with(item, &mut self.try_handle()?))
    }

    pub fn try_find(&self, item: &T) -> Result<bool, RegistryFull> {
        Ok(self.find_with(item, &mut self.try_handle()?))
    }

    /// Number of elements. Exact whenever no operation is in flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Takes the item back out of a leaf that was never published.
fn value_of_failed_insert<T>(leaf: *mut Node<T>) -> T {
    match *unsafe { Box::from_raw(leaf) } {
        Node::Leaf(Leaf {
            value: Some(value), ..
        }) => value,
        _ => unreachable!("the new leaf carries the inserted item"),
    }
}

impl<T, K> LockFreeBst<T, K>
where
    T: fmt::Debug,
{
    /// Writes every node below the root's left link in pre-order, one per line.
    pub fn dump<W: io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        writeln!(w, "elements: {}", self.len.load(Ordering::Relaxed))?;
        let root = unsafe { internal(self.root) };
        let mut stack = vec![(root.left.load(Ordering::Relaxed), 0usize)];
        while let Some((node, depth)) = stack.pop() {
            match unsafe { &*node } {
                Node::Internal(internal) => {
                    writeln!(w, "{:indent$}internal {}", "", internal.key, indent = depth * 2)?;
                    stack.push((internal.right.load(Ordering::Relaxed), depth + 1));
                    stack.push((internal.left.load(Ordering::Relaxed), depth + 1));
                }
                Node::Leaf(Leaf {
                    key,
                    value: Some(value),
                }) => writeln!(w, "{:indent$}leaf {} {:?}", "", key, value, indent = depth * 2)?,
                Node::Leaf(Leaf { key, value: None }) => {
                    writeln!(w, "{:indent$}leaf {}", "", key, indent = depth * 2)?
                }
            }
        }
        Ok(())
    }
}

impl<T, K> Drop for LockFreeBst<T, K> {
    fn drop(&mut self) {
        // No handle is alive, so nothing is in flight. Retired objects belong to the domain.
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            let node = unsafe { Box::from_raw(node) };
            if let Node::Internal(internal) = *node {
                let update = internal.update.load(Ordering::Relaxed);
                // A marked record is also referenced by the grandparent, which owns it.
                if !update.ptr().is_null() && update.state() != State::Marked {
                    drop(unsafe { Box::from_raw(update.ptr()) });
                }
                stack.push(internal.left.into_inner());
                stack.push(internal.right.into_inner());
            }
        }
    }
}

impl<T, K> ConcurrentSet<T> for LockFreeBst<T, K>
where
    T: Clone,
    K: KeyFn<T>,
{
    type Handle<'s> = Handle<'s> where Self: 's;

    fn handle(&self) -> Self::Handle<'_> {
        self.handle()
    }

    #[inline]
    fn insert<'s>(&'s self, handle: &mut Self::Handle<'s>, item: T) -> bool {
        self.insert_with(item, handle)
    }

    #[inline]
    fn remove<'s>(&'s self, handle: &mut Self::Handle<'s>, item: &T) -> bool {
        self.remove_with(item, handle)
    }

    #[inline]
    fn find<'s>(&'s self, handle: &mut Self::Handle<'s>, item: &T) -> bool {
        self.find_with(item, handle)
    }

    fn len(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr;
    use core::sync::atomic::Ordering;

    use super::{internal, Cursor, Info, LockFreeBst, SLOTS_PER_THREAD};
    use crate::asr::{State, StateRef};
    use crate::concurrent_set;
    use crate::hp::RETIRE_FACTOR;
    use crate::key::IdentityKey;
    use crossbeam_utils::thread;

    const CANARY: u64 = 0x0123_4567_89AB_CDEF;
    const POISON: u64 = 0xDEAD_BEEF_DEAD_BEEF;

    /// A value that poisons itself when dropped and refuses to be cloned afterwards. Inserts
    /// clone the leaf they displace, so cloning a freed leaf fails loudly.
    struct Tagged {
        key: u64,
        word: u64,
    }

    impl Tagged {
        fn new(key: u64) -> Self {
            Self { key, word: CANARY }
        }
    }

    impl Clone for Tagged {
        fn clone(&self) -> Self {
            assert_eq!(self.word, CANARY, "cloned a freed leaf of key {}", self.key);
            Self::new(self.key)
        }
    }

    impl Drop for Tagged {
        fn drop(&mut self) {
            unsafe { ptr::write_volatile(&mut self.word, POISON) };
        }
    }

    #[test]
    fn smoke_lock_free_bst() {
        concurrent_set::tests::smoke(&LockFreeBst::with_key_fn(IdentityKey));
    }

    #[test]
    fn contended_lock_free_bst() {
        concurrent_set::tests::contended(&LockFreeBst::with_key_fn(IdentityKey));
    }

    #[test]
    fn insert_find_remove() {
        let tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 1);
        let handle = &mut tree.handle();
        for k in [1u64, 5, 3] {
            assert!(tree.insert_with(k, handle));
        }
        assert!(tree.find_with(&5, handle));
        assert!(!tree.find_with(&9, handle));
        assert!(tree.remove_with(&5, handle));
        assert!(!tree.find_with(&5, handle));
        assert!(tree.find_with(&3, handle));
        assert!(!tree.insert_with(3, handle));
        assert!(!tree.remove_with(&5, handle));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn extreme_keys_are_ordinary() {
        let tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 1);
        let handle = &mut tree.handle();
        assert!(tree.insert_with(u64::MAX, handle));
        assert!(tree.insert_with(0u64, handle));
        assert!(tree.find_with(&u64::MAX, handle));
        assert!(tree.remove_with(&u64::MAX, handle));
        assert!(tree.remove_with(&0, handle));
        assert!(tree.is_empty());
        // Back to the two sentinels.
        assert!(tree.insert_with(7u64, handle));
    }

    #[test]
    fn handles_are_bounded_and_reused() {
        let tree = LockFreeBst::<u64, _>::with_key_fn_and_threads(IdentityKey, 2);
        let a = tree.handle();
        let b = tree.handle();
        let err = tree.try_handle().unwrap_err();
        assert_eq!(err.capacity, 2);
        assert_eq!((a.id(), b.id()), (0, 1));
        drop(a);
        assert_eq!(tree.try_handle().unwrap().id(), 0);
        drop(b);
    }

    #[test]
    fn garbage_is_bounded_and_reclaimed() {
        const THREADS: usize = 4;
        let tree = &LockFreeBst::with_key_fn_and_threads(IdentityKey, THREADS);
        thread::scope(|s| {
            for t in 0..THREADS as u64 {
                s.spawn(move |_| {
                    let handle = &mut tree.handle();
                    for round in 0..200u64 {
                        for k in 0..50u64 {
                            let key = (round * 50 + k) * THREADS as u64 + t;
                            assert!(tree.insert_with(key, handle));
                        }
                        for k in 0..50u64 {
                            let key = (round * 50 + k) * THREADS as u64 + t;
                            assert!(tree.remove_with(&key, handle));
                        }
                    }
                    // Each thread holds back at most its own threshold.
                    let bound = RETIRE_FACTOR * THREADS * SLOTS_PER_THREAD;
                    assert!(handle.thread.retired_len() <= bound);
                });
            }
        })
        .unwrap();
        assert!(tree.is_empty());

        // Once every handle is gone, each thread left behind at most what was protected during
        // its last scan.
        let garbage = tree.domain().garbage();
        assert!(
            garbage <= THREADS * THREADS * SLOTS_PER_THREAD,
            "{} unreclaimed",
            garbage
        );
        let handle = tree.handle();
        handle.thread.scan();
        drop(handle);
        assert_eq!(tree.domain().garbage(), 0);
    }

    #[test]
    fn default_tree_hashes_values() {
        let tree = LockFreeBst::<String>::default();
        assert!(tree.insert("ten".to_string()));
        assert!(tree.find(&"ten".to_string()));
        assert!(!tree.find(&"eleven".to_string()));
    }

    #[test]
    fn convenience_calls_release_their_handle() {
        let tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 1);
        for k in 0..100u64 {
            assert!(tree.insert(k));
        }
        assert_eq!(tree.domain().active_threads(), 0);

        let held = tree.handle();
        assert_eq!(tree.try_find(&5).unwrap_err().capacity, 1);
        drop(held);
        assert_eq!(tree.try_remove(&5), Ok(true));
        assert_eq!(tree.try_find(&5), Ok(false));
        assert_eq!(tree.try_insert(5), Ok(true));
        assert_eq!(tree.len(), 100);
    }

    /// A remover that marked the parent but has not spliced it out yet. The leaf is still
    /// linked, yet no longer in the set, and the next search finishes the splice.
    #[test]
    fn leaf_below_marked_parent_is_absent() {
        let tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 1);
        let handle = &mut tree.handle();
        assert!(tree.insert_with(10u64, handle));
        assert!(tree.insert_with(20u64, handle));

        let mut cursor = Cursor::new(tree.root);
        tree.search(10, &mut cursor, handle);
        let op = Box::into_raw(Box::new(Info::Delete {
            gp: cursor.gp,
            gp_dir: cursor.gp_dir,
            p: cursor.p,
            p_dir: cursor.p_dir,
            l: cursor.l,
            l_other: cursor.l_other,
            pupdate: cursor.pupdate,
        }));
        let gp_node = unsafe { internal(cursor.gp) };
        let p_node = unsafe { internal(cursor.p) };
        assert!(gp_node
            .update
            .compare_exchange(cursor.gpupdate, StateRef::new(op, State::DeleteFlag))
            .is_ok());
        if !cursor.gpupdate.ptr().is_null() {
            unsafe { handle.thread.retire(cursor.gpupdate.ptr()) };
        }
        assert!(p_node
            .update
            .compare_exchange(cursor.pupdate, StateRef::new(op, State::Marked))
            .is_ok());
        assert_eq!(unsafe { &*cursor.l }.key(), 10);

        assert!(!tree.find_with(&10, handle));
        assert!(tree.find_with(&20, handle));
        // The splice happened and the grandparent is free again.
        let gp_update = gp_node.update.load(Ordering::SeqCst);
        assert_eq!(gp_update, StateRef::new(op, State::Clean));
        assert!(tree.insert_with(15u64, handle));
        assert!(tree.find_with(&15, handle));
    }

    /// A reader parked on a parent that is then removed, after which the record that marked the
    /// parent is replaced in the grandparent and freed. The reader must not follow it.
    #[test]
    fn stale_marked_parent_is_not_followed() {
        let tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 3);
        let reader = &mut tree.handle();
        assert!(tree.insert_with(10u64, reader));
        assert!(tree.insert_with(20u64, reader));

        let mut cursor = Cursor::new(tree.root);
        tree.search(10, &mut cursor, reader);
        assert_eq!(unsafe { &*cursor.l }.key(), 10);

        {
            let remover = &mut tree.handle();
            assert!(tree.remove_with(&10, remover));
        }
        {
            // Flags the old grandparent again, retiring the record that marked the parent.
            let inserter = &mut tree.handle();
            assert!(tree.insert_with(15u64, inserter));
        }

        // The parent is frozen, so re-reading its info field validates trivially.
        let marked = unsafe { internal(cursor.p) }.update.load(Ordering::SeqCst);
        assert_eq!(marked.state(), State::Marked);
        reader.pupdate_h.protect_raw(marked.ptr());
        assert_eq!(
            unsafe { internal(cursor.p) }.update.load(Ordering::SeqCst),
            marked
        );
        assert!(!tree.help_marked_if_linked(
            marked,
            cursor.gp,
            cursor.gp_dir,
            cursor.p,
            &reader.thread
        ));

        assert!(!tree.find_with(&10, reader));
        assert!(tree.find_with(&15, reader));
        assert!(tree.find_with(&20, reader));
    }

    /// Writers churn a few hot keys right next to stable ones, while checking that the stable
    /// keys never disappear and that no freed leaf is ever cloned.
    #[test]
    fn concurrent_removal_keeps_neighbours() {
        const THREADS: usize = 4;
        const HOT: u64 = 8;
        const ITER: u64 = 5_000;

        let tree = &LockFreeBst::with_key_fn_and_threads(|t: &Tagged| t.key, THREADS + 1);
        {
            let handle = &mut tree.handle();
            for key in HOT..2 * HOT {
                assert!(tree.insert_with(Tagged::new(key), handle));
            }
        }

        thread::scope(|s| {
            for t in 0..THREADS as u64 {
                s.spawn(move |_| {
                    let handle = &mut tree.handle();
                    for i in 0..ITER {
                        let key = (i + t) % HOT;
                        tree.insert_with(Tagged::new(key), handle);
                        tree.find_with(&Tagged::new(key), handle);
                        tree.remove_with(&Tagged::new(key), handle);
                        let stable = HOT + (i + t) % HOT;
                        assert!(
                            tree.find_with(&Tagged::new(stable), handle),
                            "{} vanished",
                            stable
                        );
                    }
                });
            }
        })
        .unwrap();

        let handle = &mut tree.handle();
        for key in 0..HOT {
            tree.remove_with(&Tagged::new(key), handle);
            assert!(!tree.find_with(&Tagged::new(key), handle));
        }
        for key in HOT..2 * HOT {
            assert!(tree.find_with(&Tagged::new(key), handle));
        }
        assert_eq!(tree.len(), HOT as usize);
    }

    #[test]
    fn deep_tree_drops() {
        let tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 1);
        let handle = &mut tree.handle();
        for k in 0..5_000u64 {
            assert!(tree.insert_with(k, handle));
        }
    }

    #[test]
    fn dump_lists_every_node() {
        let mut tree = LockFreeBst::with_key_fn_and_threads(IdentityKey, 1);
        tree.insert(3u64);
        tree.insert(1u64);
        let mut out = Vec::new();
        tree.dump(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "elements: 2",
                "internal inf1",
                "  internal 3",
                "    leaf 1 1",
                "    leaf 3 3",
                "  leaf inf1",
            ]
        );
    }
}
