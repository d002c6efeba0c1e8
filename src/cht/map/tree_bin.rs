use std::{borrow::Borrow, iter, sync::atomic::Ordering};

use crossbeam_epoch::{Atomic, Guard};
use smallvec::SmallVec;
use triomphe::Arc as TrioArc;

use super::bin::{BinLock, EntryParts};

pub(crate) type Entries<'g, K, V> = SmallVec<[EntryParts<'g, K, V>; 8]>;

pub(crate) struct TreeNode<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: TrioArc<K>,
    pub(crate) value: Atomic<V>,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
    red: bool,
    /// The next node in traversal order.
    next: Option<usize>,
}

/// A bin holding its entries in a red-black tree ordered by hash.
///
/// The nodes live in an arena indexed by `usize` and the tree is never
/// restructured once published. Lookups walk it without locking. A writer
/// holding `lock` may replace a node's value in place, but adding or removing
/// an entry builds a new `TreeBin` that replaces this one in the table.
pub(crate) struct TreeBin<K, V> {
    nodes: Box<[TreeNode<K, V>]>,
    root: Option<usize>,
    first: Option<usize>,
    pub(crate) lock: BinLock,
}

impl<K, V> TreeBin<K, V> {
    /// Builds a tree of `entries`, keeping their order as the traversal order.
    pub(crate) fn new<'g>(entries: impl IntoIterator<Item = EntryParts<'g, K, V>>) -> Self
    where
        K: 'g,
        V: 'g,
    {
        let mut builder = TreeBuilder::default();
        for (hash, key, value) in entries {
            builder.push(hash, key, Atomic::from(value));
        }
        builder.finish()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Iterates the nodes in traversal order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &TreeNode<K, V>> + '_ {
        iter::successors(self.first.map(|i| &self.nodes[i]), move |node| {
            node.next.map(|i| &self.nodes[i])
        })
    }

    pub(crate) fn find<Q>(&self, hash: u64, key: &Q) -> Option<&TreeNode<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.position(hash, key).map(|i| &self.nodes[i])
    }

    fn position<Q>(&self, hash: u64, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        // Rotations can leave nodes of equal hash on both sides of each
        // other, so a tie searches both subtrees.
        let mut pending: SmallVec<[usize; 8]> = self.root.into_iter().collect();
        while let Some(i) = pending.pop() {
            let node = &self.nodes[i];
            if hash < node.hash {
                pending.extend(node.left);
            } else if hash > node.hash {
                pending.extend(node.right);
            } else if (*node.key).borrow() == key {
                return Some(i);
            } else {
                pending.extend(node.left);
                pending.extend(node.right);
            }
        }
        None
    }

    /// Returns a tree holding this tree's entries followed by `entry`.
    pub(crate) fn with_entry<'g>(&'g self, entry: EntryParts<'g, K, V>, guard: &'g Guard) -> Self {
        Self::new(self.iter().map(|node| node.parts(guard)).chain(iter::once(entry)))
    }

    /// Returns this tree's entries without the one of `key`, or `None` when
    /// `key` is not in the tree. The removed entry's value is returned along.
    pub(crate) fn entries_without<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Option<(Entries<'g, K, V>, &'g TreeNode<K, V>)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let removed = self.position(hash, key)?;
        let entries = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != removed)
            .map(|(_, node)| node.parts(guard))
            .collect();
        Some((entries, &self.nodes[removed]))
    }

    /// Partitions the entries by whether `hash & bit` is zero, keeping their
    /// traversal order in each half.
    pub(crate) fn split<'g>(
        &'g self,
        bit: u64,
        guard: &'g Guard,
    ) -> (Entries<'g, K, V>, Entries<'g, K, V>) {
        let mut low = Entries::new();
        let mut high = Entries::new();
        for node in self.iter() {
            if node.hash & bit == 0 {
                low.push(node.parts(guard));
            } else {
                high.push(node.parts(guard));
            }
        }
        (low, high)
    }
}

impl<K, V> TreeNode<K, V> {
    pub(crate) fn parts<'g>(&'g self, guard: &'g Guard) -> EntryParts<'g, K, V> {
        (
            self.hash,
            TrioArc::clone(&self.key),
            self.value.load(Ordering::Acquire, guard),
        )
    }
}

struct TreeBuilder<K, V> {
    nodes: Vec<TreeNode<K, V>>,
    root: Option<usize>,
}

impl<K, V> Default for TreeBuilder<K, V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }
}

impl<K, V> TreeBuilder<K, V> {
    fn push(&mut self, hash: u64, key: TrioArc<K>, value: Atomic<V>) {
        let x = self.nodes.len();

        let mut parent = None;
        let mut go_left = false;
        let mut cur = self.root;
        while let Some(p) = cur {
            parent = Some(p);
            go_left = hash < self.nodes[p].hash;
            cur = if go_left {
                self.nodes[p].left
            } else {
                self.nodes[p].right
            };
        }

        self.nodes.push(TreeNode {
            hash,
            key,
            value,
            parent,
            left: None,
            right: None,
            red: true,
            next: None,
        });
        if x > 0 {
            self.nodes[x - 1].next = Some(x);
        }

        match parent {
            None => self.root = Some(x),
            Some(p) if go_left => self.nodes[p].left = Some(x),
            Some(p) => self.nodes[p].right = Some(x),
        }
        self.balance_insertion(x);
    }

    fn finish(self) -> TreeBin<K, V> {
        let first = if self.nodes.is_empty() { None } else { Some(0) };
        TreeBin {
            nodes: self.nodes.into_boxed_slice(),
            root: self.root,
            first,
            lock: BinLock::new(),
        }
    }

    fn parent(&self, i: usize) -> Option<usize> {
        self.nodes[i].parent
    }

    fn is_red(&self, i: Option<usize>) -> bool {
        i.map_or(false, |i| self.nodes[i].red)
    }

    fn balance_insertion(&mut self, mut x: usize) {
        self.nodes[x].red = true;
        loop {
            let Some(mut xp) = self.parent(x) else {
                self.nodes[x].red = false;
                return;
            };
            if !self.nodes[xp].red {
                return;
            }
            let Some(mut xpp) = self.parent(xp) else {
                return;
            };

            if Some(xp) == self.nodes[xpp].left {
                let uncle = self.nodes[xpp].right;
                if self.is_red(uncle) {
                    self.recolor(xp, uncle, xpp);
                    x = xpp;
                } else {
                    if Some(x) == self.nodes[xp].right {
                        x = xp;
                        self.rotate_left(x);
                        xp = match self.parent(x) {
                            Some(p) => p,
                            None => {
                                self.nodes[x].red = false;
                                return;
                            }
                        };
                        xpp = match self.parent(xp) {
                            Some(pp) => pp,
                            None => {
                                self.nodes[xp].red = false;
                                return;
                            }
                        };
                    }
                    self.nodes[xp].red = false;
                    self.nodes[xpp].red = true;
                    self.rotate_right(xpp);
                }
            } else {
                let uncle = self.nodes[xpp].left;
                if self.is_red(uncle) {
                    self.recolor(xp, uncle, xpp);
                    x = xpp;
                } else {
                    if Some(x) == self.nodes[xp].left {
                        x = xp;
                        self.rotate_right(x);
                        xp = match self.parent(x) {
                            Some(p) => p,
                            None => {
                                self.nodes[x].red = false;
                                return;
                            }
                        };
                        xpp = match self.parent(xp) {
                            Some(pp) => pp,
                            None => {
                                self.nodes[xp].red = false;
                                return;
                            }
                        };
                    }
                    self.nodes[xp].red = false;
                    self.nodes[xpp].red = true;
                    self.rotate_left(xpp);
                }
            }
        }
    }

    fn recolor(&mut self, parent: usize, uncle: Option<usize>, grandparent: usize) {
        self.nodes[parent].red = false;
        if let Some(u) = uncle {
            self.nodes[u].red = false;
        }
        self.nodes[grandparent].red = true;
    }

    fn rotate_left(&mut self, p: usize) {
        let Some(r) = self.nodes[p].right else {
            return;
        };
        let rl = self.nodes[r].left;
        self.nodes[p].right = rl;
        if let Some(rl) = rl {
            self.nodes[rl].parent = Some(p);
        }
        let pp = self.nodes[p].parent;
        self.nodes[r].parent = pp;
        match pp {
            None => {
                self.root = Some(r);
                self.nodes[r].red = false;
            }
            Some(pp) if self.nodes[pp].left == Some(p) => self.nodes[pp].left = Some(r),
            Some(pp) => self.nodes[pp].right = Some(r),
        }
        self.nodes[r].left = Some(p);
        self.nodes[p].parent = Some(r);
    }

    fn rotate_right(&mut self, p: usize) {
        let Some(l) = self.nodes[p].left else {
            return;
        };
        let lr = self.nodes[l].right;
        self.nodes[p].left = lr;
        if let Some(lr) = lr {
            self.nodes[lr].parent = Some(p);
        }
        let pp = self.nodes[p].parent;
        self.nodes[l].parent = pp;
        match pp {
            None => {
                self.root = Some(l);
                self.nodes[l].red = false;
            }
            Some(pp) if self.nodes[pp].right == Some(p) => self.nodes[pp].right = Some(l),
            Some(pp) => self.nodes[pp].left = Some(l),
        }
        self.nodes[l].right = Some(p);
        self.nodes[p].parent = Some(l);
    }
}
