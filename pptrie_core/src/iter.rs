//! Lexicographic iteration over the words of a trie (or of one subtree).

use crate::errors::Result;
use crate::mem_pool::Offset;
use crate::node::{link_target, NodeRef};
use crate::token::{ReaderToken, Token};
use crate::types::{StateId, TokenKind};
use crate::Patricia;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;

/// Bidirectional cursor over words in unsigned byte order.
///
/// Every positioning method returns `true` when the cursor rests on a word
/// and `false` when it ran off either end (the cursor is then invalid).
pub trait LexIterator {
    fn seek_begin(&mut self) -> bool;
    fn seek_end(&mut self) -> bool;
    /// Position on the smallest word `>= key`.
    fn seek_lower_bound(&mut self, key: &[u8]) -> bool;
    fn incr(&mut self) -> bool;
    fn decr(&mut self) -> bool;
    /// Current word; empty when the cursor is invalid.
    fn word(&self) -> &[u8];
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: Offset,
    /// child currently descended into
    child: usize,
    /// word length once this node's label and zpath are appended
    len: usize,
}

/// Iterator token: a reader token plus a cached position.
///
/// The cached node offsets stay readable while the token is acquired; after
/// other mutations call [`Token::update`] to take a fresh stamp and re-seek.
#[derive(Debug)]
pub struct PatriciaIter<'t> {
    token: ReaderToken<'t>,
    root: StateId,
    stack: Vec<Frame>,
    word: Vec<u8>,
}

/// Uniquely owned iterator handle.
pub type IteratorPtr<'t> = PatriciaIter<'t>;

impl<'t> PatriciaIter<'t> {
    /// Acquired iterator, not yet positioned.
    pub(crate) fn new(trie: &'t Patricia, root: StateId) -> Result<Self> {
        let mut token = ReaderToken::with_kind(trie, TokenKind::Iterator)?;
        token.acquire();
        Ok(Self {
            token,
            root,
            stack: Vec::with_capacity(16),
            word: Vec::new(),
        })
    }

    pub fn is_valid(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Drop the cached position; the token stays as it is.
    pub fn token_detach_iter(&mut self) {
        self.stack.clear();
        self.word.clear();
        self.token.base.core.value = 0;
    }

    #[inline]
    fn trie(&self) -> &'t Patricia {
        self.token.trie()
    }

    #[inline]
    fn node(&self, off: Offset) -> NodeRef<'t> {
        NodeRef::new(&self.trie().pool, off)
    }

    fn reset(&mut self) {
        self.token_detach_iter();
        let root = match self.root.node {
            0 => link_target(self.trie().root.load(Ordering::Acquire)),
            off => off,
        };
        self.stack.push(Frame { node: root, child: 0, len: 0 });
    }

    fn top(&self) -> Frame {
        self.stack[self.stack.len() - 1]
    }

    fn enter_child(&mut self, i: usize) {
        let depth = self.stack.len() - 1;
        self.stack[depth].child = i;
        let parent = self.node(self.stack[depth].node);
        let child = self.node(link_target(parent.link(i).load(Ordering::Acquire)));
        self.word.push(parent.labels()[i]);
        self.word.extend_from_slice(child.zpath());
        self.stack.push(Frame { node: child.off, child: 0, len: self.word.len() });
    }

    fn pop(&mut self) -> bool {
        self.stack.pop();
        match self.stack.last() {
            Some(f) => {
                self.word.truncate(f.len);
                true
            }
            None => false,
        }
    }

    // Settle on the word at the top of the stack, or report the miss.
    fn settle(&mut self, found: bool) -> bool {
        if found {
            let top = self.top();
            self.token.base.core.value = self.node(top.node).value(Ordering::Acquire);
        } else {
            self.token_detach_iter();
        }
        found
    }

    // Smallest word in the subtree of the top node.
    fn first_from_top(&mut self) -> bool {
        loop {
            let node = self.node(self.top().node);
            if node.value(Ordering::Acquire) != 0 {
                return true;
            }
            if node.n_children() == 0 {
                // only an empty root has neither
                return false;
            }
            self.enter_child(0);
        }
    }

    // Largest word in the subtree of the top node.
    fn last_from_top(&mut self) -> bool {
        loop {
            let node = self.node(self.top().node);
            match node.n_children() {
                0 => return node.value(Ordering::Acquire) != 0,
                n => self.enter_child(n - 1),
            }
        }
    }

    // First word after the whole subtree of the top node.
    fn next_after_subtree(&mut self) -> bool {
        while self.pop() {
            let top = self.top();
            if top.child + 1 < self.node(top.node).n_children() {
                self.enter_child(top.child + 1);
                return self.first_from_top();
            }
        }
        false
    }

    fn lower_bound(&mut self, key: &[u8]) -> bool {
        self.reset();
        let mut pos = 0;
        loop {
            let top = self.top();
            let node = self.node(top.node);
            if self.stack.len() > 1 {
                let z = node.zpath();
                let rest = &key[pos..];
                let cp = crate::helpers::common_prefix_len(z, rest);
                if cp < z.len() {
                    if cp == rest.len() || z[cp] > rest[cp] {
                        return self.first_from_top();
                    }
                    return self.next_after_subtree();
                }
                pos += z.len();
            }
            if pos == key.len() {
                return self.first_from_top();
            }
            match node.find(key[pos]) {
                Ok(i) => {
                    self.enter_child(i);
                    pos += 1;
                }
                Err(i) if i < node.n_children() => {
                    self.enter_child(i);
                    return self.first_from_top();
                }
                Err(_) => return self.next_after_subtree(),
            }
        }
    }
}

impl LexIterator for PatriciaIter<'_> {
    fn seek_begin(&mut self) -> bool {
        self.reset();
        let found = self.first_from_top();
        self.settle(found)
    }

    fn seek_end(&mut self) -> bool {
        self.reset();
        let found = self.last_from_top();
        self.settle(found)
    }

    fn seek_lower_bound(&mut self, key: &[u8]) -> bool {
        let found = self.lower_bound(key);
        self.settle(found)
    }

    fn incr(&mut self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let found = if self.node(self.top().node).n_children() > 0 {
            self.enter_child(0);
            self.first_from_top()
        } else {
            self.next_after_subtree()
        };
        self.settle(found)
    }

    fn decr(&mut self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let found = loop {
            if !self.pop() {
                break false;
            }
            let top = self.top();
            if top.child > 0 {
                self.enter_child(top.child - 1);
                break self.last_from_top();
            }
            if self.node(top.node).value(Ordering::Acquire) != 0 {
                break true;
            }
        };
        self.settle(found)
    }

    fn word(&self) -> &[u8] {
        &self.word
    }
}

impl Token for PatriciaIter<'_> {
    fn acquire(&mut self) {
        self.token.acquire();
    }

    fn release(&mut self) {
        self.token.release();
    }

    /// Fresh stamp, then re-seek to the current word.
    fn update(&mut self) {
        if !self.trie().concurrent_level().tracks_tokens() {
            return;
        }
        self.token.update();
        if self.is_valid() {
            let word = std::mem::take(&mut self.word);
            self.seek_lower_bound(&word);
        }
    }

    fn dispose(mut self) {
        self.token_detach_iter();
    }
}

impl<'t> Deref for PatriciaIter<'t> {
    type Target = ReaderToken<'t>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<'t> DerefMut for PatriciaIter<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
