//! Intrusive doubly linked lists over page-resident records.
//!
//! Nodes are `Copy` handles to memory the heap owns. Every node carries the
//! [`ListId`] of the list currently holding it: `push_front` insists on
//! [`ListId::Unlinked`] and `remove` insists on the list's own id, so a record
//! can never sit in two lists at once. Lists of the same kind that serve
//! different size classes also compare the node's class.

/// Which list currently owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListId {
    Unlinked = 0,
    Partial = 1,
    Full = 2,
    Cached = 3,
}

impl ListId {
    pub(crate) const fn into_bits(self) -> u8 {
        self as u8
    }

    pub(crate) const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Partial,
            2 => Self::Full,
            3 => Self::Cached,
            _ => Self::Unlinked,
        }
    }
}

/// A handle that can be threaded onto a [`List`].
pub(crate) trait Linked: Copy + PartialEq {
    fn prev(self) -> Option<Self>;
    fn next(self) -> Option<Self>;
    fn set_prev(self, prev: Option<Self>);
    fn set_next(self, next: Option<Self>);
    fn owner(self) -> ListId;
    fn set_owner(self, owner: ListId);

    /// Size class the node belongs to, for lists that hold a single class.
    fn class(self) -> u8 {
        0
    }
}

pub(crate) struct List<T: Linked> {
    head: Option<T>,
    len: usize,
    id: ListId,
    class: u8,
}

impl<T: Linked> List<T> {
    pub const fn new(id: ListId) -> Self {
        Self::with_class(id, 0)
    }

    /// A list that only accepts nodes of size class `class`.
    pub const fn with_class(id: ListId, class: u8) -> Self {
        Self {
            head: None,
            len: 0,
            id,
            class,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub const fn front(&self) -> Option<T> {
        self.head
    }

    /// # Panics
    /// If `node` is linked into any list or is of another class.
    pub fn push_front(&mut self, node: T) {
        assert_eq!(
            node.owner(),
            ListId::Unlinked,
            "record pushed onto {:?} while still linked",
            self.id
        );
        assert_eq!(node.class(), self.class, "record of another class pushed onto {:?}", self.id);
        node.set_prev(None);
        node.set_next(self.head);
        if let Some(head) = self.head {
            head.set_prev(Some(node));
        }
        self.head = Some(node);
        node.set_owner(self.id);
        self.len += 1;
    }

    /// # Panics
    /// If `node` is not owned by this list.
    pub fn remove(&mut self, node: T) {
        assert!(
            node.owner() == self.id && node.class() == self.class,
            "record not owned by this list"
        );
        let prev = node.prev();
        let next = node.next();
        match prev {
            Some(prev) => prev.set_next(next),
            None => {
                debug_assert!(self.head == Some(node));
                self.head = next;
            }
        }
        if let Some(next) = next {
            next.set_prev(prev);
        }
        node.set_prev(None);
        node.set_next(None);
        node.set_owner(ListId::Unlinked);
        self.len -= 1;
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// Front to back.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.next();
            Some(node)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct Node {
        prev: Cell<Option<Handle>>,
        next: Cell<Option<Handle>>,
        owner: Cell<Option<ListId>>,
        class: Cell<u8>,
    }

    #[derive(Clone, Copy)]
    struct Handle(&'static Node);

    impl PartialEq for Handle {
        fn eq(&self, other: &Self) -> bool {
            std::ptr::eq(self.0, other.0)
        }
    }

    impl Linked for Handle {
        fn prev(self) -> Option<Self> {
            self.0.prev.get()
        }
        fn next(self) -> Option<Self> {
            self.0.next.get()
        }
        fn set_prev(self, prev: Option<Self>) {
            self.0.prev.set(prev);
        }
        fn set_next(self, next: Option<Self>) {
            self.0.next.set(next);
        }
        fn owner(self) -> ListId {
            self.0.owner.get().unwrap_or(ListId::Unlinked)
        }
        fn set_owner(self, owner: ListId) {
            self.0.owner.set(Some(owner));
        }
        fn class(self) -> u8 {
            self.0.class.get()
        }
    }

    fn nodes<const N: usize>() -> [Handle; N] {
        core::array::from_fn(|_| Handle(Box::leak(Box::default())))
    }

    #[test]
    fn lifo_order_and_removal() {
        let [a, b, c] = nodes();
        let mut list = List::new(ListId::Partial);
        list.push_front(a);
        list.push_front(b);
        list.push_front(c);
        assert_eq!(list.len(), 3);
        assert!(list.iter().eq([c, b, a]));

        list.remove(b);
        assert!(list.iter().eq([c, a]));
        assert_eq!(b.owner(), ListId::Unlinked);
        assert!(a.prev() == Some(c));

        assert!(list.pop_front() == Some(c));
        assert!(list.pop_front() == Some(a));
        assert!(list.pop_front().is_none());
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "still linked")]
    fn double_link_panics() {
        let [a] = nodes();
        let mut partial = List::new(ListId::Partial);
        let mut full = List::new(ListId::Full);
        partial.push_front(a);
        full.push_front(a);
    }

    #[test]
    #[should_panic(expected = "not owned")]
    fn foreign_remove_panics() {
        let [a] = nodes();
        let mut partial = List::new(ListId::Partial);
        let mut cached = List::new(ListId::Cached);
        partial.push_front(a);
        cached.remove(a);
    }

    #[test]
    #[should_panic(expected = "not owned")]
    fn remove_from_a_list_of_another_class_panics() {
        let [a] = nodes();
        a.0.class.set(3);
        let mut order3 = List::with_class(ListId::Partial, 3);
        let mut order1 = List::with_class(ListId::Partial, 1);
        order3.push_front(a);
        order1.remove(a);
    }

    #[test]
    #[should_panic(expected = "another class")]
    fn push_onto_a_list_of_another_class_panics() {
        let [a] = nodes();
        a.0.class.set(2);
        let mut order0 = List::with_class(ListId::Full, 0);
        order0.push_front(a);
    }

    #[test]
    fn list_ids_round_trip_bits() {
        for id in [ListId::Unlinked, ListId::Partial, ListId::Full, ListId::Cached] {
            assert_eq!(ListId::from_bits(id.into_bits()), id);
        }
    }
}
