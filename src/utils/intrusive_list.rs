//! Intrusive doubly-linked list whose elements live in a container
//! implementing `core::ops::Index`, with links stored in cell-like fields
//! accessed through an explicit key.
//!
//! The kernel threads every queue it maintains (ready lists, wait queues,
//! timeout queues, owned-mutex chains) through links embedded in the
//! elements themselves. The elements are reached through an `Index`
//! implementation so the same machinery works for `&'static` references
//! (identity-indexed) and for test pools backed by `Vec`.
use core::{fmt, ops};

use super::Init;

/// List header storing both endpoints.
#[derive(Debug, Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
    pub last: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self {
        first: None,
        last: None,
    };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to the neighbour elements. `None` at an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Option<Index>,
    pub next: Option<Index>,
}

impl<Index> Init for Link<Index> {
    const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Print the address, not the pointee. This is a safe measure against
        // infinite recursion when an element's `Debug` prints its links.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// A virtual container of `T`s indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// List header whose elements are linked by pairs of `&'static Element`.
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links with a `'static` lifetime. See also [`StaticListHead`].
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// Cell-like storage accessed through a key. The kernel's link fields are
/// `CpuLockCell`s keyed by the CPU Lock guard; test code uses plain `Cell`s
/// keyed by `()`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    fn modify(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target))
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        f(&mut x);
        self.set(key, x);
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<'a, Element: Clone, Token, Key> CellLike<&'a mut Key> for tokenlock::TokenLock<Element, Token>
where
    Key: tokenlock::Token<Token>,
{
    type Target = Element;

    fn get(&self, key: &&'a mut Key) -> Self::Target {
        self.read(*key).clone()
    }
    fn set(&self, key: &mut &'a mut Key, value: Self::Target) {
        self.replace(*key, value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// Accessor combining a list header cell, the element pool, a projection
/// from an element to its link cell, and the key needed to read the cells.
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    pub fn back(&self) -> Option<Index> {
        self.head().last
    }

    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|p| &self.pool[p])
    }

    fn link_of(&self, item: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[item]).get(&self.cell_key)
    }

    fn set_link_of(&mut self, item: Index, link: Option<Link<Index>>) {
        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, link);
    }

    /// Is `item` currently a member of this (or, strictly speaking, any)
    /// list?
    pub fn is_linked(&self, item: Index) -> bool {
        self.link_of(item).is_some()
    }

    /// The successor of `item`, or `None` if `item` is the last element.
    pub fn next(&self, item: Index) -> Option<Index> {
        self.link_of(item).expect("item is not linked").next
    }

    /// The predecessor of `item`, or `None` if `item` is the first element.
    pub fn prev(&self, item: Index) -> Option<Index> {
        self.link_of(item).expect("item is not linked").prev
    }

    /// Insert `item` before `at` (or at the back if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(!self.is_linked(item.clone()), "item is already linked");

        let mut head = self.head();
        let (prev, next) = match at {
            Some(next) => {
                let prev = self.link_of(next.clone()).expect("`at` is not linked").prev;
                (prev, Some(next))
            }
            None => (head.last.clone(), None),
        };

        match &prev {
            Some(p) => {
                let p = p.clone();
                self.set_link_of(
                    p.clone(),
                    Some(Link {
                        prev: self.link_of(p.clone()).unwrap().prev,
                        next: Some(item.clone()),
                    }),
                );
            }
            None => head.first = Some(item.clone()),
        }
        match &next {
            Some(n) => {
                let n = n.clone();
                self.set_link_of(
                    n.clone(),
                    Some(Link {
                        prev: Some(item.clone()),
                        next: self.link_of(n.clone()).unwrap().next,
                    }),
                );
            }
            None => head.last = Some(item.clone()),
        }

        self.set_link_of(item, Some(Link { prev, next }));
        self.set_head(head);
    }

    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at);
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: Index) -> Index {
        let link = self.link_of(item.clone()).expect("item is not linked");

        let mut head = self.head();
        match &link.prev {
            Some(p) => self.set_link_of(
                p.clone(),
                Some(Link {
                    prev: self.link_of(p.clone()).unwrap().prev,
                    next: link.next.clone(),
                }),
            ),
            None => head.first = link.next.clone(),
        }
        match &link.next {
            Some(n) => self.set_link_of(
                n.clone(),
                Some(Link {
                    prev: link.prev.clone(),
                    next: self.link_of(n.clone()).unwrap().next,
                }),
            ),
            None => head.last = link.prev.clone(),
        }

        self.set_link_of(item.clone(), None);
        self.set_head(head);

        item
    }

    pub fn pop_front(&mut self) -> Option<Index> {
        self.front().map(|item| self.remove(item))
    }

    pub fn pop_back(&mut self) -> Option<Index> {
        self.back().map(|item| self.remove(item))
    }

    pub fn iter(&self) -> Iter<&Self, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of `ListAccessorCell`.
#[derive(Debug)]
pub struct Iter<Accessor, Index> {
    accessor: Accessor,
    next: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<&'b ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: 'a + Fn(&Element) -> &LinkCell,
    Element: 'a + 'b,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = (Index, &'a Element);

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = self.accessor.link_of(next.clone()).unwrap().next;
        Some((next.clone(), &self.accessor.pool[next]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::{cell::Cell, collections::VecDeque, prelude::v1::*};

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    #[test]
    fn basic_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(i32, _)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        get_accessor!().push_back(ptr1);

        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        get_accessor!().push_back(ptr2);

        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        get_accessor!().push_front(ptr3);

        let mut accessor = get_accessor!();
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);

        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert_eq!(accessor.next(ptr3), Some(ptr1));
        assert_eq!(accessor.prev(ptr1), Some(ptr3));
        assert_eq!(accessor.next(ptr2), None);
        assert_eq!(accessor.prev(ptr3), None);

        accessor.remove(ptr1);
        accessor.remove(ptr2);
        accessor.remove(ptr3);

        assert!(accessor.is_empty());
    }

    #[test]
    fn clear_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(i32, _)| link, ())
            };
        }

        let ptrs = [
            push(&mut pool, (1, Cell::new(None))),
            push(&mut pool, (2, Cell::new(None))),
            push(&mut pool, (3, Cell::new(None))),
        ];

        get_accessor!().push_back(ptrs[0]);
        get_accessor!().push_back(ptrs[1]);
        get_accessor!().push_front(ptrs[2]);

        while get_accessor!().pop_front().is_some() {}

        assert_eq!(head.get().first, None);
        assert_eq!(head.get().last, None);
        for &ptr in &ptrs {
            assert!(pool[ptr].1.get().is_none());
        }
    }

    #[test]
    fn basic_cell_static() {
        #[derive(Debug)]
        struct El(u32, Cell<Option<Link<Ident<&'static El>>>>);

        fn push_static(x: El) -> Ident<&'static El> {
            Ident(Box::leak(Box::new(x)))
        }

        let head = Cell::new(ListHead::<Ident<&'static El>>::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &Static, |El(_, link)| link, ())
            };
        }

        let ptr1 = push_static(El(1, Cell::new(None)));
        get_accessor!().push_back(ptr1);

        let ptr2 = push_static(El(2, Cell::new(None)));
        get_accessor!().push_back(ptr2);

        let ptr3 = push_static(El(3, Cell::new(None)));
        get_accessor!().push_front(ptr3);

        let mut accessor = get_accessor!();
        let items: Vec<_> = accessor.iter().map(|(_, El(x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        accessor.remove(ptr1);
        accessor.remove(ptr2);
        accessor.remove(ptr3);

        assert!(accessor.is_empty());
    }

    /// Model test: a random sequence of push/pop/remove operations behaves
    /// exactly like `VecDeque`.
    #[quickcheck]
    fn model(bytecode: Vec<u8>) {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        let mut reference: VecDeque<usize> = VecDeque::new();

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(usize, _)| link, ())
            };
        }

        for (i, instr) in bytecode.into_iter().enumerate() {
            match instr % 4 {
                0 => {
                    let ptr = push(&mut pool, (i, Cell::new(None)));
                    get_accessor!().push_back(ptr);
                    reference.push_back(ptr);
                }
                1 => {
                    let ptr = push(&mut pool, (i, Cell::new(None)));
                    get_accessor!().push_front(ptr);
                    reference.push_front(ptr);
                }
                2 => {
                    assert_eq!(get_accessor!().pop_front(), reference.pop_front());
                }
                _ => {
                    if !reference.is_empty() {
                        let victim = reference.remove(i % reference.len()).unwrap();
                        get_accessor!().remove(victim);
                    }
                }
            }

            let items: Vec<_> = get_accessor!().iter().map(|(p, _)| p).collect();
            let expected: Vec<_> = reference.iter().copied().collect();
            assert_eq!(items, expected);
        }
    }
}
