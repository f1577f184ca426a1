use slab::Slab;

/// Handle of an element inside LruList.
pub type NodeKey = usize;

#[derive(Debug)]
struct Node<T> {
    prev: Option<NodeKey>,
    next: Option<NodeKey>,
    val: T,
}

/// Doubly linked list whose nodes live in a slab arena.
///
/// Head is the least recently used element, tail the most recent one.
/// Keys stay valid until the element is removed.
#[derive(Debug)]
pub struct LruList<T> {
    nodes: Slab<Node<T>>,
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
}

impl<T> Default for LruList<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    #[inline]
    pub fn new() -> Self {
        LruList {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn get(&self, key: NodeKey) -> Option<&T> {
        self.nodes.get(key).map(|n| &n.val)
    }

    #[inline]
    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut T> {
        self.nodes.get_mut(key).map(|n| &mut n.val)
    }

    /// Append value at tail and return its key.
    #[inline]
    pub fn push_back(&mut self, val: T) -> NodeKey {
        let key = self.nodes.insert(Node {
            prev: None,
            next: None,
            val,
        });
        self.link_back(key);
        key
    }

    #[inline]
    pub fn front(&self) -> Option<NodeKey> {
        self.head
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<T> {
        let key = self.head?;
        self.remove(key)
    }

    #[inline]
    pub fn remove(&mut self, key: NodeKey) -> Option<T> {
        if !self.nodes.contains(key) {
            return None;
        }
        self.unlink(key);
        Some(self.nodes.remove(key).val)
    }

    /// Relocate element to tail.
    #[inline]
    pub fn move_to_back(&mut self, key: NodeKey) {
        if self.tail == Some(key) || !self.nodes.contains(key) {
            return;
        }
        self.unlink(key);
        self.link_back(key);
    }

    /// Iterate from head to tail.
    #[inline]
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            next: self.head,
        }
    }

    #[inline]
    fn link_back(&mut self, key: NodeKey) {
        let old_tail = self.tail;
        {
            let node = &mut self.nodes[key];
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.nodes[t].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }

    #[inline]
    fn unlink(&mut self, key: NodeKey) {
        let (prev, next) = {
            let node = &self.nodes[key];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a LruList<T>,
    next: Option<NodeKey>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<&'a T> {
        let key = self.next?;
        let node = &self.list.nodes[key];
        self.next = node.next;
        Some(&node.val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &LruList<i32>) -> Vec<i32> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_lru_list_ops() {
        let mut list = LruList::new();
        let k1 = list.push_back(1);
        let k2 = list.push_back(2);
        let k3 = list.push_back(3);
        assert_eq!(collect(&list), vec![1, 2, 3]);
        list.move_to_back(k1);
        assert_eq!(collect(&list), vec![2, 3, 1]);
        list.move_to_back(k1);
        assert_eq!(collect(&list), vec![2, 3, 1]);
        assert_eq!(list.remove(k3), Some(3));
        assert_eq!(list.remove(k3), None);
        assert_eq!(collect(&list), vec![2, 1]);
        assert_eq!(list.front(), Some(k2));
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.pop_front(), Some(1));
        assert_eq!(list.pop_front(), None);
        assert!(list.is_empty());
        let k4 = list.push_back(4);
        *list.get_mut(k4).unwrap() = 5;
        assert_eq!(list.get(k4), Some(&5));
        assert_eq!(collect(&list), vec![5]);
    }
}
