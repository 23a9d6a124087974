/// Capacity of a lock stack. A thread that holds more fast locks inflates.
pub const CAPACITY: usize = 8;

/// Per-thread record of objects held through fast locking.
///
/// A fast-locked object's header only says "locked"; the owner is whoever
/// has the object on its lock stack. When such an object is inflated the
/// monitor's owner is anonymous until the owner claims it.
pub struct LockStack<O> {
    top: usize,
    base: [Option<O>; CAPACITY],
}

impl<O: Clone + PartialEq> LockStack<O> {
    pub fn new() -> Self {
        Self {
            top: 0,
            base: Default::default(),
        }
    }

    pub fn push(&mut self, obj: O) {
        assert!(!self.contains(&obj));
        assert!(!self.is_full());
        self.base[self.top] = Some(obj);
        self.top += 1;
    }

    pub fn bottom(&self) -> Option<&O> {
        self.base[0].as_ref()
    }

    pub fn top(&self) -> Option<&O> {
        self.top.checked_sub(1).and_then(|ix| self.base[ix].as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    pub fn len(&self) -> usize {
        self.top
    }

    pub fn is_recursive(&self, o: &O) -> bool {
        // Iff there is a consecutive run of `o` of length at least 2.
        // Start from the top: balanced locking usually finds `o` there.
        for i in (1..self.top).rev() {
            if self.base[i - 1].as_ref() == Some(o) && self.base[i].as_ref() == Some(o) {
                return true;
            }
            // `o` occurs in at most one run, and that run has length 1.
            if self.base[i].as_ref() == Some(o) {
                break;
            }
        }

        false
    }

    pub fn try_recursive_enter(&mut self, o: &O) -> bool {
        if self.top == 0 || self.is_full() || self.base[self.top - 1].as_ref() != Some(o) {
            return false;
        }

        self.base[self.top] = Some(o.clone());
        self.top += 1;
        true
    }

    pub fn try_recursive_exit(&mut self, o: &O) -> bool {
        let end = self.top;
        if end <= 1 || self.base[end - 1].as_ref() != Some(o) || self.base[end - 2].as_ref() != Some(o) {
            return false;
        }

        self.top -= 1;
        self.base[self.top] = None;
        true
    }

    /// Pop `o` if it is on top.
    pub fn pop(&mut self, o: &O) -> bool {
        if self.top() != Some(o) {
            return false;
        }
        self.top -= 1;
        self.base[self.top] = None;
        true
    }

    /// Remove every occurrence of `o`. Returns how many were removed.
    pub fn remove(&mut self, o: &O) -> usize {
        let end = self.top;
        let mut inserted = 0;

        for i in 0..end {
            if self.base[i].as_ref() != Some(o) {
                if inserted != i {
                    self.base[inserted] = self.base[i].take();
                }
                inserted += 1;
            }
        }

        for slot in &mut self.base[inserted..end] {
            *slot = None;
        }

        let removed = end - inserted;
        self.top = inserted;
        removed
    }

    pub fn contains(&self, obj: &O) -> bool {
        self.base[..self.top].iter().any(|x| x.as_ref() == Some(obj))
    }

    pub fn is_full(&self) -> bool {
        self.top == CAPACITY
    }
}

impl<O: Clone + PartialEq> Default for LockStack<O> {
    fn default() -> Self {
        Self::new()
    }
}
