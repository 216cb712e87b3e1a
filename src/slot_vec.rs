/// An element that records its own position in a [`SlotVec`].
pub trait Indexed {
    fn index(&self) -> usize;
    fn set_index(&mut self, idx: usize);
}

/// An owning vector whose elements know their own index, giving
/// constant-time removal of any element. Used for the runnable/blocked
/// proc vectors and each port's writers list.
#[derive(Debug)]
pub struct SlotVec<T: Indexed> {
    data: Vec<T>,
}

/// Capacity below which `trim` never shrinks.
const INIT_SLOTS: usize = 8;

impl<T: Indexed> SlotVec<T> {
    pub fn new() -> Self {
        SlotVec {
            data: Vec::with_capacity(INIT_SLOTS),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Append `item`, recording its position in its index field.
    pub fn push(&mut self, mut item: T) {
        item.set_index(self.data.len());
        self.data.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.data.pop()
    }

    /// Remove the element at `idx` by swapping the tail into its slot and
    /// fixing the moved element's index. Returns the removed element.
    pub fn swap_delete(&mut self, idx: usize) -> T {
        let item = self.data.swap_remove(idx);
        if let Some(moved) = self.data.get_mut(idx) {
            moved.set_index(idx);
        }
        item
    }

    /// Hysteretic shrink: halve capacity once `hint` has dropped to a
    /// quarter of it, but never below the initial minimum.
    pub fn trim(&mut self, hint: usize) {
        let cap = self.data.capacity();
        if hint <= cap / 4 && cap / 2 >= INIT_SLOTS {
            self.data.shrink_to(cap / 2);
        }
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.data.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.data.get_mut(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.data.iter_mut()
    }
}

impl<T: Indexed> Default for SlotVec<T> {
    fn default() -> Self {
        SlotVec::new()
    }
}
