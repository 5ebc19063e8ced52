//! Fixed-capacity FIFO arena.
//!
//! Entries live in a boxed slice of slots addressed by head/len indices, so
//! pushing and popping never allocate. Each entry also declares a byte
//! footprint that is charged against a byte budget, mirroring the memory a
//! packed buffer of the same capacity would use.

#[derive(Debug, Clone)]
struct Slot<T> {
    item: T,
    footprint: usize,
}

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Box<[Option<Slot<T>>]>,
    head: usize,
    len: usize,
    byte_budget: usize,
    bytes_used: usize,
    recycle: bool,
}

impl<T> RingBuffer<T> {
    pub fn new(max_entries: usize, byte_budget: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            slots: (0..max_entries).map(|_| None).collect(),
            head: 0,
            len: 0,
            byte_budget,
            bytes_used: 0,
            recycle: false,
        }
    }

    /// When set, a push that does not fit evicts the oldest entries instead
    /// of failing.
    pub fn set_recycle(&mut self, recycle: bool) {
        self.recycle = recycle;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn byte_budget(&self) -> usize {
        self.byte_budget
    }

    /// Whether an entry of `footprint` bytes could be pushed without eviction.
    pub fn can_fit(&self, footprint: usize) -> bool {
        self.len < self.slots.len() && self.bytes_used + footprint <= self.byte_budget
    }

    /// Appends an entry, handing it back when the buffer is full and
    /// recycling is off or cannot make room.
    pub fn push(&mut self, item: T, footprint: usize) -> Result<(), T> {
        if footprint > self.byte_budget {
            return Err(item);
        }
        while !self.can_fit(footprint) {
            if !self.recycle || self.pop_first().is_none() {
                return Err(item);
            }
        }

        let index = self.physical(self.len);
        self.slots[index] = Some(Slot { item, footprint });
        self.len += 1;
        self.bytes_used += footprint;
        Ok(())
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn first_mut(&mut self) -> Option<&mut T> {
        self.get_mut(0)
    }

    pub fn last(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.slots[self.physical(index)].as_ref().map(|slot| &slot.item)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        let physical = self.physical(index);
        self.slots[physical].as_mut().map(|slot| &mut slot.item)
    }

    pub fn pop_first(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let slot = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        self.bytes_used -= slot.footprint;
        Some(slot.item)
    }

    pub fn clear(&mut self) {
        while self.pop_first().is_some() {}
        self.head = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        let capacity = self.slots.len();
        let (head, len) = (self.head, self.len);
        let (tail, front) = self.slots.split_at_mut(head);
        front
            .iter_mut()
            .chain(tail.iter_mut())
            .take(len.min(capacity))
            .filter_map(|slot| slot.as_mut().map(|slot| &mut slot.item))
    }

    fn physical(&self, index: usize) -> usize {
        (self.head + index) % self.slots.len()
    }
}
