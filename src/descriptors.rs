use crate::{Error, Result};

/// Hands out shader-visible descriptor indices from a fixed-size heap.
///
/// Indices only ever grow; there is no free list. Index 0 is never handed
/// out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorAllocator {
    current: u32,
    capacity: u32,
}

impl DescriptorAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            current: 0,
            capacity,
        }
    }

    pub fn next_index(&mut self) -> Result<u32> {
        if self.current + 1 >= self.capacity {
            return Err(Error::DescriptorHeapExhausted {
                capacity: self.capacity,
            });
        }

        self.current += 1;

        Ok(self.current)
    }

    pub fn allocated(&self) -> u32 {
        self.current
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test() {
        let mut target = DescriptorAllocator::new(4);

        assert_eq!(1, target.next_index().unwrap());
        assert_eq!(2, target.next_index().unwrap());
        assert_eq!(3, target.next_index().unwrap());

        assert!(matches!(
            target.next_index(),
            Err(Error::DescriptorHeapExhausted { capacity: 4 })
        ));

        // Exhaustion is sticky
        assert!(target.next_index().is_err());
        assert_eq!(3, target.allocated());
    }
}
