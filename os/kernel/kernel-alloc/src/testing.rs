//! Direct-map glue for the simulated RAM used by unit tests.

use crate::phys_mapper::DirectMap;

pub use kernel_testing::TestMemory;

pub trait TestMemoryExt {
    fn direct_map(&self) -> DirectMap;
}

impl TestMemoryExt for TestMemory {
    fn direct_map(&self) -> DirectMap {
        DirectMap::with_offset(self.offset())
    }
}
