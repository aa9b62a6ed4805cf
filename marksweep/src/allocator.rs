use std::fmt;

use blockalloc::BlockError;

use crate::constants;
use crate::kind::KindId;
use crate::rawptr::RawPtr;

/// An allocation error type
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AllocError {
    /// Some attribute of the allocation, most likely the size requested or
    /// the kind, could not be fulfilled
    BadRequest,
    /// Out of memory - allocating the space failed, even after collecting
    OOM,
    /// The kind table is full
    TooManyKinds,
    /// The kind already owns heap blocks and can no longer be reconfigured
    KindInUse,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocError::BadRequest => write!(f, "bad allocation request"),
            AllocError::OOM => write!(f, "out of memory"),
            AllocError::TooManyKinds => {
                write!(f, "too many object kinds, at most {}", constants::MAX_KINDS)
            }
            AllocError::KindInUse => write!(f, "object kind already has allocated blocks"),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<BlockError> for AllocError {
    fn from(error: BlockError) -> AllocError {
        match error {
            BlockError::BadRequest => AllocError::BadRequest,
            BlockError::OOM => AllocError::OOM,
        }
    }
}

/// A type that describes allocation of an object into a heap space, returning
/// a bare pointer type on success
pub trait AllocRaw {
    /// Allocate `bytes` bytes of an object of the given kind
    fn alloc(&self, kind: KindId, bytes: usize) -> Result<RawPtr, AllocError>;

    /// Explicitly give an object back
    fn free(&self, object: RawPtr) -> Result<(), AllocError>;
}

/// Object size class.
/// - Small objects share a block with others of the same size, counted in granules
/// - Large objects get a block, or a run of blocks, to themselves
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SizeClass {
    Small(usize),
    Large(usize),
}

impl SizeClass {
    pub fn get_for_size(object_size: usize) -> Result<SizeClass, AllocError> {
        match object_size {
            0..=constants::MAX_SMALL_OBJECT => Ok(SizeClass::Small(granules_of(object_size))),
            size if size <= constants::MAX_ALLOC_SIZE => Ok(SizeClass::Large(alloc_size_of(size))),
            _ => Err(AllocError::BadRequest),
        }
    }

    /// The number of bytes actually handed out for this class
    pub fn bytes(&self) -> usize {
        match self {
            SizeClass::Small(granules) => granules * constants::GRANULE_BYTES,
            SizeClass::Large(bytes) => *bytes,
        }
    }
}

/// Granules needed for an object of `object_size` bytes; never less than one
/// so there is always room for a free list link
pub fn granules_of(object_size: usize) -> usize {
    let granules = (object_size + constants::GRANULE_BYTES - 1) / constants::GRANULE_BYTES;
    granules.max(1)
}

/// Return the allocated size of an object rounded up to a double-word boundary
pub fn alloc_size_of(object_size: usize) -> usize {
    let align = constants::GRANULE_BYTES;
    (object_size.max(1) + (align - 1)) & !(align - 1)
}
