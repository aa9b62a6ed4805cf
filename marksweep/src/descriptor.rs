//! Object descriptors: which words of an object may hold pointers.
//!
//! A `Descriptor` is attached to every mark stack entry and to every heap
//! block (derived from the block's kind). Descriptors that live in heap
//! memory, either inside an object or in a shared type descriptor, use a
//! one word encoding with a two bit tag in the low bits:
//!
//! | tag | meaning                                             |
//! |-----|-----------------------------------------------------|
//! | 0   | length in bytes (word multiple)                     |
//! | 1   | bitmap, bit `i` = word `i`, shifted left by 2       |
//! | 2   | scan procedure: env << 8, procedure id << 2         |
//! | 3   | per-object indirection: offset << 3, bit 2 selects  |
//! |     | the type descriptor form                            |
//!
//! The all-zero word decodes to nothing, meaning "skip this object".
use crate::constants::{BITMAP_MAX_WORDS, MAX_SCAN_PROCS, WORD, WORD_BITS};

const TAG_MASK: usize = 0b11;
const LENGTH_TAG: usize = 0;
const BITMAP_TAG: usize = 1;
const PROC_TAG: usize = 2;
const PER_OBJECT_TAG: usize = 3;

const PROC_SHIFT: usize = 2;
const ENV_SHIFT: usize = 8;
const TYPE_DESCRIPTOR_FLAG: usize = 0b100;
const OFFSET_SHIFT: usize = 3;

/// Index of a registered custom scan procedure
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcId(pub(crate) u8);

impl ProcId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Where a per-object descriptor is found
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Indirect {
    /// An encoded descriptor word at byte `offset` inside the object
    InObject { offset: usize },
    /// The object's first word points at a type descriptor, and the encoded
    /// descriptor word is at byte `offset` inside that
    InTypeDescriptor { offset: usize },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// Scan this many bytes as candidate pointers
    Length(usize),
    /// Scan the words whose bit is set, least significant bit is word 0
    Bitmap(usize),
    /// Call a registered scan procedure with an opaque environment word
    Proc { proc: ProcId, env: usize },
    /// Look the descriptor up per object
    PerObject(Indirect),
}

impl Descriptor {
    /// Nothing to scan
    pub const NONE: Descriptor = Descriptor::Length(0);

    /// Build a bitmap descriptor from the indices of the pointer words.
    /// Returns `None` if any index is beyond what a bitmap can describe.
    pub fn from_pointer_words(words: &[usize]) -> Option<Descriptor> {
        let mut bits = 0usize;
        for &word in words {
            if word >= BITMAP_MAX_WORDS {
                return None;
            }
            bits |= 1 << word;
        }
        Some(Descriptor::Bitmap(bits))
    }

    /// A procedure descriptor. The environment keeps its low 56 bits.
    pub fn proc(proc: ProcId, env: usize) -> Descriptor {
        Descriptor::Proc {
            proc,
            env: env & (usize::MAX >> ENV_SHIFT),
        }
    }

    /// True if scanning with this descriptor can find nothing
    pub fn is_empty(&self) -> bool {
        match self {
            Descriptor::Length(len) => *len < WORD,
            Descriptor::Bitmap(bits) => *bits == 0,
            _ => false,
        }
    }

    /// Encode into a single heap word
    pub fn encode(&self) -> usize {
        match *self {
            Descriptor::Length(len) => (len & !(WORD - 1)) | LENGTH_TAG,
            Descriptor::Bitmap(bits) => {
                let bits = bits & ((1 << BITMAP_MAX_WORDS) - 1);
                (bits << 2) | BITMAP_TAG
            }
            Descriptor::Proc { proc, env } => {
                (env << ENV_SHIFT) | (proc.index() << PROC_SHIFT) | PROC_TAG
            }
            Descriptor::PerObject(Indirect::InObject { offset }) => {
                (offset << OFFSET_SHIFT) | PER_OBJECT_TAG
            }
            Descriptor::PerObject(Indirect::InTypeDescriptor { offset }) => {
                (offset << OFFSET_SHIFT) | TYPE_DESCRIPTOR_FLAG | PER_OBJECT_TAG
            }
        }
    }

    /// Decode a heap word. Zero, which is what a cleared or freshly freed
    /// object holds, decodes to `None`.
    pub fn decode(word: usize) -> Option<Descriptor> {
        if word == 0 {
            return None;
        }

        let descr = match word & TAG_MASK {
            LENGTH_TAG => Descriptor::Length(word),
            BITMAP_TAG => Descriptor::Bitmap(word >> 2),
            PROC_TAG => {
                let proc = (word >> PROC_SHIFT) & (MAX_SCAN_PROCS - 1);
                Descriptor::Proc {
                    proc: ProcId(proc as u8),
                    env: word >> ENV_SHIFT,
                }
            }
            _ => {
                let offset = word >> OFFSET_SHIFT;
                if word & TYPE_DESCRIPTOR_FLAG != 0 {
                    Descriptor::PerObject(Indirect::InTypeDescriptor { offset })
                } else {
                    Descriptor::PerObject(Indirect::InObject { offset })
                }
            }
        };
        Some(descr)
    }

    /// Clamp to an object of `object_size` bytes so scanning never walks into
    /// a neighbouring object
    pub(crate) fn clamp_to(self, object_size: usize) -> Descriptor {
        match self {
            Descriptor::Length(len) => Descriptor::Length(len.min(object_size)),
            Descriptor::Bitmap(bits) => {
                let words = object_size / WORD;
                if words >= BITMAP_MAX_WORDS {
                    Descriptor::Bitmap(bits)
                } else {
                    Descriptor::Bitmap(bits & ((1 << words) - 1))
                }
            }
            other => other,
        }
    }

    /// The number of bytes from the start of the object this descriptor may
    /// read, when that is known up front
    pub(crate) fn extent(&self) -> Option<usize> {
        match self {
            Descriptor::Length(len) => Some(*len),
            Descriptor::Bitmap(bits) => {
                Some((WORD_BITS - bits.leading_zeros() as usize) * WORD)
            }
            _ => None,
        }
    }
}
