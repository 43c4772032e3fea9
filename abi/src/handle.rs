//! Generation-checked arena handles.
//!
//! Every cyclic structure named in spec.md §9 (thread ↔ wait-queue,
//! phone ↔ answerbox ↔ call, region ↔ address-space ↔ backend) is expressed
//! as owned records in a typed arena, referenced by one of these handles
//! instead of a raw pointer. The generation counter catches the classic
//! arena bug where a slot is freed and reused while a stale handle is still
//! held somewhere (the teacher's raw-pointer equivalents, e.g.
//! `task_pointer_is_valid`, detect this with an out-of-band validity check
//! instead; a handle makes the check part of the type).

use core::fmt;

/// A stable index into a fixed-capacity arena, paired with a generation
/// counter bumped every time the slot is freed and reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub index: u32,
    pub generation: u32,
}

impl RawHandle {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.index == u32::MAX
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Handle(invalid)")
        } else {
            write!(f, "Handle({}#{})", self.index, self.generation)
        }
    }
}

impl Default for RawHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Declares a distinct newtype wrapper around [`RawHandle`] so that, e.g.,
/// a `ThreadId` and a `TaskId` are not interchangeable at the type level
/// even though both are arena handles under the hood.
#[macro_export]
macro_rules! define_handle {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub $crate::handle::RawHandle);

        impl $name {
            pub const INVALID: Self = Self($crate::handle::RawHandle::INVALID);

            #[inline]
            pub const fn new(index: u32, generation: u32) -> Self {
                Self($crate::handle::RawHandle::new(index, generation))
            }

            #[inline]
            pub const fn is_invalid(self) -> bool {
                self.0.is_invalid()
            }

            #[inline]
            pub const fn index(self) -> u32 {
                self.0.index
            }

            #[inline]
            pub const fn generation(self) -> u32 {
                self.0.generation
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }
    };
}
