use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// A page granularity of the 2-level x86 paging scheme.
///
/// Only [`Size4K`] and [`Size4M`] implement it; the trait is sealed.
pub trait PageSize:
    sealed::Sealed
    + Clone
    + Copy
    + Eq
    + PartialEq
    + Ord
    + PartialOrd
    + Hash
    + fmt::Display
    + fmt::Debug
{
    /// Bytes per page, a power of two.
    const SIZE: u32;
    /// `log2(SIZE)`.
    const SHIFT: u32;
    /// Low bits that select a byte within the page.
    const MASK: u32 = Self::SIZE - 1;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u32 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($label)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($label)
            }
        }
    };
}

page_size!(
    /// 4 KiB, the granularity of every page-table leaf.
    Size4K, 12, "4K"
);
page_size!(
    /// 4 MiB, the span of one page-directory entry.
    Size4M, 22, "4M"
);
