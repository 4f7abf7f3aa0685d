/// Widening casts that can not lose information, spelled out so that `as` casts in the code
///  base stand out as the potentially lossy ones
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing casts for values that are bounded by construction, e.g. indexes into a table
///  whose length is capped at [u16::MAX].
///
/// NB: Implementations panic if the value is out of range after all, because that is a bug
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("value out of range - the table size limit was not enforced")
    }
}
