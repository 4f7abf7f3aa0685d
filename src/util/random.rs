use rand::Rng;
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness, abstracted so that tests can pin e.g. the first channel number
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn gen_u16_range(range: Range<u16>) -> u16;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_u16_range(range: Range<u16>) -> u16 {
        rand::thread_rng().gen_range(range)
    }
}
