use super::error::VmeError;

/// Access to one digitizer over its optical link.
///
/// This is the seam to the vendor driver: the library never talks to
/// hardware except through this trait. Addresses are register offsets into
/// the board's VME address space; the implementation is responsible for any
/// base-address arithmetic and link handles. [`crate::sim::SimBoard`]
/// provides a hardware-free implementation.
pub trait VmeAccess: Send {
    fn write_register(&mut self, addr: u32, value: u32) -> Result<(), VmeError>;

    fn read_register(&mut self, addr: u32) -> Result<u32, VmeError>;

    /// One block-transfer cycle of at most `max_words` words. An empty
    /// vector means the board had nothing to transfer.
    fn read_blt(&mut self, max_words: usize) -> Result<Vec<u32>, VmeError>;
}

/// Builds a [`VmeAccess`] backend for one board at arm time.
pub type VmeFactory =
    Box<dyn Fn(&crate::config::BoardSpec) -> Result<Box<dyn VmeAccess>, VmeError> + Send + Sync>;
