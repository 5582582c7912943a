//! Object identity for API-visible types.
//!
//! Every API-visible object in this crate is a cheap-`Clone` handle over an
//! `Arc`'d inner: cloning the handle retains the object, dropping it releases,
//! and moving it transfers the reference. Handle equality, ordering and
//! hashing go by the inner allocation's address, so a handle can serve as a
//! map key identifying the object itself.
//!
//! Each inner allocation is registered with the [ledger](crate::tracking)
//! under a magic tag naming its type. The tag is what survives type erasure:
//! ledger diagnostics (double free, leak reports) print it instead of a bare
//! pointer.

/// Type tag carried by every tracked object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectMagic {
    Platform,
    Device,
    Context,
    CommandQueue,
    Event,
    Program,
    Kernel,
    MemoryObject,
    Sampler,
    CommandBuffer,
    Vk,
}

impl ObjectMagic {
    pub fn name(self) -> &'static str {
        match self {
            ObjectMagic::Platform => "platform",
            ObjectMagic::Device => "device",
            ObjectMagic::Context => "context",
            ObjectMagic::CommandQueue => "command_queue",
            ObjectMagic::Event => "event",
            ObjectMagic::Program => "program",
            ObjectMagic::Kernel => "kernel",
            ObjectMagic::MemoryObject => "memory_object",
            ObjectMagic::Sampler => "sampler",
            ObjectMagic::CommandBuffer => "command_buffer",
            ObjectMagic::Vk => "vk",
        }
    }
}
