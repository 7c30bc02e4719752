//! Shared-memory transport seams for `Session::accelerate`.
//!
//! Once accelerated, payload bytes bypass the socket: the writer copies them
//! into a [`ShMemChannelOut`] and announces each batch on the socket as a
//! 4-byte big-endian byte count. The peer reads the counts and asks its
//! [`ShMemChannelIn`] to deliver that many bytes to the session listener.

use collider_core::Result;

use super::SessionListener;

/// Bytes announced per notification are capped at this many
pub const BATCH_MAX_BYTES: usize = 128 * 1024;

/// Size of one batch notification on the socket
pub const NOTIFY_SIZE: usize = 4;

/// Producer side of a shared-memory channel.
pub trait ShMemChannelOut: Send {
    /// Copy `data` into shared memory, returns the bytes accepted.
    ///
    /// Fails with `TransportFailure` if the next block cannot be mapped.
    fn add_data(&mut self, data: &[u8]) -> Result<usize>;

    fn close(&mut self);
}

/// Consumer side of a shared-memory channel.
pub trait ShMemChannelIn: Send {
    /// Deliver the next `size` bytes to `listener`.
    fn handle_data(&mut self, size: u32, listener: &dyn SessionListener) -> Result<()>;

    fn close(&mut self);
}

/// Both directions of an accelerated session.
pub struct ShMem {
    pub outbound: Box<dyn ShMemChannelOut>,
    pub inbound: Box<dyn ShMemChannelIn>,
}

impl ShMem {
    pub fn new(outbound: Box<dyn ShMemChannelOut>, inbound: Box<dyn ShMemChannelIn>) -> Self {
        Self { outbound, inbound }
    }

    pub fn close(&mut self) {
        self.outbound.close();
        self.inbound.close();
    }
}

impl std::fmt::Debug for ShMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShMem").finish_non_exhaustive()
    }
}

/// Splits inbound socket bytes into batch sizes, carrying a partial count
/// over callbacks.
#[derive(Debug, Default)]
pub(crate) struct NotifyParser {
    carry: [u8; NOTIFY_SIZE],
    have: usize,
}

impl NotifyParser {
    /// Feed socket bytes, calling `f` with every complete size. Stops early
    /// and returns the error if `f` fails.
    pub(crate) fn feed(&mut self, mut data: &[u8], mut f: impl FnMut(u32) -> Result<()>) -> Result<()> {
        if self.have > 0 {
            let take = (NOTIFY_SIZE - self.have).min(data.len());
            self.carry[self.have..self.have + take].copy_from_slice(&data[..take]);
            self.have += take;
            data = &data[take..];
            if self.have < NOTIFY_SIZE {
                return Ok(());
            }
            self.have = 0;
            f(u32::from_be_bytes(self.carry))?;
        }

        let mut chunks = data.chunks_exact(NOTIFY_SIZE);
        for chunk in &mut chunks {
            let mut size = [0u8; NOTIFY_SIZE];
            size.copy_from_slice(chunk);
            f(u32::from_be_bytes(size))?;
        }
        let rest = chunks.remainder();
        self.carry[..rest.len()].copy_from_slice(rest);
        self.have = rest.len();
        Ok(())
    }
}
