use super::Result;

/// The rank every broadcast originates from.
pub const SENDER_RANK: usize = 0;

/// A process group able to run collective operations.
///
/// Every member must issue the same collectives in the same order, a
/// collective only completes once all members have entered it.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait CollectiveTemplate {
    /// This member's rank in `0..world_size`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn sender_rank(&self) -> usize {
        SENDER_RANK
    }

    fn is_sender(&self) -> bool {
        self.rank() == self.sender_rank()
    }

    /// Copies the sender's `buf` into every other member's `buf`.
    ///
    /// # Arguments
    /// * `buf` - Read on the sender rank, overwritten on the others.
    ///
    /// # Returns
    /// A `LengthMismatch` error if the sent length differs from `buf.len()`.
    async fn broadcast(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Takes part in a broadcast while dropping its payload.
    ///
    /// # Returns
    /// The amount of bytes discarded, always zero on the sender rank.
    async fn discard_broadcast(&mut self) -> Result<usize>;

    async fn barrier(&mut self) -> Result<()>;

    /// Sums `values` element-wise across all members, leaving the total in every member.
    async fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<()>;
}
