//! Thin wrapper around the systematic Reed–Solomon coder.
//!
//! Shards are the 496-byte payload regions of data chunks; parity
//! shards fill the payload of dedicated parity chunks. Any K of the
//! K + M shards recover the message. The coder works over GF(2⁸), so
//! K + M must stay below 256 — the 7-bit chunk index keeps us well
//! inside that bound.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::TransportError;

/// Compute `parity_count` parity shards over the given data shards.
///
/// All shards must have the same length ([`crate::chunk::CHUNK_ECC_SIZE`]
/// in this transport).
pub fn encode_parity(
    data_shards: &[Vec<u8>],
    parity_count: usize,
) -> Result<Vec<Vec<u8>>, TransportError> {
    let rs = ReedSolomon::new(data_shards.len(), parity_count)?;

    let shard_len = data_shards.first().map(Vec::len).unwrap_or(0);
    let mut shards = data_shards.to_vec();
    shards.resize(data_shards.len() + parity_count, vec![0u8; shard_len]);

    rs.encode(&mut shards)?;

    Ok(shards.split_off(data_shards.len()))
}

/// Recover missing data shards in place.
///
/// `shards` holds all K + M shard slots (`None` for missing ones);
/// on success every data slot `[0, data_count)` is `Some`.
pub fn reconstruct(
    shards: &mut [Option<Vec<u8>>],
    data_count: usize,
    parity_count: usize,
) -> Result<(), TransportError> {
    let rs = ReedSolomon::new(data_count, parity_count)?;
    rs.reconstruct_data(shards)?;
    Ok(())
}
