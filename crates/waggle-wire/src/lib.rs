// Author: Lukas Bower
// Purpose: Provide waggle message-bus wire types and codec primitives.
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![no_std]

//! Wire framing shared by the waggle bus core and its clients: the fixed
//! 64-byte message header, the 8-byte-aligned typed record sequence, and the
//! versioned bloom filter entries used for broadcast subscriptions.

extern crate alloc;

#[cfg(test)]
extern crate std;

mod bloom;
mod codec;
mod types;

pub use bloom::{
    mask_admits, BloomFilter, BloomMask, BloomMaskError, BLOOM_DEFAULT_BYTES, BLOOM_MAX_BYTES,
};
pub use codec::{decode_message, encode_message, MessageBuilder};
pub use types::*;
