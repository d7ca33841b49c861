//! The CRI-shaped runtime: pod sandboxes, containers and images, managed
//! through the verb set mounted under the `cri/` crosslink path.

use rand::Rng;

pub mod container;
pub mod image;
pub mod runtime;
pub mod sandbox;
pub mod service;
pub mod types;

pub use runtime::Runtime;
pub use service::{APPLICATION_PATH, CRI_PATH, mount_cri};

// Entity ids are lowercase hex of a 2^30-range random.
const ID_RANGE: u32 = 1 << 30;
const MAX_ID_DRAWS: u32 = 64;

/// Mint an id not currently in use according to `taken`. Rejection sampling
/// keeps ids non-sequential; the counter fallback bounds the loop.
pub(crate) fn mint_hex_id<F: Fn(&str) -> bool>(taken: F) -> String {
    for _ in 0..MAX_ID_DRAWS {
        let id = format!("{:x}", rand::rng().random_range(0..ID_RANGE));
        if !taken(&id) {
            return id;
        }
    }
    let mut n: u32 = 0;
    loop {
        let id = format!("{n:x}");
        if !taken(&id) {
            return id;
        }
        n = n.wrapping_add(1);
    }
}
