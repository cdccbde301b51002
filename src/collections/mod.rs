mod ordered;
mod reuse_vec;

pub use ordered::OrderedSet;
pub use reuse_vec::ReuseVec;
