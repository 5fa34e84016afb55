use std::hash::{Hash, Hasher};

use crate::models::BuildSpec;

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                unreachable!("blake3 digests are read with finalize")
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }
}

/// Hex digest identifying everything a build of `spec` depends on.
pub fn spec_digest(spec: &BuildSpec) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.input(spec);
    hasher.finalize().to_hex().to_string()
}
