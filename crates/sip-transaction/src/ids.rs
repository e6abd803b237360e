//! Per-instance identifier generation.
//!
//! Each user agent owns one generator so that two agents in the same process
//! (tests, multi-account clients) never share random state.

use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};
use smol_str::SmolStr;

use sip_parse::BRANCH_MAGIC_COOKIE;

pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn alphanumeric(&self, len: usize) -> String {
        let mut rng = self.rng.lock();
        (&mut *rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    /// RFC 3261 magic-cookie branch identifier.
    pub fn branch(&self) -> SmolStr {
        SmolStr::new(format!("{}{}", BRANCH_MAGIC_COOKIE, self.alphanumeric(16)))
    }

    pub fn tag(&self) -> SmolStr {
        SmolStr::new(self.alphanumeric(10))
    }

    pub fn call_id(&self, host: &str) -> SmolStr {
        SmolStr::new(format!("{}@{}", self.alphanumeric(20), host))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
