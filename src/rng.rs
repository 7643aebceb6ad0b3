//! `RomuDuoJr` pseudo random number generator implementation seeded by Lehmer64
//!
//! Backs the guest visible `rdrand` so a given seed replays identically.
//!
//! ```test
//! Reference: https://www.romu-random.org/code.c
//!
//! //===== RomuDuoJr ==================================================================
//! //
//! // The fastest generator using 64-bit arith., but not suited for huge jobs.
//! // Est. capacity = 2^51 bytes. Register pressure = 4. State size = 128 bits.
//!
//! uint64_t xState, yState;  // set to nonzero seed
//!
//! uint64_t romuDuoJr_random () {
//!    uint64_t xp = xState;
//!    xState = 15241094284759029579u * yState;
//!    yState = yState - xp;  yState = ROTL(yState,27);
//!    return xp;
//! }
//! ```

/// `RomuDuoJr` pseudo random number generator
#[derive(Debug, Clone)]
pub struct Rng {
    /// Internal x state
    xstate: u64,

    /// Internal y state
    ystate: u64,
}

impl rand::RngCore for Rng {
    #[allow(clippy::cast_possible_truncation)]
    fn next_u32(&mut self) -> u32 {
        self.next() as u32
    }
    fn next_u64(&mut self) -> u64 {
        self.next()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl Rng {
    /// Create an [`Rng`] seeded with the given seed value
    #[must_use]
    pub fn from_seed(seed: u64) -> Rng {
        // Lehmer64 with a zero state only ever produces zero
        let mut lehmer64 = Lehmer64::from_seed(u128::from(seed) << 1 | 1);
        let mut res = Rng {
            xstate: lehmer64.rand_u64(),
            ystate: lehmer64.rand_u64(),
        };

        // Cycle through to create some chaos
        for _ in 0..92 {
            let _ = res.next();
        }

        res
    }

    /// Get the next random number
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let xp = self.xstate;
        self.xstate = 15_241_094_284_759_029_579_u64.wrapping_mul(self.ystate);
        self.ystate = self.ystate.wrapping_sub(xp);
        self.ystate = self.ystate.rotate_left(27);
        xp
    }
}

/// Lehmer64 generator used to expand a seed into [`Rng`] state
struct Lehmer64 {
    /// Internal state
    value: u128,
}

impl Lehmer64 {
    /// Create an [`Lehmer64`] seeded with the given seed value
    fn from_seed(seed: u128) -> Lehmer64 {
        Lehmer64 { value: seed }
    }

    /// Get the next random number
    #[allow(clippy::cast_possible_truncation)]
    fn rand_u64(&mut self) -> u64 {
        self.value = self.value.wrapping_mul(0xda94_2042_e4dd_58b5);
        (self.value >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng as _;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Rng::from_seed(0x1337);
        let mut b = Rng::from_seed(0x1337);
        for _ in 0..100 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Rng::from_seed(1);
        let mut b = Rng::from_seed(2);
        let a: Vec<u64> = (0..8).map(|_| a.next()).collect();
        let b: Vec<u64> = (0..8).map(|_| b.next()).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn zero_seed_is_not_degenerate() {
        let mut rng = Rng::from_seed(0);
        let vals: Vec<u64> = (0..4).map(|_| rng.next()).collect();
        assert!(vals.iter().any(|val| *val != 0));
    }

    #[test]
    fn usable_as_rand_rng() {
        let mut rng = Rng::from_seed(5);
        let val: u8 = rng.gen_range(0..10);
        assert!(val < 10);
    }
}
