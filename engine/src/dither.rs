use rand::SeedableRng;
use rand::rngs::SmallRng;

/// TPDF dither applied to interleaved float samples before quantization.
///
/// Noise amplitude is one least-significant bit of the target depth. The
/// generator is seeded deterministically so a bounce of the same material
/// renders the same file every time.
pub struct Ditherer {
    amp: f32,
    rng: SmallRng,
}

const DITHER_SEED: u64 = 0x5eed_d17e;

impl Ditherer {
    pub fn new(bits: u32) -> Self {
        Self {
            amp: 1.0 / (1u32 << (bits - 1)) as f32,
            rng: SmallRng::seed_from_u64(DITHER_SEED),
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        use rand::Rng;
        for sample in samples {
            let noise: f32 = self.rng.random::<f32>() - self.rng.random::<f32>();
            *sample += self.amp * noise;
        }
    }
}
