use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2};

/// Centre attenuation of a stereo pan stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanLaw {
    /// Centre stays at unity gain.
    ZeroDb,
    /// Centre attenuated by 3 dB (constant perceived power).
    Minus3Db,
    /// Centre attenuated by 6 dB (constant amplitude sum).
    Minus6Db,
}

/// Gain curve used to spread a signal between the two channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanAlgorithm {
    Linear,
    SquareRoot,
    SinLaw,
}

impl PanAlgorithm {
    /// Raw per-channel gains before law compensation. `pan` is 0.0 full
    /// left, 0.5 centre, 1.0 full right.
    fn raw_gains(self, pan: f32) -> (f32, f32) {
        match self {
            PanAlgorithm::Linear => (1.0 - pan, pan),
            PanAlgorithm::SquareRoot => ((1.0 - pan).sqrt(), pan.sqrt()),
            PanAlgorithm::SinLaw => {
                (((1.0 - pan) * FRAC_PI_2).sin(), (pan * FRAC_PI_2).sin())
            }
        }
    }

    /// Gain the raw curve yields per channel at centre. Computed with the
    /// same expressions as `raw_gains` so the centred quotient is exactly
    /// 1.0 and a centred unity path stays bit-exact.
    fn centre_gain(self) -> f32 {
        match self {
            PanAlgorithm::Linear => 0.5,
            PanAlgorithm::SquareRoot => 0.5_f32.sqrt(),
            PanAlgorithm::SinLaw => (0.5 * FRAC_PI_2).sin(),
        }
    }
}

impl PanLaw {
    fn centre_target(self) -> f32 {
        match self {
            PanLaw::ZeroDb => 1.0,
            PanLaw::Minus3Db => FRAC_1_SQRT_2,
            PanLaw::Minus6Db => 0.5,
        }
    }
}

/// Computes the (left, right) gain multipliers for one cycle. The curve
/// comes from the algorithm; the law rescales it so the centre position
/// lands at the law's attenuation. Gains are computed once per cycle, never
/// per sample.
pub fn stereo_gains(pan: f32, law: PanLaw, algo: PanAlgorithm) -> (f32, f32) {
    let pan = pan.clamp(0.0, 1.0);
    let (l, r) = algo.raw_gains(pan);
    let centre = algo.centre_gain();
    let target = law.centre_target();
    ((l / centre) * target, (r / centre) * target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn centre_matches_law_target() {
        for algo in [
            PanAlgorithm::Linear,
            PanAlgorithm::SquareRoot,
            PanAlgorithm::SinLaw,
        ] {
            let (l, r) = stereo_gains(0.5, PanLaw::ZeroDb, algo);
            assert!(close(l, 1.0), "{algo:?} left {l}");
            assert!(close(r, 1.0), "{algo:?} right {r}");

            let (l, r) = stereo_gains(0.5, PanLaw::Minus6Db, algo);
            assert!(close(l, 0.5));
            assert!(close(r, 0.5));

            let (l, r) = stereo_gains(0.5, PanLaw::Minus3Db, algo);
            assert!(close(l, std::f32::consts::FRAC_1_SQRT_2));
            assert!(close(r, std::f32::consts::FRAC_1_SQRT_2));
        }
    }

    #[test]
    fn hard_left_silences_right() {
        for algo in [
            PanAlgorithm::Linear,
            PanAlgorithm::SquareRoot,
            PanAlgorithm::SinLaw,
        ] {
            let (_, r) = stereo_gains(0.0, PanLaw::Minus3Db, algo);
            assert!(close(r, 0.0), "{algo:?} right {r}");
        }
    }

    #[test]
    fn pan_is_symmetric() {
        for algo in [
            PanAlgorithm::Linear,
            PanAlgorithm::SquareRoot,
            PanAlgorithm::SinLaw,
        ] {
            let (l0, r0) = stereo_gains(0.2, PanLaw::Minus3Db, algo);
            let (l1, r1) = stereo_gains(0.8, PanLaw::Minus3Db, algo);
            assert!(close(l0, r1));
            assert!(close(r0, l1));
        }
    }

    #[test]
    fn out_of_range_pan_is_clamped() {
        let (l, r) = stereo_gains(1.7, PanLaw::Minus3Db, PanAlgorithm::SinLaw);
        let (l1, r1) = stereo_gains(1.0, PanLaw::Minus3Db, PanAlgorithm::SinLaw);
        assert_eq!((l, r), (l1, r1));
    }
}
