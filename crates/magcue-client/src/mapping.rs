//! Helpers that turn a distance percentage into UI quantities.

/// Resistance shown in monitoring mode: `-1` at 0 % down to `-5` at 100 %.
///
/// Halves round toward positive infinity, so `12.5 %` maps to `-1`.
pub fn distance_to_resistance(percent: f64) -> i32 {
    let resistance = -1.0 - percent / 100.0 * 4.0;
    (resistance + 0.5).floor() as i32
}

/// Emoji opacity: `1.0` when touching, fading to `0.3` at 100 %.
pub fn distance_to_opacity(percent: f64) -> f64 {
    0.3 + (100.0 - percent) / 100.0 * 0.7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resistance_spans_minus_one_to_minus_five() {
        assert_eq!(distance_to_resistance(0.0), -1);
        assert_eq!(distance_to_resistance(50.0), -3);
        assert_eq!(distance_to_resistance(100.0), -5);
    }

    #[test]
    fn resistance_rounds_halves_up() {
        assert_eq!(distance_to_resistance(12.5), -1);
        assert_eq!(distance_to_resistance(37.5), -2);
        assert_eq!(distance_to_resistance(13.0), -2);
    }

    #[test]
    fn opacity_fades_with_distance() {
        assert!((distance_to_opacity(0.0) - 1.0).abs() < 1e-9);
        assert!((distance_to_opacity(100.0) - 0.3).abs() < 1e-9);
        assert!((distance_to_opacity(50.0) - 0.65).abs() < 1e-9);
    }
}
