//! Constant-hazard conversion between a window probability and other horizons.

const P_CEIL: f64 = 1.0 - 1e-9;

/// Per-minute goal rate implied by probability `p` of at least one goal in `w` minutes.
pub fn implied_rate(p: f64, w: u16) -> f64 {
    if w == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, P_CEIL);
    -(1.0 - p).ln() / f64::from(w)
}

/// Probability of at least one goal in `h` minutes given `p` over `w` minutes.
pub fn project(p: f64, w: u16, h: u16) -> f64 {
    if h == 0 {
        return 0.0;
    }
    if h == w {
        return p.clamp(0.0, 1.0);
    }
    let lambda = implied_rate(p, w);
    1.0 - (-lambda * f64::from(h)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_and_zero_horizon() {
        assert_eq!(project(0.3, 10, 10), 0.3);
        assert_eq!(project(0.3, 10, 0), 0.0);
    }

    #[test]
    fn longer_horizon_raises_probability() {
        let p10 = 0.2;
        let p35 = project(p10, 10, 35);
        assert!(p35 > p10 && p35 < 1.0);
        let back = project(p35, 35, 10);
        assert!((back - p10).abs() < 1e-9);
    }
}
