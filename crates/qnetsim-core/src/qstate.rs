//! Werner-state bookkeeping carried by in-flight requests.
//!
//! The simulator does not track density matrices. Every entangled pair is a
//! Werner state, fully described by its Werner parameter `a`; depolarizing
//! decoherence decays `a` exponentially and entanglement swapping multiplies
//! the parameters of the two consumed pairs. Fidelity is recorded as `a`
//! itself, matching what the metric stream reports downstream.

/// A Werner state, parameterized by its Werner parameter `a` ∈ [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WernerState {
    pub a: f64,
}

impl WernerState {
    /// Build a Werner state from its fidelity `F` (`a = (4F − 1) / 3`).
    pub fn with_fidelity(fidelity: f64) -> Self {
        WernerState {
            a: (4.0 * fidelity - 1.0) / 3.0,
        }
    }

    /// Fidelity with the target Bell state (`F = (3a + 1) / 4`).
    pub fn fidelity(&self) -> f64 {
        (3.0 * self.a + 1.0) / 4.0
    }
}

/// Apply depolarizing decoherence at `rate` (1/s) for `seconds`.
pub fn depolarize_rate(state: WernerState, rate: f64, seconds: f64) -> WernerState {
    WernerState {
        a: state.a * (-rate * seconds).exp(),
    }
}

/// Entanglement swapping of two Werner pairs into one longer-range pair.
///
/// `eta` is the Bell-measurement efficiency and `p2` the two-qubit gate
/// quality; ideal operations pass 1 for both.
pub fn swap(left: WernerState, right: WernerState, eta: f64, p2: f64) -> WernerState {
    WernerState {
        a: eta * p2 * left.a * right.a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fidelity_roundtrip() {
        let s = WernerState::with_fidelity(1.0);
        assert!((s.a - 1.0).abs() < 1e-12);
        assert!((s.fidelity() - 1.0).abs() < 1e-12);

        let s = WernerState::with_fidelity(0.25);
        assert!((s.a - 0.0).abs() < 1e-12);
    }

    #[test]
    fn depolarize_decays_exponentially() {
        let s = WernerState::with_fidelity(1.0);
        let d = depolarize_rate(s, 2.0, 0.5);
        assert!((d.a - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn depolarize_zero_time_is_identity() {
        let s = WernerState { a: 0.7 };
        assert_eq!(depolarize_rate(s, 100.0, 0.0), s);
    }

    #[test]
    fn swap_multiplies_parameters() {
        let l = WernerState { a: 0.9 };
        let r = WernerState { a: 0.8 };
        let out = swap(l, r, 1.0, 1.0);
        assert!((out.a - 0.72).abs() < 1e-12);
    }

    #[test]
    fn swap_with_perfect_pair_is_identity() {
        let l = WernerState { a: 0.6 };
        let out = swap(l, WernerState::with_fidelity(1.0), 1.0, 1.0);
        assert!((out.a - 0.6).abs() < 1e-12);
    }
}
