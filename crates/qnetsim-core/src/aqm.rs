//! Proportional–integral AQM controller.
//!
//! Discrete-time PI difference equation on the sampled queue length `q`:
//!
//! ```text
//! p_new = α·(q − q_ref) − β·(q_old − q_ref) + p_old
//! ```
//!
//! `p_new` is the ECN marking probability. The α/β gains and the sampling
//! period are derived from the worst-case RTT, the channel capacity and the
//! minimum flow count; derivation failures are stability faults and abort the
//! run.

use crate::config::AqmParams;
use crate::error::SimError;

/// PI controller sampling one direction's queue at a fixed period.
#[derive(Debug, Clone)]
pub struct PIController {
    alpha: f64,
    beta: f64,
    q_ref: f64,
    q_old: f64,
    p_old: f64,
    p: f64,
}

impl PIController {
    /// Derive the controller gains from `params`.
    ///
    /// Returns the controller together with its sampling period `T` in
    /// seconds; the caller re-schedules itself at that period.
    pub fn new(params: &AqmParams) -> Result<(Self, f64), SimError> {
        let AqmParams {
            r_plus,
            c,
            n_minus,
            q_ref,
        } = *params;

        let omega_g = 2.0 * n_minus / (r_plus * r_plus * c);
        if omega_g >= 0.05 / r_plus {
            return Err(SimError::AqmUnstable(format!(
                "omega_g = {omega_g} >= 0.05/R+ = {}",
                0.05 / r_plus
            )));
        }
        let p_queue = 1.0 / r_plus;
        let t = 1.0 / (omega_g * 100.0);

        // |j·omega_g/p_queue + 1| / ((R+·C)^3 / (2·N−)^2), then scaled back
        // onto the sampling grid
        let k_pi = f64::hypot(omega_g / p_queue, 1.0)
            / ((r_plus * c).powi(3) / (2.0 * n_minus).powi(2));
        let k_pi = k_pi * omega_g * 100.0;

        if 1.0 - omega_g * t <= 0.0 {
            return Err(SimError::AqmUnstable(format!(
                "1 - omega_g*T = {} <= 0",
                1.0 - omega_g * t
            )));
        }
        let alpha = k_pi / omega_g;
        let beta = alpha * (1.0 - omega_g * t);

        log::debug!(
            "PI controller parameters: alpha={alpha}, beta={beta}, q_ref={q_ref}, \
             K_PI={k_pi}, omega_g={omega_g}, T={t}"
        );

        Ok((
            PIController {
                alpha,
                beta,
                q_ref,
                q_old: 0.0,
                p_old: 0.0,
                p: 0.0,
            },
            t,
        ))
    }

    /// Feed one queue-length sample.
    pub fn update(&mut self, q: f64) {
        self.p = self.alpha * (q - self.q_ref) - self.beta * (self.q_old - self.q_ref) + self.p_old;
        self.q_old = q;
        self.p_old = self.p;
    }

    /// Current ECN marking probability.
    pub fn marking_probability(&self) -> f64 {
        self.p
    }
}
