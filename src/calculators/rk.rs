use crate::error::{ComputingError, ComputingResult};

/// Adaptive embedded Runge-Kutta integrator (Cash-Karp 4(5) pair) used by
/// the models without a closed-form solution.
pub struct AdaptiveRk {
    pub rel_tol: f64,
    pub abs_tol: f64,
    pub max_steps: usize,
}

impl Default for AdaptiveRk {
    fn default() -> Self {
        Self {
            rel_tol: 1e-8,
            abs_tol: 1e-12,
            max_steps: 1_000_000,
        }
    }
}

// Cash-Karp tableau.
const A: [[f64; 5]; 5] = [
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0],
    [3.0 / 10.0, -9.0 / 10.0, 6.0 / 5.0, 0.0, 0.0],
    [-11.0 / 54.0, 5.0 / 2.0, -70.0 / 27.0, 35.0 / 27.0, 0.0],
    [
        1631.0 / 55296.0,
        175.0 / 512.0,
        575.0 / 13824.0,
        44275.0 / 110592.0,
        253.0 / 4096.0,
    ],
];
const B5: [f64; 6] = [
    37.0 / 378.0,
    0.0,
    250.0 / 621.0,
    125.0 / 594.0,
    0.0,
    512.0 / 1771.0,
];
const B4: [f64; 6] = [
    2825.0 / 27648.0,
    0.0,
    18575.0 / 48384.0,
    13525.0 / 55296.0,
    277.0 / 14336.0,
    1.0 / 4.0,
];

impl AdaptiveRk {
    /// Advances `y` from `t0` to `t1` in place, controlling the local error
    /// against the mixed absolute/relative tolerance.
    pub fn integrate<F>(&self, rhs: F, y: &mut [f64], t0: f64, t1: f64) -> ComputingResult<()>
    where
        F: Fn(f64, &[f64], &mut [f64]),
    {
        if t1 <= t0 {
            return Ok(());
        }
        let n = y.len();
        let mut k = vec![vec![0.0; n]; 6];
        let mut stage = vec![0.0; n];
        let mut candidate = vec![0.0; n];

        let mut t = t0;
        let mut h = (t1 - t0) / 16.0;
        let h_min = (t1 - t0) * 1e-14;

        for _ in 0..self.max_steps {
            if t >= t1 {
                return Ok(());
            }
            if h > t1 - t {
                h = t1 - t;
            }

            rhs(t, y, &mut k[0]);
            for s in 1..6 {
                let (done, rest) = k.split_at_mut(s);
                for i in 0..n {
                    let mut acc = 0.0;
                    for (j, k_j) in done.iter().enumerate() {
                        acc += A[s - 1][j] * k_j[i];
                    }
                    stage[i] = y[i] + h * acc;
                }
                let c: f64 = A[s - 1][..s].iter().sum();
                rhs(t + c * h, &stage, &mut rest[0]);
            }

            let mut error: f64 = 0.0;
            for i in 0..n {
                let mut high = 0.0;
                let mut low = 0.0;
                for s in 0..6 {
                    high += B5[s] * k[s][i];
                    low += B4[s] * k[s][i];
                }
                candidate[i] = y[i] + h * high;
                let scale = self.abs_tol + self.rel_tol * y[i].abs().max(candidate[i].abs());
                error = error.max((h * (high - low)).abs() / scale);
            }

            if error <= 1.0 {
                t += h;
                y.copy_from_slice(&candidate);
            }

            // Standard step-size controller with safety factor.
            let factor = if error > 0.0 {
                (0.9 * error.powf(-0.2)).clamp(0.2, 5.0)
            } else {
                5.0
            };
            h *= factor;
            if h < h_min {
                return Err(ComputingError::NumericalError(
                    "integration step size underflow".to_string(),
                ));
            }
        }
        Err(ComputingError::NumericalError(
            "integration did not converge within the step budget".to_string(),
        ))
    }
}
