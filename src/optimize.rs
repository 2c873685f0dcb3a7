//! Derivative-free minimization (Nelder-Mead simplex) used for model fitting

/// Result of a minimization
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    pub point: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub struct NelderMead {
    max_iter: usize,
    tolerance: f64,
    initial_step: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            tolerance: 1e-10,
            initial_step: 0.5,
        }
    }
}

impl NelderMead {
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn initial_step(mut self, initial_step: f64) -> Self {
        self.initial_step = initial_step;
        self
    }

    /// Minimize `f` starting from `start`. Non-finite objective values are
    /// treated as +infinity, so `f` can encode constraints that way.
    pub fn minimize<F: Fn(&[f64]) -> f64>(&self, f: F, start: &[f64]) -> Minimum {
        let eval = |x: &[f64]| {
            let v = f(x);
            if v.is_finite() {
                v
            } else {
                f64::INFINITY
            }
        };

        let n = start.len();
        let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
        simplex.push((start.to_vec(), eval(start)));
        for i in 0..n {
            let mut x = start.to_vec();
            let step = if x[i] != 0.0 {
                self.initial_step * x[i].abs()
            } else {
                self.initial_step
            };
            x[i] += step;
            let v = eval(&x);
            simplex.push((x, v));
        }

        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.max_iter {
            iterations += 1;
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

            let best = simplex[0].1;
            let worst = simplex[n].1;
            if best.is_finite()
                && (worst - best).abs() <= self.tolerance * (best.abs() + worst.abs() + 1e-12)
            {
                converged = true;
                break;
            }

            // Centroid of all but the worst vertex
            let mut centroid = vec![0.0; n];
            for (x, _) in &simplex[..n] {
                for (c, xi) in centroid.iter_mut().zip(x) {
                    *c += xi / n as f64;
                }
            }

            let along = |t: f64| -> Vec<f64> {
                centroid
                    .iter()
                    .zip(&simplex[n].0)
                    .map(|(c, w)| c + t * (w - c))
                    .collect()
            };

            let reflected = along(-1.0);
            let fr = eval(&reflected);

            if fr < simplex[0].1 {
                let expanded = along(-2.0);
                let fe = eval(&expanded);
                simplex[n] = if fe < fr {
                    (expanded, fe)
                } else {
                    (reflected, fr)
                };
                continue;
            }

            if fr < simplex[n - 1].1 {
                simplex[n] = (reflected, fr);
                continue;
            }

            let (contracted, fc) = if fr < simplex[n].1 {
                let x = along(-0.5);
                let v = eval(&x);
                (x, v)
            } else {
                let x = along(0.5);
                let v = eval(&x);
                (x, v)
            };

            if fc < simplex[n].1.min(fr) {
                simplex[n] = (contracted, fc);
                continue;
            }

            // Shrink towards the best vertex
            let best_point = simplex[0].0.clone();
            for vertex in simplex.iter_mut().skip(1) {
                let x: Vec<f64> = best_point
                    .iter()
                    .zip(&vertex.0)
                    .map(|(b, v)| b + 0.5 * (v - b))
                    .collect();
                let v = eval(&x);
                *vertex = (x, v);
            }
        }

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (point, value) = simplex.swap_remove(0);
        Minimum {
            point,
            value,
            iterations,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic() {
        let min = NelderMead::default().minimize(
            |x| (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.0).powi(2) + 5.0,
            &[0.0, 0.0],
        );
        assert!(min.converged);
        assert!((min.point[0] - 3.0).abs() < 1e-3);
        assert!((min.point[1] + 1.0).abs() < 1e-3);
        assert!((min.value - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_rosenbrock() {
        let min = NelderMead::default()
            .max_iter(5000)
            .tolerance(1e-14)
            .minimize(
                |x| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2),
                &[-1.2, 1.0],
            );
        assert!((min.point[0] - 1.0).abs() < 1e-2);
        assert!((min.point[1] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_infeasible_region_is_avoided() {
        // Objective undefined for x < 0
        let min = NelderMead::default().minimize(
            |x| if x[0] < 0.0 { f64::NAN } else { (x[0] - 0.5).powi(2) },
            &[2.0],
        );
        assert!(min.point[0] >= 0.0);
        assert!((min.point[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_iteration_cap() {
        let min = NelderMead::default()
            .max_iter(3)
            .minimize(|x| x[0].powi(2) + x[1].powi(2), &[10.0, 10.0]);
        assert_eq!(min.iterations, 3);
        assert!(!min.converged);
    }
}
