use serde::{Deserialize, Serialize};

/// Per-epoch learning rate policy for SGD training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    /// `lr * decay_rate^epoch`
    ExponentialDecay { decay_rate: f32 },
    /// `lr * factor^(epoch / step_size)`
    StepDecay { step_size: usize, factor: f32 },
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        LearningRateSchedule::Constant
    }
}

impl LearningRateSchedule {
    /// Learning rate for a zero-based epoch.
    pub fn rate_at(&self, base: f32, epoch: usize) -> f32 {
        match *self {
            LearningRateSchedule::Constant => base,
            LearningRateSchedule::ExponentialDecay { decay_rate } => base * decay_rate.powi(epoch as i32),
            LearningRateSchedule::StepDecay { step_size, factor } => {
                let steps = epoch / step_size.max(1);
                base * factor.powi(steps as i32)
            }
        }
    }
}

/// Plain SGD step with L2 weight decay: `p += lr * (g - decay * p)`,
/// where `g` points downhill.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    pub learning_rate: f32,
    pub weight_decay: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
        }
    }

    pub fn step(&self, params: &mut [f32], gradient: &[f32]) {
        for (p, g) in params.iter_mut().zip(gradient) {
            *p += self.learning_rate * (g - self.weight_decay * *p);
        }
    }

    pub fn step_scalar(&self, param: &mut f32, gradient: f32) {
        *param += self.learning_rate * (gradient - self.weight_decay * *param);
    }
}

/// Clips over-norm gradients and trips after `patience` consecutive clipped
/// updates.
#[derive(Debug, Clone)]
pub struct GradientGuard {
    max_norm: Option<f32>,
    patience: usize,
    consecutive: usize,
    clipped: u64,
}

impl GradientGuard {
    pub fn new(max_norm: Option<f32>, patience: usize) -> Self {
        Self {
            max_norm,
            patience,
            consecutive: 0,
            clipped: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 0)
    }

    /// Rescales the gradients in place when their joint norm exceeds the
    /// limit. Returns whether clipping happened.
    pub fn clip(&mut self, gradients: &mut [&mut [f32]]) -> bool {
        let Some(max_norm) = self.max_norm else {
            return false;
        };
        let norm = gradients
            .iter()
            .flat_map(|g| g.iter())
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        if norm <= max_norm {
            self.consecutive = 0;
            return false;
        }
        let scale = max_norm / norm;
        for gradient in gradients.iter_mut() {
            gradient.iter_mut().for_each(|v| *v *= scale);
        }
        self.consecutive += 1;
        self.clipped += 1;
        true
    }

    /// True once `patience` consecutive updates have been clipped.
    pub fn tripped(&self) -> bool {
        self.max_norm.is_some() && self.patience > 0 && self.consecutive >= self.patience
    }

    pub fn clipped_total(&self) -> u64 {
        self.clipped
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let s = LearningRateSchedule::Constant;
        assert_eq!(s.rate_at(0.01, 0), 0.01);
        assert_eq!(s.rate_at(0.01, 50), 0.01);
    }

    #[test]
    fn test_exponential_decay() {
        let s = LearningRateSchedule::ExponentialDecay { decay_rate: 0.5 };
        assert!((s.rate_at(0.8, 0) - 0.8).abs() < 1e-7);
        assert!((s.rate_at(0.8, 3) - 0.1).abs() < 1e-7);
    }

    #[test]
    fn test_step_decay() {
        let s = LearningRateSchedule::StepDecay {
            step_size: 2,
            factor: 0.1,
        };
        assert!((s.rate_at(1.0, 1) - 1.0).abs() < 1e-7);
        assert!((s.rate_at(1.0, 2) - 0.1).abs() < 1e-7);
        assert!((s.rate_at(1.0, 5) - 0.01).abs() < 1e-7);
    }

    #[test]
    fn test_sgd_step_with_decay() {
        let sgd = Sgd::new(0.1, 0.5);
        let mut params = [1.0f32, -2.0];
        sgd.step(&mut params, &[1.0, 0.0]);
        assert!((params[0] - 1.05).abs() < 1e-6);
        assert!((params[1] + 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_guard_clips_and_trips() {
        let mut guard = GradientGuard::new(Some(1.0), 2);
        let mut a = [3.0f32, 0.0];
        let mut b = [4.0f32];
        assert!(guard.clip(&mut [&mut a, &mut b]));
        assert!((a[0] - 0.6).abs() < 1e-6);
        assert!((b[0] - 0.8).abs() < 1e-6);
        assert!(!guard.tripped());

        let mut small = [0.1f32];
        assert!(!guard.clip(&mut [&mut small]));
        assert_eq!(guard.consecutive(), 0);

        let mut big = [10.0f32];
        guard.clip(&mut [&mut big]);
        let mut big = [10.0f32];
        guard.clip(&mut [&mut big]);
        assert!(guard.tripped());
        assert_eq!(guard.clipped_total(), 3);
    }

    #[test]
    fn test_disabled_guard_never_clips() {
        let mut guard = GradientGuard::disabled();
        let mut g = [1e6f32];
        assert!(!guard.clip(&mut [&mut g]));
        assert_eq!(g[0], 1e6);
        assert!(!guard.tripped());
    }
}
