use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

fn standard_normal(rng: &mut StdRng) -> f32 {
    // Box-Muller; 1 - u keeps the log argument in (0, 1].
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn normal(rng: &mut StdRng, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size).map(|_| standard_normal(rng) * std_dev + mean).collect()
}

pub fn uniform(rng: &mut StdRng, size: usize, low: f32, high: f32) -> Vec<f32> {
    (0..size).map(|_| rng.gen_range(low..high)).collect()
}

pub fn xavier_uniform(rng: &mut StdRng, size: usize) -> Vec<f32> {
    let limit = (6.0 / size.max(1) as f32).sqrt();
    uniform(rng, size, -limit, limit)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InitializationMethod {
    Normal { std_dev: f32 },
    Uniform { low: f32, high: f32 },
    XavierUniform,
    Zeros,
}

impl Default for InitializationMethod {
    fn default() -> Self {
        InitializationMethod::Normal { std_dev: 0.1 }
    }
}

impl InitializationMethod {
    pub fn initialize(&self, rng: &mut StdRng, size: usize) -> Vec<f32> {
        match *self {
            InitializationMethod::Normal { std_dev } => normal(rng, size, 0.0, std_dev),
            InitializationMethod::Uniform { low, high } => uniform(rng, size, low, high),
            InitializationMethod::XavierUniform => xavier_uniform(rng, size),
            InitializationMethod::Zeros => vec![0.0; size],
        }
    }

    /// `rows × cols` factor table. Row 0 is the unknown sentinel and stays zero.
    pub fn initialize_factors(&self, rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
        let mut matrix = Array2::<f32>::zeros((rows, cols));
        for mut row in matrix.rows_mut().into_iter().skip(1) {
            let values = self.initialize(rng, cols);
            row.assign(&Array1::from(values));
        }
        matrix
    }
}
