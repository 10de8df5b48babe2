//! Alternating least squares with a conjugate-gradient inner solver.
//!
//! Implicit task: confidence `c = 1 + alpha * r`, preference 1 on observed
//! pairs, `c = 1, p = 0` elsewhere. Rating task: weighted least squares over
//! observed labels only. Each epoch solves every user row with the items
//! fixed, then every item row with the users fixed.

use crate::algorithms::{CancellationToken, Trainer};
use crate::config::{AlsConfig, Solver, Task};
use crate::data::{Dataset, InteractionMatrix, Merge, UNKNOWN_INDEX};
use crate::error::{RecError, Result};
use crate::models::{FactorModel, Hyperparameters, ModelKind, Phase, TrainingReport};
use crate::utils::dot;
use crate::utils::validation::validate_als_config;
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info};

/// Normal equations for the rows of one phase, against a fixed opposite side.
struct RowSystem<'a> {
    /// `YᵀY` over the fixed side; implicit task only.
    gram: Option<DMatrix<f32>>,
    fixed: &'a [f32],
    k: usize,
    task: Task,
    alpha: f32,
}

impl<'a> RowSystem<'a> {
    fn new(fixed: &'a [f32], config: &AlsConfig) -> Self {
        let k = config.factors;
        let gram = match config.task {
            Task::Ranking => {
                let y = DMatrix::from_row_slice(fixed.len() / k, k, fixed);
                Some(y.tr_mul(&y))
            }
            Task::Rating => None,
        };
        Self {
            gram,
            fixed,
            k,
            task: config.task,
            alpha: config.alpha,
        }
    }

    fn row(&self, j: u32) -> &[f32] {
        let start = j as usize * self.k;
        &self.fixed[start..start + self.k]
    }

    /// `(a, b)`: weight of `y yᵀ` in the matrix and of `y` in the right-hand side.
    fn weights(&self, value: f32) -> (f32, f32) {
        match self.task {
            Task::Ranking => {
                let confidence = 1.0 + self.alpha * value;
                (confidence - 1.0, confidence)
            }
            Task::Rating => (1.0, value),
        }
    }

    fn rhs(&self, cols: &[u32], values: &[f32]) -> DVector<f32> {
        let mut b = DVector::zeros(self.k);
        for (&j, &value) in cols.iter().zip(values) {
            let (_, weight) = self.weights(value);
            for (o, y) in b.iter_mut().zip(self.row(j)) {
                *o += weight * y;
            }
        }
        b
    }

    /// `A v` without materializing `A`.
    fn apply(&self, v: &DVector<f32>, cols: &[u32], values: &[f32], lambda: f32) -> DVector<f32> {
        let mut out = match &self.gram {
            Some(gram) => gram * v,
            None => DVector::zeros(self.k),
        };
        out.axpy(lambda, v, 1.0);
        for (&j, &value) in cols.iter().zip(values) {
            let (weight, _) = self.weights(value);
            let y = self.row(j);
            let w = weight * dot(y, v.as_slice());
            for (o, yv) in out.iter_mut().zip(y) {
                *o += w * yv;
            }
        }
        out
    }

    fn matrix(&self, cols: &[u32], values: &[f32], lambda: f32) -> DMatrix<f32> {
        let mut a = self.gram.clone().unwrap_or_else(|| DMatrix::zeros(self.k, self.k));
        for d in 0..self.k {
            a[(d, d)] += lambda;
        }
        for (&j, &value) in cols.iter().zip(values) {
            let (weight, _) = self.weights(value);
            let y = DVector::from_column_slice(self.row(j));
            a.ger(weight, &y, &y, 1.0);
        }
        a
    }
}

pub struct AlsTrainer {
    config: AlsConfig,
    model: Option<FactorModel>,
}

impl AlsTrainer {
    pub fn new(config: AlsConfig) -> Self {
        Self { config, model: None }
    }

    pub fn config(&self) -> &AlsConfig {
        &self.config
    }

    fn lambda_for(&self, observations: usize) -> f32 {
        if self.config.scale_regularization {
            self.config.regularization * observations.max(1) as f32
        } else {
            self.config.regularization
        }
    }

    fn conjugate_gradient(&self, system: &RowSystem, x: &mut [f32], cols: &[u32], values: &[f32], lambda: f32) {
        let mut xv = DVector::from_column_slice(x);
        let b = system.rhs(cols, values);
        let mut r = b - system.apply(&xv, cols, values, lambda);
        let mut p = r.clone();
        let mut rs_old = r.dot(&r);

        for _ in 0..self.config.cg_steps {
            if rs_old < self.config.cg_tolerance {
                break;
            }
            let ap = system.apply(&p, cols, values, lambda);
            let pap = p.dot(&ap);
            // non-finite values must reach x so the phase check sees them
            if pap == 0.0 {
                break;
            }
            let step = rs_old / pap;
            xv.axpy(step, &p, 1.0);
            r.axpy(-step, &ap, 1.0);
            let rs_new = r.dot(&r);
            if rs_new < self.config.cg_tolerance {
                break;
            }
            p = &r + &p * (rs_new / rs_old);
            rs_old = rs_new;
        }
        x.copy_from_slice(xv.as_slice());
    }

    fn cholesky(&self, system: &RowSystem, x: &mut [f32], cols: &[u32], values: &[f32], lambda: f32) -> bool {
        let a = system.matrix(cols, values, lambda);
        let b = system.rhs(cols, values);
        match a.cholesky() {
            Some(factor) => {
                x.copy_from_slice(factor.solve(&b).as_slice());
                true
            }
            None => false,
        }
    }

    /// Solves every non-sentinel row of `target` in parallel; each task owns
    /// exactly one row slice.
    fn solve_phase(&self, target: &mut [f32], fixed: &[f32], matrix: &InteractionMatrix, epoch: usize, phase: Phase) -> Result<()> {
        let k = self.config.factors;
        let system = RowSystem::new(fixed, &self.config);

        target
            .par_chunks_mut(k)
            .enumerate()
            .try_for_each(|(row, x)| {
                if row == UNKNOWN_INDEX as usize {
                    return Ok(());
                }
                let (cols, values) = matrix.row(row);
                let lambda = self.lambda_for(cols.len());
                match self.config.solver {
                    Solver::ConjugateGradient => {
                        self.conjugate_gradient(&system, x, cols, values, lambda);
                        Ok(())
                    }
                    Solver::Cholesky => {
                        if cols.is_empty() && system.gram.is_none() {
                            x.iter_mut().for_each(|v| *v = 0.0);
                            return Ok(());
                        }
                        if self.cholesky(&system, x, cols, values, lambda) {
                            Ok(())
                        } else {
                            Err(RecError::divergence(
                                epoch,
                                phase.to_string(),
                                format!("row {} system is not positive definite", row),
                            ))
                        }
                    }
                }
            })?;

        if let Some(bad) = target.chunks(k).position(|x| x.iter().any(|v| !v.is_finite())) {
            return Err(RecError::divergence(
                epoch,
                phase.to_string(),
                format!("row {} has non-finite factors", bad),
            ));
        }
        Ok(())
    }

    /// Weighted reconstruction loss plus the regularization penalty.
    pub(crate) fn loss(&self, users: &[f32], items: &[f32], by_user: &InteractionMatrix, by_item: &InteractionMatrix) -> f64 {
        let k = self.config.factors;
        let system = RowSystem::new(items, &self.config);

        let data: f64 = users
            .par_chunks(k)
            .enumerate()
            .map(|(u, x)| {
                let (cols, values) = by_user.row(u);
                let xv = DVector::from_column_slice(x);
                let mut total = match &system.gram {
                    Some(gram) => xv.dot(&(gram * &xv)) as f64,
                    None => 0.0,
                };
                for (&j, &value) in cols.iter().zip(values) {
                    let s = dot(x, system.row(j)) as f64;
                    match self.config.task {
                        Task::Ranking => {
                            let c = 1.0 + self.config.alpha as f64 * value as f64;
                            total += c * (1.0 - s).powi(2) - s * s;
                        }
                        Task::Rating => total += (value as f64 - s).powi(2),
                    }
                }
                total
            })
            .sum();

        let penalty = |table: &[f32], matrix: &InteractionMatrix| -> f64 {
            table
                .chunks(k)
                .enumerate()
                .map(|(row, x)| self.lambda_for(matrix.row_len(row)) as f64 * dot(x, x) as f64)
                .sum()
        };

        data + penalty(users, by_user) + penalty(items, by_item)
    }
}

impl Trainer for AlsTrainer {
    fn fit(&mut self, dataset: &Dataset, cancel: &CancellationToken) -> Result<TrainingReport> {
        validate_als_config(&self.config)?;
        let k = self.config.factors;
        let merge = match self.config.task {
            Task::Ranking => Merge::Sum,
            Task::Rating => Merge::Mean,
        };
        let by_user = InteractionMatrix::user_items(dataset, merge);
        let by_item = by_user.transpose();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut users = self.config.init.initialize_factors(&mut rng, by_user.n_rows(), k).into_raw_vec();
        let mut items = self.config.init.initialize_factors(&mut rng, by_user.n_cols(), k).into_raw_vec();

        info!(
            "Fitting ALS: {} users, {} items, {} interactions, k={}, solver {:?}",
            by_user.n_rows() - 1,
            by_user.n_cols() - 1,
            by_user.nnz(),
            k,
            self.config.solver
        );

        let mut report = TrainingReport::start();
        let mut previous: Option<f64> = None;

        for epoch in 1..=self.config.epochs {
            if cancel.is_cancelled() {
                info!("ALS cancelled before epoch {}", epoch);
                report.cancelled = true;
                break;
            }

            self.solve_phase(&mut users, &items, &by_user, epoch, Phase::Users)?;
            let loss = self.loss(&users, &items, &by_user, &by_item);
            debug!("epoch {} {}: loss {:.6}", epoch, Phase::Users, loss);
            report.record(epoch, Phase::Users, loss);

            self.solve_phase(&mut items, &users, &by_item, epoch, Phase::Items)?;
            let loss = self.loss(&users, &items, &by_user, &by_item);
            debug!("epoch {} {}: loss {:.6}", epoch, Phase::Items, loss);
            report.record(epoch, Phase::Items, loss);

            report.epochs_completed = epoch;
            info!("ALS epoch {}/{}: loss {:.6}", epoch, self.config.epochs, loss);

            if let (Some(tolerance), Some(prev)) = (self.config.convergence_tolerance, previous) {
                let change = (prev - loss).abs() / prev.abs().max(f64::EPSILON);
                if change < tolerance {
                    info!("ALS converged after {} epochs (relative change {:.3e})", epoch, change);
                    report.converged = true;
                    break;
                }
            }
            previous = Some(loss);
        }

        let to_array = |rows: usize, data: Vec<f32>| {
            Array2::from_shape_vec((rows, k), data).map_err(|e| RecError::Artifact(e.to_string()))
        };
        let model = FactorModel::new(
            ModelKind::Als,
            to_array(by_user.n_rows(), users)?,
            to_array(by_user.n_cols(), items)?,
        );
        self.model = Some(model);
        Ok(report.finish())
    }

    fn model(&self) -> Option<&FactorModel> {
        self.model.as_ref()
    }

    fn take_model(&mut self) -> Option<FactorModel> {
        self.model.take()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            kind: ModelKind::Als,
            factors: self.config.factors,
            regularization: self.config.regularization,
            epochs: self.config.epochs,
            learning_rate: None,
            alpha: match self.config.task {
                Task::Ranking => Some(self.config.alpha),
                Task::Rating => None,
            },
            seed: self.config.seed,
        }
    }
}
