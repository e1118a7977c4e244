// src/estimator.rs

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::info;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_linalg::c64;
use serde::{Deserialize, Serialize};

use crate::context::{check_contexts, stack_lookback, trailing_lookback};
use crate::error::{KoopmanError, Result};
use crate::features::{covariance, FeatureMap};
use crate::predict::predict;
use crate::regression::{Projection, RegressionConfig};
use crate::spectral::{
    estimator_eig, estimator_modes, evaluate_eigenfunction, svdvals, to_complex, ModeDecomposition,
};

/// Everything a fitted regressor needs to predict and analyze.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct FittedState {
    lookback_len: usize,
    projection: Projection,
    cov_x: Array2<f64>,
    cov_xy: Array2<f64>,
    /// Features of the training lookback windows, (n_train, d).
    phi_x: Array2<f64>,
    /// First lookforward snapshot of each training window, (n_train, n_features).
    lookforward_states: Array2<f64>,
}

impl FittedState {
    fn validate(&self) -> Result<()> {
        let dim = self.cov_x.nrows();
        let n_train = self.phi_x.nrows();
        let consistent = self.cov_x.ncols() == dim
            && self.cov_xy.dim() == (dim, dim)
            && self.projection.dim() == dim
            && self.projection.numerical_rank <= self.projection.rank()
            && self.phi_x.ncols() == dim
            && self.lookforward_states.nrows() == n_train
            && n_train > 0
            && self.lookback_len >= 1;
        if !consistent {
            return Err(KoopmanError::Persistence(format!(
                "inconsistent fitted state: covariance {:?}, cross-covariance {:?}, \
                 projection {:?}, training features {:?}, lookforward states {:?}",
                self.cov_x.dim(),
                self.cov_xy.dim(),
                self.projection.matrix.dim(),
                self.phi_x.dim(),
                self.lookforward_states.dim()
            )));
        }
        Ok(())
    }
}

/// Serialized form of a regressor. The feature map is supplied again on load.
#[derive(Serialize, Deserialize)]
struct SavedModel {
    config: RegressionConfig,
    state: Option<FittedState>,
}

/// Eigenvalues of a fitted regressor and, on request, its eigenfunctions
/// evaluated at new context windows (n_windows, numerical_rank).
#[derive(Clone, Debug)]
pub struct EigenfunctionValues {
    pub eigenvalues: Array1<c64>,
    pub left: Option<Array2<c64>>,
    pub right: Option<Array2<c64>>,
}

/// Koopman operator regressor on an explicit (primal) feature map.
///
/// Fitting lifts the lookback windows of the training contexts and their
/// one-step-ahead shifts with the feature map, estimates the covariances and
/// fits a projection with the configured strategy.
pub struct PrimalRegressor<F: FeatureMap> {
    config: RegressionConfig,
    feature_map: F,
    state: Option<FittedState>,
}

impl<F: FeatureMap> PrimalRegressor<F> {
    pub fn new(config: RegressionConfig, feature_map: F) -> Self {
        PrimalRegressor { config, feature_map, state: None }
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    pub fn feature_map(&self) -> &F {
        &self.feature_map
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Lookback length seen at fit time.
    pub fn lookback_len(&self) -> Option<usize> {
        self.state.as_ref().map(|state| state.lookback_len)
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.state.as_ref().map(|state| &state.projection)
    }

    fn fitted(&self) -> Result<&FittedState> {
        self.state.as_ref().ok_or_else(|| {
            KoopmanError::InvalidContext("the regressor has not been fitted".to_string())
        })
    }

    fn lift(&self, contexts: ArrayView3<f64>, lookback_len: usize) -> Result<Array2<f64>> {
        self.feature_map.map(trailing_lookback(contexts, lookback_len)?)
    }

    /// Fits the regressor on context windows (n_windows, context_len, features).
    ///
    /// `lookback_len` defaults to `context_len - 1`.
    pub fn fit(
        &mut self,
        contexts: ArrayView3<f64>,
        lookback_len: Option<usize>,
    ) -> Result<&mut Self> {
        let context_len = contexts.len_of(Axis(1));
        let lookback_len = lookback_len.unwrap_or(context_len.saturating_sub(1));
        check_contexts(contexts.into_dyn(), Some(lookback_len), false)?;
        info!(
            "Fitting primal regressor on {} context windows (context length {}, lookback {}).",
            contexts.len_of(Axis(0)),
            context_len,
            lookback_len
        );
        let start_time = std::time::Instant::now();

        let stacked = stack_lookback(contexts, Some(lookback_len))?;
        let phi_x = self.feature_map.map(stacked.index_axis(Axis(1), 0))?;
        let phi_y = self.feature_map.map(stacked.index_axis(Axis(1), 1))?;
        if phi_x.ncols() != phi_y.ncols() {
            return Err(KoopmanError::DimensionMismatch(format!(
                "feature map returned {} input and {} output features",
                phi_x.ncols(),
                phi_y.ncols()
            )));
        }
        let cov_x = covariance(phi_x.view(), phi_x.view())?;
        let cov_xy = covariance(phi_x.view(), phi_y.view())?;
        let projection = self.config.fit(cov_x.view(), cov_xy.view())?;
        let lookforward_states = contexts.index_axis(Axis(1), lookback_len).to_owned();

        self.state = Some(FittedState {
            lookback_len,
            projection,
            cov_x,
            cov_xy,
            phi_x,
            lookforward_states,
        });
        info!("Primal regressor fitted in {:?}", start_time.elapsed());
        Ok(self)
    }

    /// Predicts `t` steps ahead of the last `lookback_len` snapshots of each
    /// context window.
    ///
    /// `observables` is the observable evaluated at the training lookforward
    /// states (n_train, obs_dim); `None` predicts the state itself.
    pub fn predict(
        &self,
        contexts: ArrayView3<f64>,
        t: usize,
        observables: Option<ArrayView2<f64>>,
    ) -> Result<Array2<f64>> {
        let state = self.fitted()?;
        let phi_init = self.lift(contexts, state.lookback_len)?;
        let observables = observables
            .map(|o| o.reborrow())
            .unwrap_or_else(|| state.lookforward_states.view());
        predict(
            t,
            state.projection.view(),
            state.cov_xy.view(),
            phi_init.view(),
            state.phi_x.view(),
            observables,
        )
    }

    /// Eigenvalues of the fitted operator; left and right eigenfunctions are
    /// evaluated on the given context windows when provided.
    pub fn eig(
        &self,
        eval_left_on: Option<ArrayView3<f64>>,
        eval_right_on: Option<ArrayView3<f64>>,
    ) -> Result<EigenfunctionValues> {
        let state = self.fitted()?;
        let decomposition = estimator_eig(state.projection.active_view(), state.cov_xy.view())?;
        let left = match eval_left_on {
            Some(contexts) => {
                let phi = self.lift(contexts, state.lookback_len)?;
                Some(evaluate_eigenfunction(phi.view(), decomposition.left.view())?)
            }
            None => None,
        };
        let right = match eval_right_on {
            Some(contexts) => {
                let phi = self.lift(contexts, state.lookback_len)?;
                Some(evaluate_eigenfunction(phi.view(), decomposition.right.view())?)
            }
            None => None,
        };
        Ok(EigenfunctionValues { eigenvalues: decomposition.eigenvalues, left, right })
    }

    /// Modes of an observable at the given initial conditions, shape
    /// (numerical_rank, n_init, obs_dim). `observables` defaults to the state.
    pub fn modes(
        &self,
        contexts: ArrayView3<f64>,
        observables: Option<ArrayView2<f64>>,
    ) -> Result<ModeDecomposition> {
        let state = self.fitted()?;
        let phi_init = self.lift(contexts, state.lookback_len)?;
        let observables = observables
            .map(|o| o.reborrow())
            .unwrap_or_else(|| state.lookforward_states.view());
        if observables.nrows() != state.phi_x.nrows() {
            return Err(KoopmanError::DimensionMismatch(format!(
                "{} observable rows for {} training points",
                observables.nrows(),
                state.phi_x.nrows()
            )));
        }
        let ModeDecomposition { eigenvalues, modes } = estimator_modes(
            state.projection.active_view(),
            state.cov_xy.view(),
            state.phi_x.view(),
            phi_init.view(),
        )?;

        let observables = to_complex(observables);
        let (rank, n_init, _) = modes.dim();
        let mut contracted = Array3::<c64>::zeros((rank, n_init, observables.ncols()));
        for (mode, mut out) in modes.axis_iter(Axis(0)).zip(contracted.axis_iter_mut(Axis(0))) {
            out.assign(&mode.dot(&observables));
        }
        Ok(ModeDecomposition { eigenvalues, modes: contracted })
    }

    /// Singular values of the fitted operator.
    pub fn svals(&self) -> Result<Array1<f64>> {
        let state = self.fitted()?;
        svdvals(state.projection.view(), state.cov_xy.view())
    }

    /// Writes the configuration and fitted state with bincode.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| {
            let path = path.as_ref();
            KoopmanError::Persistence(format!("failed to create file at {:?}: {}", path, e))
        })?;
        let mut writer = BufWriter::new(file);
        let saved = SavedModel { config: self.config.clone(), state: self.state.clone() };
        bincode::serde::encode_into_std_write(&saved, &mut writer, bincode::config::standard())
            .map_err(|e| {
                KoopmanError::Persistence(format!("failed to serialize regressor: {}", e))
            })?;
        Ok(())
    }

    /// Reads a regressor written by [`save_model`](Self::save_model). The
    /// feature map is not serialized and must match the one used for fitting.
    pub fn load_model<P: AsRef<Path>>(path: P, feature_map: F) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            KoopmanError::Persistence(format!("failed to open file at {:?}: {}", path.as_ref(), e))
        })?;
        let mut reader = BufReader::new(file);
        let saved: SavedModel =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| {
                    KoopmanError::Persistence(format!("failed to deserialize regressor: {}", e))
                })?;
        if let Some(state) = saved.state.as_ref() {
            state.validate()?;
        }
        Ok(PrimalRegressor { config: saved.config, feature_map, state: saved.state })
    }
}
