//! Regression models.
//!
//! Formulas are parsed into terms, expanded into a [`DesignMatrix`] with
//! listwise deletion, and fitted by least squares ([`lm`]) or logistic
//! IRLS ([`glm_logit`]).

pub mod covariance;
pub mod design;
pub mod formula;
pub mod logit;
pub mod ols;

pub use covariance::VcovKind;
pub use design::{DesignMatrix, INTERCEPT};
pub use formula::{Formula, Term, TermPart};
pub use logit::{LogitModel, fit_logit, glm_logit};
pub use ols::{AbsorbedEffect, Coefficient, FTest, LinearModel, LmOptions, OlsOptions, fit_ols, lm};
