//! Regression discontinuity.
//!
//! Sharp and fuzzy designs are estimated by kernel-weighted local linear
//! regression on each side of the cutpoint, at a fixed bandwidth or the
//! Imbens–Kalyanaraman plug-in bandwidth.

pub mod bandwidth;
pub mod estimate;
pub mod kernel;
pub mod plot;

pub use bandwidth::{IkBandwidth, ik_bandwidth, ik_bandwidth_details};
pub use estimate::{
    BandwidthChoice, LocalFit, RdAnalysis, RdData, RdDesign, RdEstimate, ZEstimate, rd_estimate,
    rd_estimate_at, rd_estimates,
};
pub use kernel::kernel_weights;
pub use plot::{BinnedMean, FittedLines, Side, binned_means, fitted_lines};
