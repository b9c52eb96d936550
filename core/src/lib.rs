//! Rao-Blackwellized particle filter SLAM for multibeam echosounder surveys
//!
//! This crate localizes an underwater vehicle against the seabed it is mapping. Each particle carries a 6-DOF
//! trajectory hypothesis together with its own probabilistic terrain map, so the joint posterior over trajectory and
//! map factorizes into sampled trajectories and per-particle map estimates. Odometry moves the particles, multibeam
//! pings are scored against each particle's map, and particles whose maps disagree with the sonar are replaced by
//! copies of those that agree.
//!
//! The filter is driven by two message streams: odometry (pose and twist, which triggers prediction) and pings
//! (a fan of beams in the sonar frame, which triggers the next measurement update). Offline, both streams are replayed
//! from CSV logs through [`messages::EventStream`]; the `rbpf-slam` binary wraps that replay and a synthetic survey
//! generator behind a command-line interface.
//!
//! ## Crate overview
//!
//! - [geometry]: pose vectors, Euler/quaternion conversion, homogeneous transforms, angle wrapping.
//! - [linalg]: matrix square roots, SPD inversion with jitter, the diagonal Gaussian log-likelihood.
//! - [resampling]: naive (multinomial), systematic, stratified, and residual resampling.
//! - [particle]: the particle itself: motion model, ping history, map handle, background retraining.
//! - [ancestry]: lineage tree that keeps every particle's history reconstructable across resampling.
//! - [map_model]: the map interface (fit, predict, save, load) and a sparse Gaussian-process backend.
//! - [beams]: the beam simulator interface and a triangle-mesh ray caster with a sound speed profile.
//! - [transforms]: static frame transforms between map, odom, vehicle, and sonar.
//! - [messages]: odometry and ping messages, CSV logs, and the merged event stream.
//! - [config]: filter configuration, read from JSON, YAML, or TOML.
//! - [rbpf]: the orchestrator driving predict, update, resample, and publish.
//! - [archive]: on-demand export of reconstructed trajectories and maps.
//! - [sim]: lawnmower survey generation over a synthetic seabed.
//! - [error]: error types for every fallible concern.
//!
//! ## Frames and pose convention
//!
//! Poses are `[x, y, z, roll, pitch, yaw]` in the map frame with z up. The attitude is the intrinsic Z-Y-X rotation
//! $R = R_z(\psi) R_y(\theta) R_x(\phi)$. A sonar pose in the map frame is
//!
//! $$
//! T^{map}_{sonar} = T^{map}_{odom} \, T^{odom}_{base}(x) \, T^{base}_{sonar}
//! $$
//!
//! where the outer two transforms are static and resolved once at start-up.
//!
//! ## Motion model
//!
//! For an odometry twist $(v, \omega)$ over $dt$ and a process noise draw $n \sim N(0, Q)$:
//!
//! $$
//! \Theta_{k+1} = \mathrm{wrap}(\Theta_k + \omega \, dt + n_{\Theta}), \quad
//! p_{k+1} = p_k + R(\Theta_{k+1}) \, v \, dt + n_p
//! $$
//!
//! ## Weighting and resampling
//!
//! Beams are placed in the map with the sonar pose recorded at ping time and compared against the particle map's
//! predictive mean $\mu$ and variance $\sigma^2$ at the same $(x, y)$:
//!
//! $$
//! \ell = -\frac{1}{2} \sum_i \left( \log 2\pi s_i + \frac{(\mu_i - z_i)^2}{s_i} \right), \quad s_i = \sigma_i^2 + \sigma_{meas}^2
//! $$
//!
//! and the particle weight is $w = |1 / \ell|$. After normalization the effective sample size
//! $N_{eff} = 1 / \sum w_i^2$ enters a three-sample moving average; the filter resamples when that average drops below
//! $N/2$ and at most half the particles missed the ping.

pub mod ancestry;
pub mod archive;
pub mod beams;
pub mod config;
pub mod error;
pub mod geometry;
pub mod linalg;
pub mod map_model;
pub mod messages;
pub mod particle;
pub mod rbpf;
pub mod resampling;
pub mod sim;
pub mod transforms;

pub use config::RbpfConfig;
pub use geometry::PoseVector;
pub use map_model::{MapModel, SparseGpMap};
pub use particle::{Particle, ParticleId};
pub use rbpf::{FilterOutput, RbpfSlam};
