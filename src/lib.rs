pub mod driver;
pub mod error;
pub mod math;
pub mod options;
pub mod restrictions;
pub mod types;
pub mod workspace;

mod gradients;
mod lattice;
mod stages;

pub use driver::{
    compute, compute_alphas, compute_alphas_sparse, compute_betas, compute_betas_sparse,
    compute_in_place, compute_sparse, compute_sparse_in_place,
};
pub use error::TransducerError;
pub use options::{BackendKind, Options};
pub use restrictions::AlignmentBand;
pub use types::{DenseBatch, LogProbPair, Scalar, SparseBatch};
pub use workspace::{Workspace, WorkspaceViews};
