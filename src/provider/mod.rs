//! Providers and provisioners.
//!
//! Providers perform the external create, update and delete calls for
//! resource types; provisioners run commands against instances right
//! after they are created.

mod interface;
mod null;
mod provisioner;
mod registry;

pub use interface::{Provider, ProviderFailure, ProviderResult, ResourceSnapshot};
pub use null::NullProvider;
pub use provisioner::{
    CommandOutput, LocalExecutor, ProvisionOutcome, ProvisionerExecutor, ProvisionerRunner,
};
pub use registry::ProviderSet;

#[cfg(test)]
pub use provisioner::MockProvisionerExecutor;
