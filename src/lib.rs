pub mod local_interface;
pub mod provisioning;
pub mod provisioning_settings;
pub mod usrtcp232;

pub use provisioning::*;
pub use provisioning_settings::*;
