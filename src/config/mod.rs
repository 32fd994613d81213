mod membership;

pub use membership::ClusterMembership;
pub use membership::ConfigError;
pub use membership::HubConfig;
pub use membership::MemberConfig;
