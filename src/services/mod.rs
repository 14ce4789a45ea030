pub mod metrics;
pub mod node_types;
pub mod paging;
pub mod tenants;
pub mod users;
