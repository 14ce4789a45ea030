pub mod node_type;
pub mod tenant;
pub mod user;
