//! Instance builders: the controllers that translate one level of
//! intent into the next one down.

pub mod lb;
pub mod machine;
pub mod node;
pub mod node_set;
pub mod pool;
pub mod volume;

pub use lb::LbBuilder;
pub use machine::MachineBuilderService;
pub use node::NodeBuilder;
pub use node_set::NodeSetBuilder;
pub use pool::PoolBuilder;
pub use volume::VolumeBuilder;
