mod node;
mod pool;

pub use node::{Node, NodeConfig};
pub use pool::NodePool;
