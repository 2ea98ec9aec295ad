// The changes suggested by this lint usually make the code more cluttered and less clear:
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

pub mod connect;
pub mod error;
pub mod graph;
pub mod output;
pub mod reduce;
pub mod requirement;
pub mod settings;
pub mod traverse;

pub use connect::{build_graph, connect_everything, ConnectSummary, Validators};
pub use error::{RouterError, ValidationFailure};
pub use graph::{ChangeLogEntry, Graph, NodeId, NodeSet};
pub use settings::RouterConfig;
