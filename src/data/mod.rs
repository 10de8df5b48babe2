pub mod dataset;
pub mod encoder;
pub mod index;
pub mod info;
pub mod interactions;
pub mod reader;
pub mod schema;

pub use dataset::{Dataset, DatasetStats};
pub use encoder::{build_and_encode, build_info, encode};
pub use index::{CategoricalFeatureIndex, IdentifierIndex, UNKNOWN_INDEX};
pub use info::{DatasetInfo, FeatureColumn, SideFeatureTable, DATASET_INFO_VERSION};
pub use interactions::{InteractionMatrix, Merge};
pub use reader::RawTable;
pub use schema::{ColumnRef, ColumnRoles, FeatureSide};
