//! Graph transformation passes.

mod auto_sharding;
mod consolidate_attributes;
mod control_flow_sink;
mod dedupe_hoist_constant;
mod drop_output_shapes;
mod eliminate_passthrough_iter_args;
mod functional_to_region;
mod graph_to_func;
mod remapper;
mod shape_inference;
mod topo_sort;

pub use auto_sharding::{AutoShardingPass, REPLICATED, ReplicateSolver, ShardingSolver};
pub use consolidate_attributes::{ConsolidateAttributesPass, PrepareAttributesForExportPass};
pub use control_flow_sink::ControlFlowSinkPass;
pub use dedupe_hoist_constant::{DedupeAndHoistConstantPass, DedupeOptions};
pub use drop_output_shapes::DropOutputShapesAttrPass;
pub use eliminate_passthrough_iter_args::EliminatePassthroughIterArgsPass;
pub use functional_to_region::FunctionalToRegionPass;
pub use graph_to_func::{GraphToFuncOptions, GraphToFuncPass};
pub use remapper::{
    ContractionBiasActivation, Fusion, Mish, RemapperOptions, RemapperPass, RewriteRule, Swish,
};
pub use shape_inference::{ShapeInferenceOptions, ShapeInferencePass};
pub use topo_sort::TopoSortPass;
