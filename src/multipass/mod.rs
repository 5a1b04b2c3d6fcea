// src/multipass/mod.rs
//
// Generation split into passes, where a pass on one column may read and
// write the columns around it.
//
// Each pass after the first is split into two subpasses. The first runs the
// pass once the neighborhood finished the previous pass. The second only
// waits for the neighborhood to be done with this pass, so no other column
// can still write into this one afterwards.

mod block_task;
mod column_task;
mod generator;
mod priority;
mod structs;

pub use block_task::{BlockOutcome, BlockOutput, BlockTaskParams, GenerateBlockTask};
pub use generator::{MultipassGenerator, PassGenerator, ViewerId};
pub use priority::{PriorityDependency, SharedViewers};
pub use structs::{
    pass_index_from_subpass, subpass_count_from_pass_count, DebugColumnState, MultipassParams, Pass,
    PassInput,
};
