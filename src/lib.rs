#[cfg(not(target_pointer_width = "64"))]
compile_error!("cellar supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate)
pub mod memory;

// context façade + config
pub use memory::context::{AllocError, Context, ContextConfig};

// collaborators built on the context
pub use memory::arena::{Arena, ArenaMarker, ArenaScope};
pub use memory::pool::Pool;

// whole-cell / layout constants clients may need
pub use memory::cells::{CELL_PAYLOAD_OFFSET, CELL_SIZE};

// telemetry
#[cfg(feature = "instrumentation")]
pub use memory::context::AllocEvent;
#[cfg(feature = "stats")]
pub use memory::stats::StatsSnapshot;

// errors
pub use memory::vm::VmError;
