pub(crate) mod arena;
pub(crate) mod bins;
pub(crate) mod buddy;
pub(crate) mod cells;
pub(crate) mod context;
pub(crate) mod debug;
pub(crate) mod integration;
pub(crate) mod large;
pub(crate) mod loom_tests;
pub(crate) mod pool;
pub(crate) mod stats;
pub(crate) mod vm;
