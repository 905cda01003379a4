//! # Registry Infrastructure
//!
//! Handler lookup for task execution. Task names resolve to [`TaskHandler`]
//! implementations registered by the embedding application.

pub mod task_handler_registry;

pub use task_handler_registry::{
    FnHandler, RegistryStats, TaskContext, TaskHandler, TaskHandlerRegistry,
};
