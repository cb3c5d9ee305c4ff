//! Core of a local browser-automation agent.
//!
//! An operator types a natural-language command; [`Brain`] perceives the
//! page, consults its memory, asks a local model what to do and acts through
//! a [`PageHandle`] with humanlike input.

pub mod ads;
pub mod brain;
pub mod browser;
pub mod config;
pub mod decision;
pub mod doctoralia;
pub mod error;
pub mod interpreter;
pub mod llm;
pub mod memory;
pub mod motion;
pub mod page;
pub mod perception;
pub mod synthesis;
pub mod tools;

pub use brain::{Brain, CycleReport};
pub use config::AgentConfig;
pub use decision::Decision;
pub use error::{Error, Result};
pub use interpreter::{ActionInterpreter, ToolResult};
pub use llm::OllamaClient;
pub use memory::MemoryStore;
pub use motion::HumanMouse;
pub use page::PageHandle;
pub use perception::DomObserver;
pub use tools::ToolRegistry;
