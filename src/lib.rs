//! output-tool: capture a command's output, flag `file:line:col` references and review
//! them in a terminal pager that opens the selected location in an editor.

pub mod capture;
mod cli;
pub mod cleanup;
pub mod config;
pub mod editor;
pub mod execcap;
pub mod launcher;
pub mod rules;
pub mod terminal;
pub mod text;
pub mod viewer;

pub use cli::{run, DynError};
