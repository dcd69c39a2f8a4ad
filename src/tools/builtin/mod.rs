//! Built-in tools for filesystem, shell, git and task-queue access.

pub mod database;
pub mod file;
pub mod git;
pub mod shell;

pub use database::DatabaseTool;
pub use file::FilesystemTool;
pub use git::GitTool;
pub use shell::ShellTool;
