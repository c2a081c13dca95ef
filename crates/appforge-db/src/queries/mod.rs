pub mod apps;
pub mod creation_tasks;
pub mod task_logs;
