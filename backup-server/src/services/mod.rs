pub mod backup_scheduler;
pub mod operation_pruner;
