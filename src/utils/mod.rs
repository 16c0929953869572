pub mod raii_mutex_table;
