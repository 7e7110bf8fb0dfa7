pub mod app_state;
pub mod dispatcher;
pub mod gcs;
pub mod io_struct;
pub mod job_store;
pub mod pipeline;
pub mod project_pool;
pub mod scheduler;
pub mod server;
pub mod vertex;
