pub mod backend;
pub mod errors;
pub mod factory;
pub mod local;
pub mod remote;

pub use backend::{AppBackend, BackfillRequest, CorpusStatus};
pub use errors::AppError;
pub use factory::AppFactory;
pub use local::AppLocal;
