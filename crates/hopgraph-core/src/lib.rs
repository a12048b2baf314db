pub mod errors;
pub mod model;
pub mod plan;
pub mod query;
pub mod schema;
pub mod util;

pub use errors::*;
pub use model::*;
pub use plan::*;
pub use query::*;
pub use schema::*;
