pub mod consume;
pub mod migrate;
pub mod recent;

pub use consume::{ConsumeArgs, handle_consume};
pub use migrate::handle_migrate;
pub use recent::handle_recent;
