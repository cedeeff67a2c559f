mod application;
mod environment;
mod site;

pub use application::*;
pub use environment::*;
pub use site::*;
