mod app;
pub mod command;

pub use app::add_routes;
