mod loader;
mod reload;
mod types;

pub use loader::load_from_path;
pub use reload::spawn_reload_task;
pub use types::Config;
