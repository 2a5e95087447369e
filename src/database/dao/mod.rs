pub mod installed_plugins;
pub mod settings;
