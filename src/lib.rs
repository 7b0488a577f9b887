pub mod arcgis;
pub mod backup;
pub mod config;
pub mod db;
pub mod logging;
pub mod mail;
pub mod model;
pub mod notifier;
pub mod template;
