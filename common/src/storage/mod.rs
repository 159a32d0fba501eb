pub mod db;
pub mod indexes;
pub mod repository;
pub mod types;
