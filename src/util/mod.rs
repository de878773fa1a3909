pub mod db;
pub mod env;
pub mod process;
