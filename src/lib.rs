pub mod apis;
pub mod catalog;
pub mod cloudprovider;
pub mod config;
pub mod controller;
pub mod health;
pub mod infrastructure;
pub mod instance_type;
pub mod labels;
pub mod offering;
pub mod requirements;
pub mod resolver;
pub mod resources;
