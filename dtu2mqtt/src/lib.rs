// externally visible interfaces
pub mod dtu_client;
pub mod entities;
pub mod home_assistant;
pub mod mqtt_config;
pub mod mqtt_wrapper;
pub mod plant_data;
pub mod production;
pub mod query_job;
