// modax: supervisory control core for networked CNC machines
pub mod config;
pub mod coordinator;
pub mod gcode;
pub mod job;
pub mod motion;
pub mod safety;
pub mod tooling;
pub mod transport;
pub mod web;
